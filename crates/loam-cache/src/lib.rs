#![forbid(unsafe_code)]
//! Transactional extent cache with copy-on-write promotion.
//!
//! The cache owns every live extent, keyed by absolute physical address.
//! Within a transaction an extent is either *committed* (read-only) or
//! *pending* (mutable, owned by that transaction). Mutation goes through
//! [`ExtentCache::duplicate_for_write`], which produces a pending twin at
//! the same address; the twin shadows the committed version for the rest
//! of the transaction and replaces it at commit.
//!
//! Pins are a back-index, not ownership: they link an extent to the
//! transaction that depends on it. Pinning is idempotent and cleared when
//! the extent is retired or dropped.
//!
//! Reads take a `&Cx` capability context and checkpoint before touching
//! the store; a cache miss is the canonical suspension point of every
//! tree operation.

use asupersync::Cx;
use loam_error::{LoamError, Result};
use loam_types::{Laddr, LbaTreeStats, Paddr, TxnId};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| LoamError::Cancelled)
}

/// Typed contents of a cached extent.
///
/// The cache is payload-agnostic; the tree instantiates it with its own
/// node/data sum type. Cloning backs copy-on-write promotion and rewrite.
pub trait ExtentPayload: Clone + Send + Sync + fmt::Debug + 'static {
    /// Occupied length in bytes.
    fn length(&self) -> u32;
}

/// Lifecycle state of a cached extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentState {
    /// Visible to every transaction, read-only.
    Clean,
    /// Mutable within the owning transaction only.
    Pending,
    /// Staged for deallocation at commit.
    Retired,
}

#[derive(Debug, Clone, Copy, Default)]
struct ExtentPin {
    linked: bool,
    range: Option<(Laddr, Laddr)>,
}

// ── Cached extents ──────────────────────────────────────────────────────────

/// One cached block: address, state, pin linkage, and typed payload.
#[derive(Debug)]
pub struct CachedExtent<P> {
    paddr: Paddr,
    length: u32,
    state: Mutex<ExtentState>,
    pin: Mutex<ExtentPin>,
    payload: RwLock<P>,
}

/// Shared handle to a cached extent.
pub type ExtentRef<P> = Arc<CachedExtent<P>>;

impl<P: ExtentPayload> CachedExtent<P> {
    fn new(paddr: Paddr, payload: P, state: ExtentState) -> Self {
        let length = payload.length();
        Self {
            paddr,
            length,
            state: Mutex::new(state),
            pin: Mutex::new(ExtentPin::default()),
            payload: RwLock::new(payload),
        }
    }

    #[must_use]
    pub fn paddr(&self) -> Paddr {
        self.paddr
    }

    #[must_use]
    pub fn length(&self) -> u32 {
        self.length
    }

    #[must_use]
    pub fn state(&self) -> ExtentState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state() == ExtentState::Pending
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.state() == ExtentState::Retired
    }

    /// Whether this extent is linked into a transaction's pin set.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.pin.lock().linked
    }

    /// Record the logical range this extent pins.
    pub fn set_pin_range(&self, begin: Laddr, end: Laddr) {
        self.pin.lock().range = Some((begin, end));
    }

    #[must_use]
    pub fn pin_range(&self) -> Option<(Laddr, Laddr)> {
        self.pin.lock().range
    }

    /// Read the payload under a short-lived borrow.
    pub fn with_payload<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        f(&self.payload.read())
    }

    /// Mutate the payload. Legal only on pending extents.
    pub fn with_payload_mut<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        assert!(
            self.is_pending(),
            "mutation of non-pending extent at {}",
            self.paddr
        );
        f(&mut self.payload.write())
    }

    fn set_state(&self, state: ExtentState) {
        *self.state.lock() = state;
    }

    fn unlink_pin(&self) {
        self.pin.lock().linked = false;
    }

    fn link_pin(&self) -> bool {
        let mut pin = self.pin.lock();
        let was_linked = pin.linked;
        pin.linked = true;
        !was_linked
    }
}

// ── Transactions ────────────────────────────────────────────────────────────

/// Per-transaction mutation state: fresh allocations, pending shadows of
/// committed extents, retirements, the pin set, and tree statistics.
#[derive(Debug)]
pub struct Transaction<P> {
    id: TxnId,
    inner: Mutex<TxInner<P>>,
}

#[derive(Debug)]
struct TxInner<P> {
    /// Extents allocated by this transaction, keyed by absolute address.
    fresh: HashMap<u64, ExtentRef<P>>,
    /// Pending duplicates shadowing committed extents at the same address.
    shadows: HashMap<u64, ExtentRef<P>>,
    /// Extents staged for deallocation at commit.
    retired: HashMap<u64, ExtentRef<P>>,
    /// Pin set: committed extents this transaction depends on.
    pins: HashMap<u64, ExtentRef<P>>,
    stats: LbaTreeStats,
}

impl<P: ExtentPayload> Transaction<P> {
    fn new(id: TxnId) -> Self {
        Self {
            id,
            inner: Mutex::new(TxInner {
                fresh: HashMap::new(),
                shadows: HashMap::new(),
                retired: HashMap::new(),
                pins: HashMap::new(),
                stats: LbaTreeStats::default(),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    #[must_use]
    pub fn tree_stats(&self) -> LbaTreeStats {
        self.inner.lock().stats
    }

    /// Mutable access to the transaction's tree statistics.
    pub fn tree_stats_mut(&self) -> MappedMutexGuard<'_, LbaTreeStats> {
        MutexGuard::map(self.inner.lock(), |inner| &mut inner.stats)
    }

    /// Link `extent` into this transaction's pin set. Idempotent.
    pub fn add_pin(&self, extent: &ExtentRef<P>) {
        let Some(block) = extent.paddr().as_absolute() else {
            return;
        };
        if extent.link_pin() {
            trace!(
                target: "loam::cache",
                event = "pin_add",
                txn = %self.id,
                paddr = %extent.paddr()
            );
            self.inner.lock().pins.insert(block, Arc::clone(extent));
        }
    }

    #[must_use]
    pub fn pinned_extents(&self) -> usize {
        self.inner.lock().pins.len()
    }

    fn remove_pin(&self, block: u64) {
        if let Some(extent) = self.inner.lock().pins.remove(&block) {
            extent.unlink_pin();
        }
    }

    fn view(&self, block: u64) -> Option<ExtentRef<P>> {
        let inner = self.inner.lock();
        inner
            .fresh
            .get(&block)
            .or_else(|| inner.shadows.get(&block))
            .map(Arc::clone)
    }

    fn is_retired(&self, block: u64) -> bool {
        self.inner.lock().retired.contains_key(&block)
    }
}

// ── The cache ───────────────────────────────────────────────────────────────

/// In-memory transactional extent store.
///
/// Allocation is a bump allocator over absolute block ids; read-through
/// from disk is out of scope, so `get_extent` resolves entirely from the
/// committed map plus the transaction's pending view.
#[derive(Debug)]
pub struct ExtentCache<P> {
    block_size: u32,
    inner: Mutex<CacheInner<P>>,
}

#[derive(Debug)]
struct CacheInner<P> {
    committed: HashMap<u64, ExtentRef<P>>,
    next_block: u64,
    next_txn: u64,
}

impl<P: ExtentPayload> ExtentCache<P> {
    #[must_use]
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            inner: Mutex::new(CacheInner {
                committed: HashMap::new(),
                next_block: 1,
                next_txn: 1,
            }),
        }
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Open a new transaction against this cache.
    pub fn begin_transaction(&self) -> Transaction<P> {
        let mut inner = self.inner.lock();
        let id = TxnId(inner.next_txn);
        inner.next_txn += 1;
        trace!(target: "loam::cache", event = "txn_begin", txn = %id);
        Transaction::new(id)
    }

    /// Allocate a new extent. Always returns a pending extent owned by
    /// `tx`, at a fresh absolute address.
    pub fn alloc_new_extent(&self, tx: &Transaction<P>, payload: P) -> ExtentRef<P> {
        let block = {
            let mut inner = self.inner.lock();
            let block = inner.next_block;
            inner.next_block += 1;
            block
        };
        let extent = Arc::new(CachedExtent::new(
            Paddr::Absolute(block),
            payload,
            ExtentState::Pending,
        ));
        trace!(
            target: "loam::cache",
            event = "extent_alloc",
            txn = %tx.id(),
            paddr = block,
            len = extent.length()
        );
        tx.inner.lock().fresh.insert(block, Arc::clone(&extent));
        extent
    }

    /// Read an extent by physical address. May suspend.
    ///
    /// The transaction's pending view shadows the committed map, so a
    /// node duplicated for write earlier in the transaction is observed
    /// by every later descent.
    pub fn get_extent(&self, cx: &Cx, tx: &Transaction<P>, paddr: Paddr) -> Result<ExtentRef<P>> {
        cx_checkpoint(cx)?;
        let block = paddr.as_absolute().ok_or_else(|| {
            LoamError::InvalidAddress(format!("cannot read non-absolute address {paddr}"))
        })?;
        assert!(
            !tx.is_retired(block),
            "read of extent {paddr} retired by transaction {}",
            tx.id()
        );
        if let Some(extent) = tx.view(block) {
            return Ok(extent);
        }
        self.inner
            .lock()
            .committed
            .get(&block)
            .map(Arc::clone)
            .ok_or_else(|| LoamError::NotFound(format!("no extent at {paddr}")))
    }

    /// Promote an extent to pending, returning the mutable version.
    /// Idempotent on extents that are already pending in `tx`.
    pub fn duplicate_for_write(&self, tx: &Transaction<P>, extent: &ExtentRef<P>) -> ExtentRef<P> {
        if extent.is_pending() {
            return Arc::clone(extent);
        }
        let block = extent
            .paddr()
            .as_absolute()
            .expect("committed extent must have an absolute address");
        let twin = Arc::new(CachedExtent::new(
            extent.paddr(),
            extent.with_payload(Clone::clone),
            ExtentState::Pending,
        ));
        if let Some(range) = extent.pin_range() {
            twin.set_pin_range(range.0, range.1);
        }
        debug!(
            target: "loam::cache",
            event = "duplicate_for_write",
            txn = %tx.id(),
            paddr = %extent.paddr()
        );
        tx.inner.lock().shadows.insert(block, Arc::clone(&twin));
        twin
    }

    /// Stage `extent` for deallocation at commit and unlink its pin.
    pub fn retire_extent(&self, tx: &Transaction<P>, extent: &ExtentRef<P>) {
        let Some(block) = extent.paddr().as_absolute() else {
            return;
        };
        extent.set_state(ExtentState::Retired);
        tx.remove_pin(block);
        let mut inner = tx.inner.lock();
        inner.fresh.remove(&block);
        inner.shadows.remove(&block);
        inner.retired.insert(block, Arc::clone(extent));
        debug!(
            target: "loam::cache",
            event = "extent_retire",
            txn = %tx.id(),
            paddr = %extent.paddr()
        );
    }

    /// Evict a speculatively loaded extent that turned out not to be live.
    pub fn drop_from_cache(&self, extent: &ExtentRef<P>) {
        debug_assert!(!extent.is_pending(), "dropping a pending extent");
        let Some(block) = extent.paddr().as_absolute() else {
            return;
        };
        extent.unlink_pin();
        self.inner.lock().committed.remove(&block);
        debug!(
            target: "loam::cache",
            event = "extent_drop",
            paddr = %extent.paddr()
        );
    }

    /// Apply a transaction: retirements deallocate, pending extents become
    /// the committed versions, pins are released.
    pub fn commit(&self, tx: Transaction<P>) {
        let id = tx.id();
        let tx_inner = tx.inner.into_inner();
        let mut inner = self.inner.lock();
        for block in tx_inner.retired.keys() {
            inner.committed.remove(block);
        }
        let fresh = tx_inner.fresh.len();
        let shadows = tx_inner.shadows.len();
        for (block, extent) in tx_inner.fresh.into_iter().chain(tx_inner.shadows) {
            extent.set_state(ExtentState::Clean);
            inner.committed.insert(block, extent);
        }
        for extent in tx_inner.pins.into_values() {
            extent.unlink_pin();
        }
        debug!(
            target: "loam::cache",
            event = "txn_commit",
            txn = %id,
            fresh,
            shadows,
            retired = tx_inner.retired.len()
        );
    }

    /// Roll a transaction back: every pending duplicate is dropped and
    /// retirements are forgotten.
    pub fn discard(&self, tx: Transaction<P>) {
        let id = tx.id();
        let tx_inner = tx.inner.into_inner();
        for extent in tx_inner.retired.into_values() {
            extent.set_state(ExtentState::Clean);
        }
        for extent in tx_inner.pins.into_values() {
            extent.unlink_pin();
        }
        debug!(target: "loam::cache", event = "txn_discard", txn = %id);
    }

    /// Number of committed extents (test observability).
    #[must_use]
    pub fn committed_extents(&self) -> usize {
        self.inner.lock().committed.len()
    }

    #[must_use]
    pub fn contains(&self, paddr: Paddr) -> bool {
        paddr
            .as_absolute()
            .is_some_and(|block| self.inner.lock().committed.contains_key(&block))
    }
}

// ── Operation context ───────────────────────────────────────────────────────

/// Aggregates everything a tree operation needs: the cancellation
/// capability, the cache, and the transaction. Passed by value.
pub struct OpContext<'a, P> {
    pub cx: &'a Cx,
    pub cache: &'a ExtentCache<P>,
    pub tx: &'a Transaction<P>,
}

impl<P> Clone for OpContext<'_, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for OpContext<'_, P> {}
