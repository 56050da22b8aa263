//! Benchmark: descent and mutation cost at realistic node fan-out.
//!
//! Builds a tree under the default block-derived shape and measures
//! point lookups, boundary-crossing iteration, and insert throughput.

use asupersync::Cx;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use loam_btree::{LbaTree, TreeContext, TreeExtent};
use loam_cache::{ExtentCache, Transaction};
use loam_types::{LBA_BLOCK_SIZE, Laddr, LbaValue, Paddr, TreeShape};

const KEYS: u64 = 10_000;

fn build() -> (Cx, ExtentCache<TreeExtent>, Transaction<TreeExtent>, LbaTree) {
    let cx = Cx::for_testing();
    let cache = ExtentCache::new(LBA_BLOCK_SIZE);
    let tx = cache.begin_transaction();
    let shape = TreeShape::default();
    let root = {
        let ctx = TreeContext {
            cx: &cx,
            cache: &cache,
            tx: &tx,
        };
        LbaTree::mkfs(ctx, shape)
    };
    let mut tree = LbaTree::new(root, shape);
    for key in 0..KEYS {
        let ctx = TreeContext {
            cx: &cx,
            cache: &cache,
            tx: &tx,
        };
        let laddr = Laddr(key * 0x2000);
        let hint = tree.lower_bound(ctx, laddr).expect("lower_bound");
        tree.insert(ctx, hint, laddr, LbaValue::new(Paddr::Absolute(key + 1), 0x2000))
            .expect("insert");
    }
    (cx, cache, tx, tree)
}

fn bench_lower_bound(c: &mut Criterion) {
    let (cx, cache, tx, tree) = build();

    c.bench_function("lower_bound_10k", |b| {
        let mut key = 0_u64;
        b.iter(|| {
            key = (key + 7919) % KEYS;
            let ctx = TreeContext {
                cx: &cx,
                cache: &cache,
                tx: &tx,
            };
            let cursor = tree
                .lower_bound(ctx, Laddr(black_box(key * 0x2000)))
                .expect("lower_bound");
            black_box(cursor.key());
        });
    });
}

fn bench_sweep(c: &mut Criterion) {
    let (cx, cache, tx, tree) = build();

    c.bench_function("sweep_1k_entries", |b| {
        b.iter(|| {
            let ctx = TreeContext {
                cx: &cx,
                cache: &cache,
                tx: &tx,
            };
            let mut cursor = tree.begin(ctx).expect("begin");
            let mut visited = 0_u64;
            while visited < 1_000 && !cursor.is_end() {
                black_box(cursor.key());
                cursor = cursor.next(ctx).expect("next");
                visited += 1;
            }
            black_box(visited);
        });
    });
}

fn bench_insert_remove(c: &mut Criterion) {
    let (cx, cache, tx, mut tree) = build();

    c.bench_function("insert_then_remove", |b| {
        let mut probe = 1_u64;
        b.iter(|| {
            // Keys between the mapped grid so every round inserts fresh.
            let laddr = Laddr((probe % KEYS) * 0x2000 + 1);
            probe += 1;
            let ctx = TreeContext {
                cx: &cx,
                cache: &cache,
                tx: &tx,
            };
            let hint = tree.lower_bound(ctx, laddr).expect("lower_bound");
            let (cursor, inserted) = tree
                .insert(ctx, hint, laddr, LbaValue::new(Paddr::Absolute(probe), 1))
                .expect("insert");
            assert!(inserted);
            tree.remove(ctx, cursor).expect("remove");
        });
    });
}

criterion_group!(benches, bench_lower_bound, bench_sweep, bench_insert_remove);
criterion_main!(benches);
