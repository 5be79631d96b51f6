use chainfile::{Block, BlockDraft, Chain};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

fn draft(tag: &str, i: u32) -> BlockDraft {
    BlockDraft::new(format!("file-{tag}-{i}").into_bytes(), 1, vec![0x5A; 500], 0).unwrap()
}

/// Shared prefix of `common`, then a local tail of `ours` and a foreign
/// suffix of `theirs` — the worst case for a merge (full unwind + re-append).
fn forked(common: u32, ours: u32, theirs: u32) -> (Chain, Vec<Block>) {
    let mut local = Chain::new();
    let mut remote = Chain::new();
    for i in 0..common {
        local.insert_block(draft("common", i)).unwrap();
        remote.insert_block(draft("common", i)).unwrap();
    }
    for i in 0..ours {
        local.insert_block(draft("ours", i)).unwrap();
    }
    let mut suffix = Vec::with_capacity(theirs as usize);
    for i in 0..theirs {
        suffix.push(remote.insert_block(draft("theirs", i)).unwrap().clone());
    }
    (local, suffix)
}

fn bench_insert(c: &mut Criterion) {
    c.bench_function("insert 1000 single-chunk blocks", |b| {
        b.iter(|| {
            let mut chain = Chain::new();
            for i in 0..1000 {
                chain.insert_block(draft("insert", i)).unwrap();
            }
            black_box(chain.len())
        })
    });
}

fn bench_verify(c: &mut Criterion) {
    let mut chain = Chain::new();
    for i in 0..1000 {
        chain.insert_block(draft("verify", i)).unwrap();
    }
    c.bench_function("verify integrity of a 1000-block chain", |b| {
        b.iter(|| black_box(chain.verify_integrity()))
    });
}

fn bench_merge(c: &mut Criterion) {
    c.bench_function("merge 100-block suffix over a 50-block fork", |b| {
        b.iter_batched(
            || forked(20, 50, 100),
            |(mut local, suffix)| {
                black_box(local.merge_blocks(suffix).unwrap());
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_insert, bench_verify, bench_merge);
criterion_main!(benches);
