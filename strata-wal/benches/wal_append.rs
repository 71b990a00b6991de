//! WAL append throughput benchmark.

use std::sync::Arc;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use strata_core::{Epoch, Offset, ShardId};
use strata_wal::{Entry, TokioStorage, Wal, WalConfig};

const PAYLOAD_SIZE: usize = 1024;
const ENTRIES_PER_ITER: i64 = 256;

fn bench_append(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build runtime");

    let mut group = c.benchmark_group("wal_append");
    group.throughput(Throughput::Bytes(
        (PAYLOAD_SIZE as u64) * (ENTRIES_PER_ITER as u64),
    ));

    for sync_on_append in [false, true] {
        let name = if sync_on_append {
            "sync_per_append"
        } else {
            "group_commit"
        };

        group.bench_function(name, |b| {
            b.iter_batched(
                || {
                    let dir = tempfile::tempdir().expect("tempdir");
                    let config = WalConfig::new(dir.path()).with_sync_on_append(sync_on_append);
                    let wal = runtime
                        .block_on(Wal::open(
                            Arc::new(TokioStorage::new()),
                            ShardId::new(0),
                            config,
                        ))
                        .expect("open wal");
                    (dir, wal)
                },
                |(dir, mut wal)| {
                    runtime.block_on(async {
                        let payload = Bytes::from(vec![0xA5u8; PAYLOAD_SIZE]);
                        for i in 0..ENTRIES_PER_ITER {
                            let entry =
                                Entry::new(Epoch::new(1), Offset::new(i), payload.clone())
                                    .expect("entry");
                            wal.append(entry).await.expect("append");
                        }
                        wal.sync().await.expect("sync");
                    });
                    drop(dir);
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_append);
criterion_main!(benches);
