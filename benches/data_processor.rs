use std::time::Instant;

use criterion::{BenchmarkId, Criterion, Throughput};
use polyudp::{
    data_processor::{AesDataProcessor, DataProcessor},
    secret::{deal_triples, simulated_sessions},
};
use tokio::runtime::Runtime;

pub fn data_processor_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut g = c.benchmark_group("data processor");
    for output_size in [16, 256] {
        g.throughput(Throughput::Elements(output_size as u64));
        g.bench_function(BenchmarkId::new("AES rows", output_size), |b| {
            b.to_async(&rt).iter_custom(|iters| {
                // setup outside of the measured future
                let rows: Vec<Vec<u8>> = (0..2 * output_size).map(|i| vec![i as u8; 32]).collect();
                let indexes: Vec<i64> = (0..output_size as i64).map(|i| 2 * i).collect();
                async move {
                    let now = Instant::now();
                    for _ in 0..iters {
                        let (s0, s1, dealer) = simulated_sessions();
                        let owner = async {
                            let r = AesDataProcessor::new(s0.clone())
                                .process_my_data(&rows, indexes.len())
                                .await;
                            s0.finish().await.expect("dealer is gone");
                            r
                        };
                        let picker = async {
                            let r = AesDataProcessor::new(s1.clone())
                                .process_peers_data(rows.len(), &indexes, 32)
                                .await;
                            s1.finish().await.expect("dealer is gone");
                            r
                        };
                        let (r0, r1, d) =
                            tokio::join!(owner, picker, deal_triples(&dealer, [0, 1]));
                        r0.expect("owner failed");
                        r1.expect("picker failed");
                        d.expect("dealer failed");
                    }
                    now.elapsed()
                }
            })
        });
    }
}
