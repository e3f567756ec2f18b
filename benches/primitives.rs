use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput};
use polyudp::aes_ctr::{ExpandedKey, ctr_encrypt_rows};

pub fn primitives_benchmark(c: &mut Criterion) {
    let mut g = c.benchmark_group("primitives");
    g.bench_function("key expansion", |b| {
        b.iter(|| ExpandedKey::new(black_box([0x2b; 16])))
    });

    let key = ExpandedKey::random();
    for width in [16, 20, 64] {
        let rows: Vec<Vec<u8>> = (0..4096).map(|i| vec![i as u8; width]).collect();
        g.throughput(Throughput::Bytes((rows.len() * width) as u64));
        g.bench_function(BenchmarkId::new("CTR rows", width), |b| {
            b.iter(|| ctr_encrypt_rows(&key, black_box(&rows), width, 0))
        });
    }
}
