// vim: tw=80
use criterion::{
    BenchmarkId,
    Criterion,
    Throughput,
    black_box,
    criterion_group,
    criterion_main
};
use rand::{RngCore, SeedableRng};
use rand_xorshift::XorShiftRng;
use raidcore::raid::codec::{EvenOddCodec, combine};

/// A typical stripe unit: 8 sectors of 512 bytes
const LEN: usize = 4096;

fn random_columns(n: usize) -> Vec<Vec<u8>> {
    let mut rng = XorShiftRng::seed_from_u64(42);
    (0..n).map(|_| {
        let mut v = vec![0u8; LEN];
        rng.fill_bytes(&mut v);
        v
    }).collect()
}

fn xor(c: &mut Criterion) {
    let mut g = c.benchmark_group("combine");
    for n in [2, 3, 4, 9, 16] {
        let srcs = random_columns(n);
        let refs = srcs.iter().map(|v| &v[..]).collect::<Vec<_>>();
        let mut dest = vec![0u8; LEN];
        g.throughput(Throughput::Bytes((n * LEN) as u64));
        g.bench_with_input(BenchmarkId::from_parameter(n), &refs, |b, refs| {
            b.iter(|| combine(black_box(&mut dest[..]), refs))
        });
    }
    g.finish();
}

fn evenodd(c: &mut Criterion) {
    let mut g = c.benchmark_group("evenodd");
    for k in [3, 8, 15] {
        let data = random_columns(k);
        let refs = data.iter().map(|v| &v[..]).collect::<Vec<_>>();
        let codec = EvenOddCodec::new(k, LEN);
        let mut row = vec![0u8; LEN];
        let mut diag = vec![0u8; LEN];
        g.throughput(Throughput::Bytes((k * LEN) as u64));
        g.bench_with_input(BenchmarkId::new("encode", k), &refs, |b, refs| {
            b.iter(|| codec.encode(refs, &mut row, &mut diag))
        });
    }
    g.finish();
}

criterion_group!(benches, xor, evenodd);
criterion_main!(benches);
