// End-to-end consensus benchmarks over synthetic tilings.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use tigcns::aligner::{DpAligner, TraceAligner};
use tigcns::unitig::{multi_align_unitig, LayoutRead, UnitigLayout};
use tigcns::CnsOptions;

/// Deterministic pseudo-random reference (no external RNG needed).
fn synthetic_reference(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            match (state >> 33) & 3 {
                0 => b'A',
                1 => b'C',
                2 => b'G',
                _ => b'T',
            }
        })
        .collect()
}

fn tiled_layout(reference: &[u8], read_len: usize, step: usize) -> UnitigLayout {
    let mut reads = Vec::new();
    let mut iid = 0;
    let mut at = 0;
    loop {
        iid += 1;
        reads.push(LayoutRead {
            iid,
            bases: reference[at..at + read_len].to_vec(),
            quals: vec![b'0' + 30; read_len],
            begin: at as i32,
            end: (at + read_len) as i32,
        });
        if at + read_len == reference.len() {
            break;
        }
        at = (at + step).min(reference.len() - read_len);
    }
    UnitigLayout { iid: 1, reads }
}

fn bench_unitig_consensus(c: &mut Criterion) {
    let mut group = c.benchmark_group("unitig_consensus");

    for &ref_len in &[500usize, 2_000] {
        let reference = synthetic_reference(ref_len, 42);
        let layout = tiled_layout(&reference, 100, 25);
        let opt = CnsOptions::default();

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{ref_len}bp_{}reads", layout.reads.len())),
            &layout,
            |b, layout| {
                b.iter(|| {
                    let dp = DpAligner;
                    let aligners: [&dyn TraceAligner; 1] = [&dp];
                    multi_align_unitig(layout, &aligners, &opt).unwrap()
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_unitig_consensus);
criterion_main!(benches);
