use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use mesh_pitfill::algs::communicator::NoComm;
use mesh_pitfill::config::PitConfig;
use mesh_pitfill::pit::PitFiller;
use mesh_pitfill::topology::StructuredGrid;

fn terrain(grid: &StructuredGrid, seed: u64) -> Vec<f64> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..grid.node_count()).map(|_| rng.gen_range(0.0..100.0)).collect()
}

fn bench_serial_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("serial-fill");
    for &n in &[32usize, 64, 128] {
        let grid = StructuredGrid::new(n, n, 1.0).unwrap();
        let z = terrain(&grid, 42);
        let comm = NoComm;
        let mesh = grid.partition(1).unwrap().remove(0);
        let filler = PitFiller::new(mesh, &comm, PitConfig::default()).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(n), &z, |b, z| {
            b.iter(|| {
                let mut ctx = filler.context(z.clone());
                filler.fill(&mut ctx).unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_serial_fill);
criterion_main!(benches);
