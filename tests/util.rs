#![allow(dead_code)]
use mesh_pitfill::{
    algs::communicator::RayonComm,
    config::PitConfig,
    pit::{DepressionTable, FillOutcome, PitFiller, SedimentBalance, StepContext},
    algs::collective::SyncPoint,
    topology::{MeshPartition, StructuredGrid},
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Run `f` once per rank of a fresh in-process world, each on its own thread.
pub fn run_ranks<F, R>(n: usize, f: F) -> Vec<R>
where
    F: Fn(&RayonComm) -> R + Sync,
    R: Send,
{
    let comms = RayonComm::world(n);
    std::thread::scope(|s| {
        let handles: Vec<_> = comms.iter().map(|c| s.spawn(|| f(c))).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// `nx × ny` grid at `rim` with a plus-shaped pit at `floor` centred on `(cx, cy)`.
pub fn plus_pit(
    nx: usize,
    ny: usize,
    cx: usize,
    cy: usize,
    rim: f64,
    floor: f64,
) -> (StructuredGrid, Vec<f64>) {
    let grid = StructuredGrid::new(nx, ny, 1.0).unwrap();
    let mut z = vec![rim; grid.node_count()];
    for (i, j) in [(cx, cy), (cx - 1, cy), (cx + 1, cy), (cx, cy - 1), (cx, cy + 1)] {
        z[grid.natural(i, j)] = floor;
    }
    (grid, z)
}

/// Rough terrain with a gentle tilt; continuous values keep ties unlikely.
pub fn random_terrain(grid: &StructuredGrid, seed: u64) -> Vec<f64> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..grid.node_count())
        .map(|g| {
            let (i, j) = grid.position(g);
            0.05 * (i + j) as f64 + rng.gen_range(0.0..10.0)
        })
        .collect()
}

/// Terrain on a handful of integer heights, so flats and equal spills abound.
pub fn stepped_terrain(grid: &StructuredGrid, seed: u64, heights: u32) -> Vec<f64> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..grid.node_count())
        .map(|_| rng.gen_range(0..heights) as f64)
        .collect()
}

/// Random owner per node, with every rank owning at least one node.
pub fn random_owners(grid: &StructuredGrid, parts: usize, seed: u64) -> Vec<usize> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..grid.node_count())
        .map(|g| if g < parts { g } else { rng.gen_range(0..parts) })
        .collect()
}

/// What one rank saw after a fill, and optionally a deposit.
#[derive(Debug)]
pub struct RankOutput {
    pub mesh: MeshPartition,
    pub outcome: FillOutcome,
    pub ctx: StepContext,
    pub table: Option<DepressionTable>,
    pub balance: Option<SedimentBalance>,
    pub trace: Vec<SyncPoint>,
}

/// Fill `z` on every partition and, when `flux` is given, deposit it.
pub fn fill_partitions(
    grid: &StructuredGrid,
    parts: Vec<MeshPartition>,
    z: &[f64],
    flux: Option<&[f64]>,
    config: &PitConfig,
) -> Vec<RankOutput> {
    let n = parts.len();
    run_ranks(n, |c| {
        use mesh_pitfill::algs::communicator::Communicator;
        let mesh = parts[c.rank()].clone();
        let filler = PitFiller::new(mesh.clone(), c, config.clone()).unwrap();
        let mut ctx = filler.context(grid.restrict(&mesh, z));
        let outcome = filler.fill(&mut ctx).unwrap();
        let table = ctx.depressions.clone();
        let balance = flux.map(|f| {
            filler
                .deposit(&mut ctx, &grid.restrict(&mesh, f), 1.0)
                .unwrap()
        });
        RankOutput {
            mesh,
            outcome,
            ctx,
            table,
            balance,
            trace: filler.sync_trace(),
        }
    })
}

/// Assemble a natural-indexed global field from the owned entries of every rank.
pub fn gather_owned<T: Copy + Default>(
    grid: &StructuredGrid,
    outputs: &[RankOutput],
    field: impl Fn(&StepContext) -> &[T],
) -> Vec<T> {
    let mut global = vec![T::default(); grid.node_count()];
    for out in outputs {
        for (g, v) in out.mesh.owned_values(field(&out.ctx)) {
            global[g] = v;
        }
    }
    global
}

/// Ghost entries must match their owner's value exactly.
pub fn assert_ghosts_consistent(grid: &StructuredGrid, outputs: &[RankOutput]) {
    let filled = gather_owned(grid, outputs, |c| c.filled.as_slice());
    let pits = gather_owned(grid, outputs, |c| c.watershed.as_slice());
    for out in outputs {
        for i in 0..out.mesh.len() {
            let g = out.mesh.natural(i);
            assert_eq!(out.ctx.filled[i], filled[g], "ghost filled of node {g}");
            assert_eq!(out.ctx.watershed[i], pits[g], "ghost pit of node {g}");
        }
    }
}
