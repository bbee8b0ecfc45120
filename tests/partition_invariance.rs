//! The filled surface, the depression table and the sediment budget must not
//! depend on how the mesh is cut.
mod util;
use util::*;

use mesh_pitfill::config::PitConfig;
use mesh_pitfill::pit::DepressionRecord;
use mesh_pitfill::topology::{Adjacency, MeshPartition, StructuredGrid};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Partition-independent view of a depression.
fn summary(r: &DepressionRecord) -> (usize, f64, Option<usize>, Option<usize>, usize) {
    (r.id, r.elevation, r.spill_natural, r.target, r.node_count)
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

fn run(
    grid: &StructuredGrid,
    parts: Vec<MeshPartition>,
    z: &[f64],
    flux: Option<&[f64]>,
) -> Vec<RankOutput> {
    fill_partitions(grid, parts, z, flux, &PitConfig::default())
}

/// Strip cuts for every rank count in `ranks`.
fn strips(
    grid: &StructuredGrid,
    z: &[f64],
    flux: Option<&[f64]>,
    ranks: std::ops::RangeInclusive<usize>,
) -> Vec<Vec<RankOutput>> {
    ranks
        .map(|p| run(grid, grid.partition(p).unwrap(), z, flux))
        .collect()
}

/// Scattered owners for every rank count in `ranks`.
fn scattered(
    grid: &StructuredGrid,
    z: &[f64],
    flux: Option<&[f64]>,
    ranks: std::ops::RangeInclusive<usize>,
    seed: u64,
) -> Vec<Vec<RankOutput>> {
    ranks
        .map(|p| {
            let owners = random_owners(grid, p, seed + p as u64);
            run(grid, grid.partition_by(p, |g| owners[g]).unwrap(), z, flux)
        })
        .collect()
}

/// Every cut must reproduce the serial tables and node fields, and after a
/// deposit the same per-pit budget and raised surface.
fn assert_matches_serial(
    grid: &StructuredGrid,
    serial: &[RankOutput],
    cuts: Vec<Vec<RankOutput>>,
) {
    let want_filled = gather_owned(grid, serial, |c| c.filled.as_slice());
    let want_pits = gather_owned(grid, serial, |c| c.watershed.as_slice());
    let want_elevation = gather_owned(grid, serial, |c| c.elevation.as_slice());
    let want_table = serial[0].table.clone().unwrap_or_default();
    let want_balance = serial[0].balance.clone();

    for outputs in cuts {
        let p = outputs.len();
        let filled = gather_owned(grid, &outputs, |c| c.filled.as_slice());
        assert_eq!(filled, want_filled, "filled, {p} ranks");
        let pits = gather_owned(grid, &outputs, |c| c.watershed.as_slice());
        assert_eq!(pits, want_pits, "pits, {p} ranks");
        assert_ghosts_consistent(grid, &outputs);

        let elevation = gather_owned(grid, &outputs, |c| c.elevation.as_slice());
        for (g, (got, want)) in elevation.iter().zip(&want_elevation).enumerate() {
            assert!(close(*got, *want), "node {g} on {p} ranks ends at {got}, not {want}");
        }

        for out in &outputs {
            let table = out.table.clone().unwrap_or_default();
            assert_eq!(table.len(), want_table.len(), "pit count, {p} ranks");
            for (got, want) in table.iter().zip(want_table.iter()) {
                assert_eq!(summary(got), summary(want), "pit {} on {p} ranks", want.id);
                assert!(close(got.volume, want.volume), "volume of pit {}", want.id);
            }
            let (Some(got), Some(want)) = (&out.balance, &want_balance) else {
                continue;
            };
            assert_eq!(got.retained_per_pit.len(), want.retained_per_pit.len());
            let kept = got.retained_per_pit.iter().zip(&want.retained_per_pit);
            let over = got.excess_per_pit.iter().zip(&want.excess_per_pit);
            for (id, ((k, wk), (e, we))) in kept.zip(over).enumerate() {
                assert!(close(*k, *wk), "pit {id} keeps {k} on {p} ranks, not {wk}");
                assert!(close(*e, *we), "pit {id} overflows {e} on {p} ranks, not {we}");
            }
        }
    }
}

fn check_against_serial(
    grid: &StructuredGrid,
    z: &[f64],
    flux: Option<&[f64]>,
    cuts: Vec<Vec<RankOutput>>,
) {
    let serial = run(grid, grid.partition(1).unwrap(), z, flux);
    let table = serial[0].table.clone().unwrap_or_default();
    assert!(!table.is_empty(), "terrain should hold depressions");
    assert_matches_serial(grid, &serial, cuts);
}

#[test]
fn strip_partitions_match_serial() {
    let grid = StructuredGrid::new(12, 9, 1.0).unwrap();
    for seed in [3, 11, 42] {
        let z = random_terrain(&grid, seed);
        check_against_serial(&grid, &z, None, strips(&grid, &z, None, 2..=4));
    }
}

#[test]
fn scattered_owners_match_serial() {
    let grid = StructuredGrid::new(10, 8, 1.0).unwrap();
    let z = random_terrain(&grid, 7);
    check_against_serial(&grid, &z, None, scattered(&grid, &z, None, 2..=4, 100));
}

#[test]
fn pits_reached_at_one_level_keep_their_ids() {
    // two pits spill at the same height; their order must not follow the cut
    let grid = StructuredGrid::new(9, 7, 1.0).unwrap();
    let z = random_terrain(&grid, 1036);
    let flux = vec![1.0; grid.node_count()];
    let mut cuts = strips(&grid, &z, Some(&flux), 2..=3);
    cuts.extend(scattered(&grid, &z, Some(&flux), 2..=3, 1036));
    check_against_serial(&grid, &z, Some(&flux), cuts);
}

#[test]
fn overflow_targets_and_raised_surface_do_not_follow_the_cut() {
    let grid = StructuredGrid::new(12, 7, 1.0).unwrap();
    let z = random_terrain(&grid, 1027);
    let flux = vec![1.0; grid.node_count()];
    let mut cuts = strips(&grid, &z, Some(&flux), 2..=4);
    cuts.extend(scattered(&grid, &z, Some(&flux), 2..=4, 1027));
    check_against_serial(&grid, &z, Some(&flux), cuts);
}

#[test]
fn pit_cut_by_a_partition_boundary_is_one_depression() {
    // the pit spans columns 3..=5; two strips cut it between columns 4 and 5
    let (grid, z) = plus_pit(9, 7, 4, 3, 10.0, 5.0);
    for p in 1..=3 {
        let outputs = run(&grid, grid.partition(p).unwrap(), &z, None);
        for out in &outputs {
            let table = out.table.as_ref().unwrap();
            assert_eq!(table.len(), 1, "{p} ranks");
            assert_eq!(table.records[0].elevation, 10.0);
            assert_eq!(table.records[0].node_count, 5);
            assert!((table.records[0].volume - 25.0).abs() < 1e-9);
        }
        let filled = gather_owned(&grid, &outputs, |c| c.filled.as_slice());
        assert!(filled.iter().all(|&f| f == 10.0), "{p} ranks");
    }
}

/// Natural indices of the nodes of each pit, gathered from every rank.
fn pit_members(
    grid: &StructuredGrid,
    outputs: &[RankOutput],
) -> BTreeMap<usize, BTreeSet<usize>> {
    let pits = gather_owned(grid, outputs, |c| c.watershed.as_slice());
    let mut members: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for (g, pit) in pits.into_iter().enumerate() {
        if let Some(id) = pit {
            members.entry(id).or_default().insert(g);
        }
    }
    members
}

fn connected(adjacency: &Adjacency, nodes: &BTreeSet<usize>) -> bool {
    let Some(&first) = nodes.iter().next() else {
        return true;
    };
    let mut seen = BTreeSet::from([first]);
    let mut queue = VecDeque::from([first]);
    while let Some(i) = queue.pop_front() {
        for &j in adjacency.neighbors(i) {
            if nodes.contains(&j) && seen.insert(j) {
                queue.push_back(j);
            }
        }
    }
    seen.len() == nodes.len()
}

#[test]
fn each_pit_is_one_connected_set_of_nodes() {
    let grid = StructuredGrid::new(9, 7, 1.0).unwrap();
    let adjacency = Adjacency::from_cells(grid.node_count(), &grid.cells());
    for seed in [1036, 1027, 5] {
        let z = random_terrain(&grid, seed);
        let serial = pit_members(&grid, &run(&grid, grid.partition(1).unwrap(), &z, None));
        let ids: Vec<usize> = serial.keys().copied().collect();
        assert_eq!(ids, (0..serial.len()).collect::<Vec<_>>(), "seed {seed}");
        for (id, nodes) in &serial {
            assert!(connected(&adjacency, nodes), "pit {id} of seed {seed} is split");
        }
        let mut cuts = strips(&grid, &z, None, 2..=3);
        cuts.extend(scattered(&grid, &z, None, 2..=3, seed));
        for outputs in &cuts {
            let p = outputs.len();
            assert_eq!(pit_members(&grid, outputs), serial, "seed {seed}, {p} ranks");
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_stepped_terrain_is_partition_independent(seed in any::<u64>(), heights in 2u32..5) {
        let grid = StructuredGrid::new(8, 6, 1.0).unwrap();
        let z = stepped_terrain(&grid, seed, heights);
        let flux = vec![0.25; grid.node_count()];
        let serial = run(&grid, grid.partition(1).unwrap(), &z, Some(&flux));
        let mut cuts = strips(&grid, &z, Some(&flux), 2..=4);
        cuts.extend(scattered(&grid, &z, Some(&flux), 2..=4, seed % 1000));
        assert_matches_serial(&grid, &serial, cuts);
    }
}
