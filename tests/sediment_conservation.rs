mod util;
use util::*;

use mesh_pitfill::config::PitConfig;
use mesh_pitfill::topology::StructuredGrid;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn random_flux(grid: &StructuredGrid, seed: u64) -> Vec<f64> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..grid.node_count()).map(|_| rng.gen_range(0.0..0.5)).collect()
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-8 * a.abs().max(b.abs()).max(1.0)
}

#[test]
fn deposits_are_fully_accounted_for() {
    let grid = StructuredGrid::new(11, 9, 1.0).unwrap();
    let z = random_terrain(&grid, 5);
    let flux = random_flux(&grid, 6);
    let config = PitConfig {
        porosity: 0.25,
        ..Default::default()
    };
    let mut reference = None;
    for p in 1..=3 {
        let outputs = fill_partitions(&grid, grid.partition(p).unwrap(), &z, Some(&flux), &config);
        let balance = outputs[0].balance.clone().unwrap();
        assert!(balance.discrepancy().abs() < 1e-9 * balance.input.max(1.0));
        for out in &outputs {
            assert_eq!(out.balance.as_ref(), Some(&balance), "ranks agree on the budget");
        }

        // elevation change over owned nodes is what the pits retained
        let mut applied = 0.0;
        let mut residual = 0.0;
        for out in &outputs {
            for i in out.mesh.owned() {
                applied += out.ctx.area[i] * out.ctx.erosion_deposition[i];
                residual += out.ctx.diffusive_residual[i];
            }
        }
        assert!(close(applied, balance.retained));
        assert!(close(residual, balance.excess + balance.outside));

        // no pit node rises above its filled level
        for out in &outputs {
            for i in 0..out.mesh.len() {
                assert!(out.ctx.elevation[i] <= out.ctx.filled[i] + 1e-12);
            }
        }
        assert_ghosts_consistent(&grid, &outputs);

        let elevation = gather_owned(&grid, &outputs, |c| c.elevation.as_slice());
        match &reference {
            None => reference = Some((balance, elevation)),
            Some((b, e)) => {
                assert!(close(b.input, balance.input));
                assert!(close(b.retained, balance.retained));
                assert!(close(b.excess, balance.excess));
                assert!(close(b.outside, balance.outside));
                assert!(e.iter().zip(&elevation).all(|(a, b)| close(*a, *b)), "{p} ranks");
            }
        }
    }
}

#[test]
fn boundary_deposits_leave_the_mesh() {
    let (grid, z) = plus_pit(7, 7, 3, 3, 10.0, 5.0);
    let flux: Vec<f64> = (0..grid.node_count())
        .map(|g| if grid.is_border(g) { 1.0 } else { 0.0 })
        .collect();
    let outputs = fill_partitions(
        &grid,
        grid.partition(2).unwrap(),
        &z,
        Some(&flux),
        &PitConfig::default(),
    );
    let balance = outputs[0].balance.clone().unwrap();
    assert_eq!(balance.boundary_outflow, 24.0);
    assert_eq!(balance.input, 0.0);
    assert_eq!(balance.retained, 0.0);
}

#[test]
fn overfull_pit_spreads_excess_over_its_nodes() {
    let (grid, z) = plus_pit(7, 7, 3, 3, 10.0, 5.0);
    let mut flux = vec![0.0; grid.node_count()];
    flux[grid.natural(3, 3)] = 35.0;
    let outputs = fill_partitions(
        &grid,
        grid.partition(2).unwrap(),
        &z,
        Some(&flux),
        &PitConfig::default(),
    );
    let balance = outputs[0].balance.clone().unwrap();
    assert!(close(balance.retained, 25.0));
    assert!(close(balance.remaining(), 10.0));
    for out in &outputs {
        for i in 0..out.mesh.len() {
            let g = out.mesh.natural(i);
            if out.ctx.watershed[i].is_some() {
                assert!(close(out.ctx.elevation[i], 10.0), "node {g}");
                assert!(close(out.ctx.diffusive_residual[i], 2.0), "node {g}");
            } else {
                assert_eq!(out.ctx.diffusive_residual[i], 0.0, "node {g}");
            }
        }
    }
}
