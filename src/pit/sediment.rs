//! Sediment redistribution into the depressions of the current step.
//!
//! Deposits are pooled per depression and routed from upstream pits to the
//! pits they spill into. Each pit keeps what fits below its fill level and
//! rises by the retained fraction of its headroom; whatever leaves a pit
//! without a downstream target is spread over that pit's nodes as a residual
//! for diffusive transport. Deposits outside every pit stay where they fell,
//! as residual too.

use crate::algs::collective::{Collective, SyncPoint};
use crate::algs::communicator::Communicator;
use crate::algs::wire::WireNodeSediment;
use crate::config::PitConfig;
use crate::debug_invariants::checks_enabled;
use crate::pit::definition::DepressionTable;
use crate::pit::kernels::{add_excess, pit_height, pit_volume};
use crate::pit::step::StepContext;
use crate::pit_error::PitError;
use crate::topology::boundary::BoundarySets;
use crate::topology::ghost::GhostPlan;
use serde::Serialize;

/// Global sediment budget of one deposition step (volumes).
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SedimentBalance {
    /// Deposited volume after removal at the global boundary.
    pub input: f64,
    /// Deposited volume that fell on global-boundary nodes and left the mesh.
    pub boundary_outflow: f64,
    /// Volume stored in depressions.
    pub retained: f64,
    /// Volume no depression could hold, handed to diffusive transport.
    pub excess: f64,
    /// Volume deposited outside every depression.
    pub outside: f64,
    pub retained_per_pit: Vec<f64>,
    pub excess_per_pit: Vec<f64>,
}

impl SedimentBalance {
    /// Sediment that still has to be carried away after filling.
    pub fn remaining(&self) -> f64 {
        self.excess
    }

    /// `input − (retained + excess + outside)`.
    pub fn discrepancy(&self) -> f64 {
        self.input - (self.retained + self.excess + self.outside)
    }
}

/// Per-node deposited volume: `flux · dt / (1 − porosity)`, never negative.
pub fn deposition_volumes(flux: &[f64], dt: f64, porosity: f64) -> Vec<f64> {
    let scale = dt / (1.0 - porosity);
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        flux.par_iter().map(|&q| (q * scale).max(0.0)).collect()
    }
    #[cfg(not(feature = "rayon"))]
    {
        flux.iter().map(|&q| (q * scale).max(0.0)).collect()
    }
}

/// Per-pit outcome of routing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Routing {
    pub retained: Vec<f64>,
    pub excess: Vec<f64>,
}

/// Route pooled sediment through the pits, highest id first.
///
/// A pit keeps `min(own + inflow, volume)`; the overflow enters its target
/// or, without one, becomes that pit's excess.
pub fn route_sediment(table: &DepressionTable, sediment: &[f64]) -> Routing {
    let n = table.len();
    let mut inflow = vec![0.0; n];
    let mut out = Routing {
        retained: vec![0.0; n],
        excess: vec![0.0; n],
    };
    for id in (0..n).rev() {
        let record = &table.records[id];
        let supply = sediment.get(id).copied().unwrap_or(0.0) + inflow[id];
        let keep = supply.min(record.volume.max(0.0));
        out.retained[id] = keep;
        let over = supply - keep;
        if over <= 0.0 {
            continue;
        }
        match record.target {
            Some(t) if t < id => inflow[t] += over,
            _ => out.excess[id] += over,
        }
    }
    out
}

fn check_conservation(
    config: &PitConfig,
    expected: f64,
    got: f64,
    balance: &SedimentBalance,
) -> Result<(), PitError> {
    let scale = expected.abs().max(got.abs()).max(1.0);
    if (expected - got).abs() <= config.conservation_tolerance * scale {
        return Ok(());
    }
    let err = PitError::NonConservation {
        input: balance.input,
        retained: balance.retained,
        excess: balance.excess,
        outside: balance.outside,
    };
    if checks_enabled() {
        Err(err)
    } else {
        log::error!("{err} (expected {expected}, got {got})");
        Ok(())
    }
}

/// Collective: deposit one step of sediment flux and update `ctx`.
///
/// `ctx` is only modified once every check has passed.
pub fn redistribute<C: Communicator>(
    coll: &Collective<'_, C>,
    ghosts: &GhostPlan,
    bounds: &BoundarySets,
    config: &PitConfig,
    ctx: &mut StepContext,
    flux: &[f64],
    dt: f64,
) -> Result<SedimentBalance, PitError> {
    let n = ctx.elevation.len();
    let empty = DepressionTable::default();
    let table = ctx.depressions.as_ref().unwrap_or(&empty);
    let npits = table.len();
    let owned: Vec<bool> = (0..n).map(|i| bounds.in_domain[i] && !bounds.is_comm[i]).collect();

    let mut deposit = deposition_volumes(flux, dt, config.porosity);
    let mut boundary_outflow = 0.0;
    for (i, d) in deposit.iter_mut().enumerate() {
        if bounds.gbounds[i] {
            if owned[i] {
                boundary_outflow += *d;
            }
            *d = 0.0;
        }
    }
    let input: f64 = (0..n).filter(|&i| owned[i]).map(|i| deposit[i]).sum();

    let (per_pit, outside) = pit_volume(&deposit, &ctx.watershed, &owned, npits);
    let outside_total: f64 = (0..n).filter(|&i| owned[i]).map(|i| outside[i]).sum();

    let mut partial = per_pit;
    partial.extend([input, outside_total, boundary_outflow]);
    let sums = coll.allreduce_sum_f64(SyncPoint::SedimentVolumes, &partial)?;
    let (pooled, totals) = sums.split_at(npits);

    let routing = route_sediment(table, pooled);
    let balance = SedimentBalance {
        input: totals[0],
        boundary_outflow: totals[2],
        retained: routing.retained.iter().sum(),
        excess: routing.excess.iter().sum(),
        outside: totals[1],
        retained_per_pit: routing.retained.clone(),
        excess_per_pit: routing.excess.clone(),
    };

    let capacity: Vec<f64> = table.iter().map(|r| r.volume).collect();
    let node_count: Vec<f64> = table.iter().map(|r| r.node_count as f64).collect();
    let (elevation, _, _) = pit_height(
        &ctx.elevation,
        &ctx.filled,
        &ctx.watershed,
        &capacity,
        &routing.retained,
        &owned,
    );
    let spread = add_excess(&routing.excess, &ctx.watershed, &node_count);
    let residual: Vec<f64> = outside.iter().zip(&spread).map(|(a, b)| a + b).collect();

    let mut applied = [0.0, 0.0];
    for i in (0..n).filter(|&i| owned[i]) {
        applied[0] += ctx.area[i] * (elevation[i] - ctx.elevation[i]);
        applied[1] += residual[i];
    }
    let applied = coll.allreduce_sum_f64(SyncPoint::Conservation, &applied)?;

    check_conservation(
        config,
        balance.input,
        balance.retained + balance.excess + balance.outside,
        &balance,
    )?;
    check_conservation(config, balance.retained, applied[0], &balance)?;
    check_conservation(config, balance.excess + balance.outside, applied[1], &balance)?;

    let mut nodes: Vec<WireNodeSediment> = (0..n)
        .map(|i| {
            WireNodeSediment::new(
                elevation[i],
                ctx.erosion_deposition[i] + (elevation[i] - ctx.elevation[i]),
                residual[i],
            )
        })
        .collect();
    ghosts.exchange(coll, SyncPoint::ElevationExchange, &mut nodes)?;

    ctx.elevation = nodes.iter().map(WireNodeSediment::elevation).collect();
    ctx.erosion_deposition = nodes.iter().map(WireNodeSediment::erosion_deposition).collect();
    ctx.diffusive_residual = nodes.iter().map(WireNodeSediment::residual).collect();
    log::debug!(
        "deposited {:.6e}: retained {:.6e}, excess {:.6e}, outside {:.6e}, off-mesh {:.6e}",
        balance.input,
        balance.retained,
        balance.excess,
        balance.outside,
        balance.boundary_outflow
    );
    Ok(balance)
}
