//! Step driver: one collective depression fill followed by one sediment
//! deposition, repeated every model step.
//!
//! Every rank calls [`PitFiller::fill`] and [`PitFiller::deposit`] in the
//! same order with contexts at the same step. Both entry points open with a
//! fingerprint exchange, so a rank whose input is invalid makes every rank
//! return an error at the same synchronisation point instead of leaving its
//! peers blocked in a later collective.

use crate::algs::collective::{Collective, SyncPoint};
use crate::algs::communicator::Communicator;
use crate::config::PitConfig;
use crate::debug_invariants::DebugInvariants;
use crate::pit::definition::{
    DepressionTable, PitDefinition, PitFields, broadcast_solution, define_pits,
    resolve_spill_owners, sever_boundary_spills,
};
use crate::pit::kernels::{LocalFillInput, local_fill};
use crate::pit::labels::LabelOffsets;
use crate::pit::sediment::{SedimentBalance, redistribute};
use crate::pit::spill_graph::{combine_graphs, merge_spill_graph};
use crate::pit_error::PitError;
use crate::topology::boundary::{BoundarySets, classify};
use crate::topology::ghost::GhostPlan;
use crate::topology::partition::{Adjacency, MeshPartition};
use hashbrown::HashMap;
use std::time::Instant;

/// Whether node areas still have to be computed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StepMode {
    /// First fill: computes node areas before flooding.
    #[default]
    Initial,
    /// Later fills reuse the areas of the first one.
    Update,
}

impl StepMode {
    fn code(self) -> u64 {
        match self {
            StepMode::Initial => 1,
            StepMode::Update => 2,
        }
    }
}

/// Per-rank step state. All fields are indexed by local node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepContext {
    pub step: u64,
    pub mode: StepMode,
    /// Current surface elevation.
    pub elevation: Vec<f64>,
    /// Elevation with every depression filled to its spill level.
    pub filled: Vec<f64>,
    /// Depression id of each node; `None` outside every depression.
    pub watershed: Vec<Option<usize>>,
    /// Cumulative elevation change from deposition.
    pub erosion_deposition: Vec<f64>,
    /// Volume left for diffusive transport by the last deposition.
    pub diffusive_residual: Vec<f64>,
    /// Node areas; empty until the first fill.
    pub area: Vec<f64>,
    /// Depressions of the current step; `None` when there are none.
    pub depressions: Option<DepressionTable>,
    filled_at: Option<u64>,
}

impl StepContext {
    pub fn new(elevation: Vec<f64>) -> Self {
        let n = elevation.len();
        Self {
            filled: elevation.clone(),
            elevation,
            watershed: vec![None; n],
            erosion_deposition: vec![0.0; n],
            diffusive_residual: vec![0.0; n],
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.elevation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elevation.is_empty()
    }

    /// Filled depth `filled - elevation` per node.
    pub fn depth(&self) -> Vec<f64> {
        self.filled
            .iter()
            .zip(&self.elevation)
            .map(|(f, z)| f - z)
            .collect()
    }

    fn fingerprint(&self, phase: u64) -> u64 {
        (self.step << 8) | (self.mode.code() << 4) | phase
    }
}

impl DebugInvariants for StepContext {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "StepContext");
    }

    fn validate_invariants(&self) -> Result<(), PitError> {
        let n = self.elevation.len();
        PitError::check_len("filled", n, self.filled.len())?;
        PitError::check_len("watershed", n, self.watershed.len())?;
        if let Some(i) = (0..n).find(|&i| self.filled[i] < self.elevation[i]) {
            return Err(PitError::InvalidMesh(format!(
                "node {i} filled to {} below its elevation {}",
                self.filled[i], self.elevation[i]
            )));
        }
        let npits = self.depressions.as_ref().map_or(0, DepressionTable::len);
        if let Some(i) = self.watershed.iter().position(|p| p.is_some_and(|p| p >= npits)) {
            return Err(PitError::InvalidMesh(format!(
                "node {i} references a depression outside the table of {npits}"
            )));
        }
        Ok(())
    }
}

/// Result of a fill.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillOutcome {
    /// No depression anywhere in the mesh; the filled surface is the input.
    NoDepressions,
    /// Number of depressions found.
    Depressions(usize),
}

const PHASE_FILL: u64 = 1;
const PHASE_DEPOSIT: u64 = 2;

/// Distributed depression filler bound to one mesh partition.
pub struct PitFiller<'a, C: Communicator> {
    mesh: MeshPartition,
    config: PitConfig,
    coll: Collective<'a, C>,
    bounds: BoundarySets,
    ghosts: GhostPlan,
    adjacency: Adjacency,
    lookup: HashMap<usize, usize>,
}

impl<'a, C: Communicator> PitFiller<'a, C> {
    /// Collective: classify the partition and agree on the ghost schedule.
    pub fn new(mesh: MeshPartition, comm: &'a C, config: PitConfig) -> Result<Self, PitError> {
        config.validate()?;
        let start = Instant::now();
        let coll = Collective::new(comm);
        let bounds = classify(&mesh);
        let ghosts = GhostPlan::build(&mesh, &coll)?;
        let adjacency = mesh.adjacency();
        let lookup = mesh.natural_to_local();
        if config.verbose && coll.rank() == 0 {
            log::info!(
                "pit filler ready on {} ranks in {:?} ({} local nodes, {} comm nodes)",
                coll.size(),
                start.elapsed(),
                mesh.len(),
                bounds.id_comm.len()
            );
        }
        Ok(Self {
            mesh,
            config,
            coll,
            bounds,
            ghosts,
            adjacency,
            lookup,
        })
    }

    pub fn mesh(&self) -> &MeshPartition {
        &self.mesh
    }

    pub fn config(&self) -> &PitConfig {
        &self.config
    }

    pub fn boundary(&self) -> &BoundarySets {
        &self.bounds
    }

    pub fn ghosts(&self) -> &GhostPlan {
        &self.ghosts
    }

    pub fn collective(&self) -> &Collective<'a, C> {
        &self.coll
    }

    /// Synchronisation points executed so far, in order.
    pub fn sync_trace(&self) -> Vec<SyncPoint> {
        self.coll.trace()
    }

    /// A fresh context for this partition.
    pub fn context(&self, elevation: Vec<f64>) -> StepContext {
        StepContext::new(elevation)
    }

    fn fill_status(&self, ctx: &StepContext) -> Result<(), PitError> {
        let n = self.mesh.len();
        PitError::check_len("elevation", n, ctx.elevation.len())?;
        PitError::check_len("erosion_deposition", n, ctx.erosion_deposition.len())?;
        PitError::check_len("diffusive_residual", n, ctx.diffusive_residual.len())?;
        if ctx.mode == StepMode::Update {
            PitError::check_len("area", n, ctx.area.len())?;
        }
        if let Some(i) = self.mesh.owned().find(|&i| !ctx.elevation[i].is_finite()) {
            return Err(PitError::InvalidMesh(format!(
                "node {} has non-finite elevation {}",
                self.mesh.natural(i),
                ctx.elevation[i]
            )));
        }
        Ok(())
    }

    /// Collective: fill every depression of `ctx.elevation`.
    ///
    /// On success `filled`, `watershed` and `depressions` describe the
    /// current surface and the context switches to [`StepMode::Update`].
    pub fn fill(&self, ctx: &mut StepContext) -> Result<FillOutcome, PitError> {
        let start = Instant::now();
        let coll = &self.coll;
        let status = self.fill_status(ctx);
        coll.fingerprint(SyncPoint::FillFingerprint, ctx.fingerprint(PHASE_FILL), status)?;

        let n = self.mesh.len();
        let area = if ctx.mode == StepMode::Initial {
            let mut area = self.mesh.node_areas();
            self.ghosts.exchange(coll, SyncPoint::AreaExchange, &mut area)?;
            area
        } else {
            ctx.area.clone()
        };

        let datum = self.config.datum();
        let shifted: Vec<f64> = ctx.elevation.iter().map(|z| z - datum).collect();
        let exterior: Vec<bool> = (0..n)
            .map(|i| self.mesh.is_owned(i) && (self.bounds.gbounds[i] || shifted[i] < 0.0))
            .collect();
        let local = local_fill(LocalFillInput {
            elevation: &shifted,
            natural: self.mesh.naturals(),
            adjacency: &self.adjacency,
            domain: &self.bounds.in_domain,
            exterior: &exterior,
            comm: &self.bounds.id_comm,
        });

        let total =
            coll.allreduce_sum_u64(SyncPoint::DepressionTotal, &[local.depressions as u64])?;
        if total.first().copied().unwrap_or(0) == 0 {
            ctx.filled = ctx.elevation.clone();
            ctx.watershed = vec![None; n];
            ctx.area = area;
            ctx.depressions = None;
            ctx.mode = StepMode::Update;
            ctx.filled_at = Some(ctx.step);
            if self.config.verbose && coll.rank() == 0 {
                log::info!("step {}: no depressions ({:?})", ctx.step, start.elapsed());
            }
            return Ok(FillOutcome::NoDepressions);
        }

        let offsets = LabelOffsets::allocate(coll, local.regions.len() - 1)?;
        let mut owner_label: Vec<i64> = (0..n)
            .map(|i| match local.labels[i] {
                Some(l) if self.mesh.is_owned(i) => offsets.global(l) as i64,
                _ => -1,
            })
            .collect();
        self.ghosts
            .exchange(coll, SyncPoint::WatershedExchange, &mut owner_label)?;

        let graph = combine_graphs(
            &local,
            &offsets,
            &owner_label,
            self.mesh.naturals(),
            coll.rank(),
        );
        let merged = merge_spill_graph(coll, &offsets, &graph);
        let (root_outcome, local_err) = match merged {
            Ok(Some(buffers)) => (Some(buffers.decode().and_then(|g| g.solve())), None),
            Ok(None) => (None, None),
            Err(e) if coll.rank() == 0 => (Some(Err(e)), None),
            Err(e) => (None, Some(e)),
        };
        // the broadcast runs even when this rank's merge failed
        let solved = broadcast_solution(coll, root_outcome);
        if let Some(e) = local_err {
            return Err(e);
        }
        let mut solved = solved?;
        if self.config.verbose && coll.rank() == 0 {
            log::info!(
                "step {}: {} labels, {} pits solved ({:?})",
                ctx.step,
                offsets.total(),
                solved.pit_count(),
                start.elapsed()
            );
        }

        let owners = resolve_spill_owners(coll, &self.mesh, &self.lookup, &solved.pits)?;
        let on_boundary: Vec<bool> = owners.iter().map(|o| o.on_boundary).collect();
        let severed = sever_boundary_spills(&mut solved.pits, &on_boundary);
        if severed > 0 {
            log::debug!("step {}: {severed} pits drain off the mesh", ctx.step);
        }

        let label: Vec<Option<usize>> = (0..n)
            .map(|i| {
                local.labels[i]
                    .filter(|_| self.mesh.is_owned(i))
                    .map(|l| offsets.global(l) as usize)
            })
            .collect();
        let PitDefinition { filled, pit, table } = define_pits(
            coll,
            &self.ghosts,
            &self.mesh,
            PitFields {
                elevation: &ctx.elevation,
                label: &label,
                area: &area,
                datum,
            },
            &solved,
            &owners,
        )?;

        let (count, capacity) = (table.len(), table.total_volume());
        ctx.filled = filled;
        ctx.watershed = pit;
        ctx.area = area;
        ctx.depressions = (count > 0).then_some(table);
        ctx.mode = StepMode::Update;
        ctx.filled_at = Some(ctx.step);
        ctx.debug_assert_invariants();
        if self.config.verbose && coll.rank() == 0 {
            log::info!(
                "step {}: {count} depressions holding {:.6e} filled in {:?}",
                ctx.step,
                capacity,
                start.elapsed()
            );
        }
        // flat local minima can reach the root and still flood nothing
        Ok(if count == 0 {
            FillOutcome::NoDepressions
        } else {
            FillOutcome::Depressions(count)
        })
    }

    fn deposit_status(&self, ctx: &StepContext, flux: &[f64], dt: f64) -> Result<(), PitError> {
        if ctx.filled_at != Some(ctx.step) {
            return Err(PitError::StepOrder(format!(
                "deposit at step {} requires a fill of the same step",
                ctx.step
            )));
        }
        let n = self.mesh.len();
        PitError::check_len("flux", n, flux.len())?;
        PitError::check_len("elevation", n, ctx.elevation.len())?;
        PitError::check_len("area", n, ctx.area.len())?;
        if !dt.is_finite() || dt < 0.0 {
            return Err(PitError::InvalidConfig(format!(
                "time step must be finite and non-negative, got {dt}"
            )));
        }
        if let Some(i) = self.mesh.owned().find(|&i| !flux[i].is_finite()) {
            return Err(PitError::InvalidMesh(format!(
                "node {} has non-finite sediment flux",
                self.mesh.natural(i)
            )));
        }
        Ok(())
    }

    /// Collective: deposit `flux · dt` of sediment into the depressions of
    /// the last fill and advance the context to the next step.
    pub fn deposit(
        &self,
        ctx: &mut StepContext,
        flux: &[f64],
        dt: f64,
    ) -> Result<SedimentBalance, PitError> {
        let start = Instant::now();
        let status = self.deposit_status(ctx, flux, dt);
        self.coll.fingerprint(
            SyncPoint::DepositFingerprint,
            ctx.fingerprint(PHASE_DEPOSIT),
            status,
        )?;
        let balance = redistribute(
            &self.coll,
            &self.ghosts,
            &self.bounds,
            &self.config,
            ctx,
            flux,
            dt,
        )?;
        ctx.depressions = None;
        ctx.filled_at = None;
        ctx.step += 1;
        if self.config.verbose && self.coll.rank() == 0 {
            log::info!(
                "step {}: deposited {:.4e}, {:.4e} left for diffusion ({:?})",
                ctx.step - 1,
                balance.input,
                balance.remaining(),
                start.elapsed()
            );
        }
        Ok(balance)
    }
}
