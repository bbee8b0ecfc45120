//! Runtime configuration for depression filling.

use crate::pit_error::PitError;
use serde::{Deserialize, Serialize};

/// Parameters consumed by [`PitFiller`](crate::pit::step::PitFiller).
///
/// Nodes lying below `sea_level - sea_limit` are treated as open water and
/// act as outlets. The same quantity is the datum subtracted from every
/// elevation before values are put on the wire, so that valid spill
/// elevations are never negative and `-1` can serve as a reduction sentinel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PitConfig {
    /// Current sea level.
    pub sea_level: f64,
    /// Depth below sea level past which nodes count as open water.
    pub sea_limit: f64,
    /// Porosity of freshly deposited sediment, in `[0, 1)`.
    pub porosity: f64,
    /// Log timing diagnostics on rank 0.
    pub verbose: bool,
    /// Relative tolerance of the sediment conservation check.
    pub conservation_tolerance: f64,
}

impl Default for PitConfig {
    fn default() -> Self {
        Self {
            sea_level: 0.0,
            sea_limit: 1.0e4,
            porosity: 0.0,
            verbose: false,
            conservation_tolerance: 1.0e-9,
        }
    }
}

impl PitConfig {
    /// Elevation datum: `sea_level - sea_limit`.
    pub fn datum(&self) -> f64 {
        self.sea_level - self.sea_limit
    }

    /// Reject configurations that cannot produce a consistent fill.
    pub fn validate(&self) -> Result<(), PitError> {
        if !self.sea_level.is_finite() {
            return Err(PitError::InvalidConfig(format!(
                "sea level must be finite, got {}",
                self.sea_level
            )));
        }
        if !self.sea_limit.is_finite() || self.sea_limit <= 0.0 {
            return Err(PitError::InvalidConfig(format!(
                "sea limit must be a positive finite offset, got {}",
                self.sea_limit
            )));
        }
        if !self.datum().is_finite() {
            return Err(PitError::InvalidConfig(
                "sea level minus sea limit overflows".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.porosity) {
            return Err(PitError::InvalidConfig(format!(
                "porosity must lie in [0, 1), got {}",
                self.porosity
            )));
        }
        if !self.conservation_tolerance.is_finite() || self.conservation_tolerance < 0.0 {
            return Err(PitError::InvalidConfig(format!(
                "conservation tolerance must be non-negative, got {}",
                self.conservation_tolerance
            )));
        }
        Ok(())
    }
}
