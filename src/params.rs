//! Tunable simulation parameters and construction-time validation.

use glam::UVec3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when a simulation is constructed with unusable settings.
///
/// Nothing past construction returns an error; all runtime recoveries are
/// local (clamping, skipping, logging).
#[derive(Debug, Error, PartialEq)]
pub enum ParamsError {
    /// Each axis needs at least one interior cell between the forced-solid
    /// boundary shells.
    #[error("grid dimensions {0:?} too small, every axis must be at least 3")]
    DimensionsTooSmall(UVec3),
    #[error("particle density must be positive, got {0}")]
    InvalidDensity(f32),
    #[error("step size must be positive and finite, got {0}")]
    InvalidStepSize(f32),
    #[error("PIC/FLIP ratio must lie in [0, 1], got {0}")]
    InvalidBlendRatio(f32),
    #[error("resample bounds must satisfy 0 < min <= max, got {min}..{max}")]
    InvalidResampleBounds { min: usize, max: usize },
}

/// Tunable constants of the solver.
///
/// The defaults match the published FLIP solver settings; hosts can
/// deserialize overrides from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlipParams {
    /// FLIP weight in the PIC/FLIP velocity blend. 1.0 is pure FLIP.
    pub pic_flip_ratio: f32,
    /// Enable the ghost-fluid sub-cell free-surface correction.
    pub subcell: bool,
    /// PCG termination threshold on the residual infinity norm.
    pub cg_tolerance: f32,
    /// PCG iteration cap. `None` means `max_dim * max_dim`.
    pub cg_max_iterations: Option<usize>,
    /// Solid-particle repulsion radius in units of `density / max_dim`.
    pub repulsion_radius_factor: f32,
    /// Fractional overshoot when ejecting a particle stuck inside a solid.
    pub stuck_overshoot: f32,
    /// Fraction of the hit distance a bouncing particle retreats to.
    pub bounce_retract: f32,
    /// Reseed cells holding fewer fluid particles than this.
    pub resample_min: usize,
    /// Thin cells holding more fluid particles than this.
    pub resample_max: usize,
    /// Occupancy cutoff below which a sparse cell counts as spray and is
    /// left alone by the resampler.
    pub density_threshold: f32,
    /// Per-step cap on resampler creations and deletions, as a fraction of
    /// the step-start particle count.
    pub mass_budget: f32,
}

impl Default for FlipParams {
    fn default() -> Self {
        Self {
            pic_flip_ratio: 0.95,
            subcell: true,
            cg_tolerance: 1.0e-4,
            cg_max_iterations: None,
            repulsion_radius_factor: 1.5,
            stuck_overshoot: 1.05,
            bounce_retract: 0.90,
            resample_min: 4,
            resample_max: 32,
            density_threshold: 0.04,
            mass_budget: 0.10,
        }
    }
}

impl FlipParams {
    /// Validate these parameters together with the simulation geometry.
    pub fn validate(&self, dims: UVec3, density: f32, step_size: f32) -> Result<(), ParamsError> {
        if dims.min_element() < 3 {
            return Err(ParamsError::DimensionsTooSmall(dims));
        }
        if !(density > 0.0) || !density.is_finite() {
            return Err(ParamsError::InvalidDensity(density));
        }
        if !(step_size > 0.0) || !step_size.is_finite() {
            return Err(ParamsError::InvalidStepSize(step_size));
        }
        if !(0.0..=1.0).contains(&self.pic_flip_ratio) {
            return Err(ParamsError::InvalidBlendRatio(self.pic_flip_ratio));
        }
        if self.resample_min == 0 || self.resample_min > self.resample_max {
            return Err(ParamsError::InvalidResampleBounds {
                min: self.resample_min,
                max: self.resample_max,
            });
        }
        Ok(())
    }

    /// Effective PCG iteration cap for a grid whose longest axis is `max_dim`.
    pub fn cg_iteration_cap(&self, max_dim: f32) -> usize {
        self.cg_max_iterations
            .unwrap_or((max_dim * max_dim) as usize)
    }
}
