//! The seam between the tuning loop and the sampling engine it drives.
//!
//! The windowed adapter never touches an engine's integrator or step-size
//! logic. It builds a sampler around a metric, asks it for bursts of draws,
//! and reads back end positions to seed the next burst.

use crate::metric::DenseMetric;
use indicatif::ProgressStyle;
use ndarray::{Array2, Array3, ArrayView2};
use num_traits::Float;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use std::error::Error;

/// A sampler built around one fixed metric.
///
/// All burst methods return draws of shape `[n_chains, n_steps, dim]`.
pub trait MetricSampler<T> {
    /// Advances every chain `n_steps` steps with the engine's internal
    /// adaptation (e.g. step size) enabled, returning all draws.
    fn tune(&mut self, n_steps: usize) -> Array3<T>;

    /// Production phase: `n_discard` adapting steps, then `n_collect` steps
    /// with adaptation frozen; only the latter are returned.
    fn run(&mut self, n_collect: usize, n_discard: usize) -> Array3<T>;

    /// The last visited position of each chain, shape `[n_chains, dim]`.
    fn positions(&self) -> Array2<T>;
}

/// Builds [`MetricSampler`]s around a metric, one per tuning window.
///
/// Construction may fail (e.g. a non-finite log-density at a start position);
/// the failure propagates to the caller of the tuning loop.
pub trait MetricEngine<T> {
    type Sampler: MetricSampler<T>;

    fn build(
        &self,
        metric: DenseMetric<T>,
        start_positions: ArrayView2<T>,
        seed: u64,
    ) -> Result<Self::Sampler, Box<dyn Error>>;
}

/// Standard-normal starting positions for `n_chains` chains, seeded.
pub fn init_positions<T>(n_chains: usize, dim: usize, seed: u64) -> Array2<T>
where
    T: Float,
    StandardNormal: Distribution<T>,
{
    let mut rng = SmallRng::seed_from_u64(seed);
    Array2::from_shape_fn((n_chains, dim), |_| rng.sample(StandardNormal))
}

pub(crate) fn chain_progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap()
        .progress_chars("##-")
}
