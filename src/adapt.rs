//! The windowed covariance adapter.
//!
//! Tuning proceeds in bursts of doubling length. After each burst the dense
//! covariance of every draw collected so far is re-estimated and the sampler
//! is discarded and rebuilt around the new metric; the engine's own adaptation
//! state (step size in particular) restarts cleanly with it. The final metric
//! then drives one production run whose retained draws are the result.

use crate::core::{MetricEngine, MetricSampler};
use crate::covariance::regularized_cov;
use crate::metric::DenseMetric;
use crate::schedule::expanding_windows;
use crate::stats::EfficiencyReport;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, LinalgScalar};
use num_traits::{Float, FromPrimitive};
use std::error::Error;
use std::time::Instant;

/// Tuning-loop configuration.
///
/// `regular_window`/`regular_variance` control the pseudo-count shrinkage of
/// each covariance re-estimate; the default leaves it off, estimating from the
/// raw trace alone.
#[derive(Debug, Clone)]
pub struct WindowedConfig<T> {
    /// Length of the first tuning burst; later bursts double.
    pub initial_window: usize,
    /// Adapting steps discarded at the start of the production run.
    pub burn_in: usize,
    /// Total tuning budget, including `burn_in`.
    pub total_tune: usize,
    /// Retained production draws per chain.
    pub n_collect: usize,
    /// Pseudo-count of prior draws for covariance shrinkage; 0 disables it.
    pub regular_window: usize,
    /// Prior diagonal variance used by the shrinkage.
    pub regular_variance: T,
    /// Base seed; window `i` builds its sampler with `seed + i`.
    pub seed: u64,
}

impl<T> Default for WindowedConfig<T>
where
    T: Float,
{
    fn default() -> Self {
        Self {
            initial_window: 25,
            burn_in: 500,
            total_tune: 5000,
            n_collect: 1000,
            regular_window: 0,
            regular_variance: T::from(1e-3).unwrap(),
            seed: 0,
        }
    }
}

/// Draws accumulated across tuning windows, plus the end position of every
/// chain. Append-only; never rewound.
#[derive(Debug, Clone)]
pub struct RunningTrace<T> {
    draws: Array2<T>,
    end_positions: Array2<T>,
}

impl<T> RunningTrace<T>
where
    T: Float,
{
    pub fn new(initial_positions: Array2<T>) -> Self {
        let dim = initial_positions.ncols();
        Self {
            draws: Array2::zeros((0, dim)),
            end_positions: initial_positions,
        }
    }

    /// Appends one burst of shape `[n_chains, n_steps, dim]` and records the
    /// new end positions.
    pub fn append(
        &mut self,
        burst: ArrayView3<T>,
        end_positions: Array2<T>,
    ) -> Result<(), Box<dyn Error>> {
        for chain in burst.axis_iter(Axis(0)) {
            self.draws.append(Axis(0), chain)?;
        }
        self.end_positions = end_positions;
        Ok(())
    }

    /// All draws so far, rows = draws across chains, columns = parameters.
    pub fn draws(&self) -> ArrayView2<T> {
        self.draws.view()
    }

    pub fn end_positions(&self) -> ArrayView2<T> {
        self.end_positions.view()
    }

    pub fn len(&self) -> usize {
        self.draws.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.nrows() == 0
    }
}

/// Outcome of a windowed tuning run.
#[derive(Debug, Clone)]
pub struct MetricAdaptation<T> {
    /// Production draws, `[n_chains, n_collect, dim]`.
    pub sample: Array3<T>,
    /// The metric the production run used.
    pub metric: DenseMetric<T>,
    /// The burst schedule that was executed.
    pub windows: Vec<usize>,
    /// Draws accumulated during tuning (rows across all chains).
    pub n_tuning_draws: usize,
    /// Wall-clock efficiency of the production phase.
    pub report: EfficiencyReport,
}

/// Runs the full windowed adaptation and the production phase behind it.
///
/// Starts from the identity metric, then for each window estimates the dense
/// covariance of the whole running trace, rebuilds the sampler around it and
/// draws the next burst from the chains' last positions. Every failure
/// (degenerate schedule, singular covariance at metric construction, engine
/// build failure) aborts the run and propagates.
pub fn tune_windowed<T, E>(
    engine: &E,
    config: &WindowedConfig<T>,
    initial_positions: Array2<T>,
) -> Result<MetricAdaptation<T>, Box<dyn Error>>
where
    T: Float + FromPrimitive + LinalgScalar,
    E: MetricEngine<T>,
{
    let dim = initial_positions.ncols();
    let windows = expanding_windows(config.initial_window, config.burn_in, config.total_tune)?;
    let mut trace = RunningTrace::new(initial_positions);
    let mut metric = DenseMetric::identity(dim);

    for (i, &length) in windows.iter().enumerate() {
        if !trace.is_empty() {
            let cov = regularized_cov(
                trace.draws(),
                config.regular_window,
                config.regular_variance,
            )?;
            metric = DenseMetric::from_covariance(cov)?;
        }
        let mut sampler = engine.build(metric.clone(), trace.end_positions(), config.seed + i as u64)?;
        let burst = sampler.tune(length);
        trace.append(burst.view(), sampler.positions())?;
    }

    let cov = regularized_cov(
        trace.draws(),
        config.regular_window,
        config.regular_variance,
    )?;
    let metric = DenseMetric::from_covariance(cov)?;
    let mut sampler = engine.build(
        metric.clone(),
        trace.end_positions(),
        config.seed + windows.len() as u64,
    )?;

    let started = Instant::now();
    let sample = sampler.run(config.n_collect, config.burn_in);
    let report = EfficiencyReport::from_sample(sample.view(), started.elapsed())?;

    Ok(MetricAdaptation {
        sample,
        metric,
        windows,
        n_tuning_draws: trace.len(),
        report,
    })
}
