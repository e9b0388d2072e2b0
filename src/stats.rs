//! Convergence diagnostics and the sampling-efficiency report.

use ndarray::{Array1, ArrayView3};
use ndarray_stats::QuantileExt;
use num_traits::Float;
use rustfft::{num_complex::Complex, FftPlanner};
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Split-chain potential scale reduction and effective sample size, per
/// parameter.
///
/// Expects draws of shape `[n_chains, n_steps, dim]`. Each chain is split in
/// half, autocovariances are computed spectrally, and the autocorrelation sum
/// is truncated at the first non-positive pair (kept monotone), the standard
/// initial-positive-sequence rule. Returns `(split_rhat, ess)`; entries are
/// `NaN`/`0` when fewer than four draws per half-chain are available or a
/// parameter has zero variance.
pub fn split_rhat_mean_ess<T: Float>(sample: ArrayView3<T>) -> (Array1<f64>, Array1<f64>) {
    let (n_chains, n_steps, dim) = sample.dim();
    let half = n_steps / 2;
    let m = n_chains * 2;

    let mut rhat = Array1::<f64>::from_elem(dim, f64::NAN);
    let mut ess = Array1::<f64>::zeros(dim);
    if half < 4 || n_chains == 0 {
        return (rhat, ess);
    }

    let mut planner = FftPlanner::<f64>::new();
    let padded = (2 * half).next_power_of_two();
    let fft = planner.plan_fft_forward(padded);
    let ifft = planner.plan_fft_inverse(padded);

    for d in 0..dim {
        // Split every chain into halves, drop the middle draw when odd.
        let mut sequences: Vec<Vec<f64>> = Vec::with_capacity(m);
        for c in 0..n_chains {
            let series: Vec<f64> = (0..n_steps)
                .map(|t| sample[[c, t, d]].to_f64().unwrap_or(f64::NAN))
                .collect();
            sequences.push(series[..half].to_vec());
            sequences.push(series[n_steps - half..].to_vec());
        }
        let means: Vec<f64> = sequences
            .iter()
            .map(|s| s.iter().sum::<f64>() / half as f64)
            .collect();

        // Per-sequence autocovariance via zero-padded FFT.
        let mut acov = vec![vec![0.0_f64; half]; m];
        for (k, sequence) in sequences.iter().enumerate() {
            let mut buf = vec![Complex::new(0.0, 0.0); padded];
            for (t, &x) in sequence.iter().enumerate() {
                buf[t] = Complex::new(x - means[k], 0.0);
            }
            fft.process(&mut buf);
            for value in buf.iter_mut() {
                *value = Complex::new(value.norm_sqr(), 0.0);
            }
            ifft.process(&mut buf);
            let scale = 1.0 / (padded as f64 * half as f64);
            for (t, slot) in acov[k].iter_mut().enumerate() {
                *slot = buf[t].re * scale;
            }
        }

        let chain_var: Vec<f64> = acov
            .iter()
            .map(|a| a[0] * half as f64 / (half as f64 - 1.0))
            .collect();
        let within = chain_var.iter().sum::<f64>() / m as f64;
        let grand_mean = means.iter().sum::<f64>() / m as f64;
        let between_over_n = means
            .iter()
            .map(|mu| (mu - grand_mean).powi(2))
            .sum::<f64>()
            / (m as f64 - 1.0);
        let var_plus = within * (half as f64 - 1.0) / half as f64 + between_over_n;

        if within > 0.0 {
            rhat[d] = (var_plus / within).sqrt();
        }
        if !(var_plus > 0.0) {
            continue;
        }

        let mean_acov: Vec<f64> = (0..half)
            .map(|t| acov.iter().map(|a| a[t]).sum::<f64>() / m as f64)
            .collect();
        let mut rho = vec![0.0_f64; half];
        rho[0] = 1.0;
        for t in 1..half {
            rho[t] = 1.0 - (within - mean_acov[t]) / var_plus;
        }

        // Geyer pairs: accumulate while positive, enforce monotone decrease.
        let mut pair_sum = 0.0;
        let mut previous = f64::INFINITY;
        let mut k = 0;
        while 2 * k + 1 < half {
            let mut pair = rho[2 * k] + rho[2 * k + 1];
            if pair <= 0.0 {
                break;
            }
            if pair > previous {
                pair = previous;
            }
            previous = pair;
            pair_sum += pair;
            k += 1;
        }
        let tau = (2.0 * pair_sum - 1.0).max(1.0e-8);
        ess[d] = (m * half) as f64 / tau;
    }
    (rhat, ess)
}

/// Wall-clock efficiency of a sampling run, normalized by the slowest-mixing
/// parameter.
#[derive(Debug, Clone)]
pub struct EfficiencyReport {
    pub elapsed: Duration,
    pub min_ess: f64,
    pub max_rhat: f64,
    pub ms_per_effective_sample: f64,
}

impl EfficiencyReport {
    pub fn from_sample<T: Float>(
        sample: ArrayView3<T>,
        elapsed: Duration,
    ) -> Result<Self, Box<dyn Error>> {
        let (rhat, ess) = split_rhat_mean_ess(sample);
        let min_ess = *ess.min()?;
        if !(min_ess > 0.0) {
            return Err("Minimum effective sample size is zero; cannot report efficiency.".into());
        }
        let max_rhat = *rhat.max_skipnan();
        Ok(Self {
            elapsed,
            min_ess,
            max_rhat,
            ms_per_effective_sample: elapsed.as_secs_f64() * 1e3 / min_ess,
        })
    }
}

impl fmt::Display for EfficiencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3} ms per effective sample (min ESS {:.1}, max split-rhat {:.3}, elapsed {:.2?})",
            self.ms_per_effective_sample, self.min_ess, self.max_rhat, self.elapsed
        )
    }
}
