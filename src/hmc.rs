//! A data-parallel Hamiltonian Monte Carlo sampler driven through a dense
//! metric.
//!
//! Each chain owns its RNG (seeded `seed + chain index`), its cached
//! log-density and gradient, and its dual-averaging step-size state; chains
//! advance independently and bursts run them in parallel with rayon. The
//! sampler is deliberately cheap to rebuild: all tuning state is
//! reinitialized from the metric it is given, so a fresh metric always gets a
//! fresh step size.

use crate::core::{chain_progress_style, MetricEngine, MetricSampler};
use crate::distributions::GradientTarget;
use crate::metric::DenseMetric;
use indicatif::MultiProgress;
use ndarray::{Array1, Array2, Array3, ArrayView2, LinalgScalar};
use num_traits::{Float, FromPrimitive};
use rand::distributions::Standard;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use std::error::Error;

/// One Hamiltonian Markov chain with a fixed dense metric.
#[derive(Debug, Clone)]
pub struct HmcChain<T, D> {
    pub target: D,
    pub metric: DenseMetric<T>,
    pub position: Array1<T>,
    pub step_size: T,
    pub n_leapfrog: usize,
    pub target_accept_p: T,
    pub seed: u64,
    grad: Array1<T>,
    logp: T,
    rng: SmallRng,
    // Dual-averaging state (Hoffman & Gelman 2014, algorithm 5).
    adapt_count: usize,
    mu: T,
    h_bar: T,
    log_step_bar: T,
}

impl<T, D> HmcChain<T, D>
where
    T: Float + FromPrimitive + LinalgScalar,
    D: GradientTarget<T>,
    StandardNormal: Distribution<T>,
    Standard: Distribution<T>,
{
    /// Creates a chain at `position`, picks a reasonable initial step size for
    /// the given metric, and primes the dual-averaging state.
    ///
    /// Fails if the target's log-density is not finite at `position`.
    pub fn new(
        target: D,
        metric: DenseMetric<T>,
        position: Array1<T>,
        n_leapfrog: usize,
        target_accept_p: T,
        seed: u64,
    ) -> Result<Self, Box<dyn Error>> {
        let mut grad = Array1::<T>::zeros(position.len());
        let logp = target.logp_and_grad(position.view(), &mut grad);
        if !logp.is_finite() {
            return Err(format!(
                "Non-finite log-density at the starting position of chain with seed {seed}."
            )
            .into());
        }

        let mut rng = SmallRng::seed_from_u64(seed);
        let momentum = metric.sample_momentum(&mut rng);
        let step_size =
            find_reasonable_step_size(&target, &metric, &position, &grad, logp, &momentum);
        let mu = (T::from(10.0).unwrap() * step_size).ln();

        Ok(Self {
            target,
            metric,
            position,
            step_size,
            n_leapfrog,
            target_accept_p,
            seed,
            grad,
            logp,
            rng,
            adapt_count: 0,
            mu,
            h_bar: T::zero(),
            log_step_bar: step_size.ln(),
        })
    }

    /// One momentum refresh, leapfrog trajectory, and accept/reject decision.
    ///
    /// With `adapt` set, the step size is updated by dual averaging toward the
    /// target acceptance rate; otherwise the averaged step size is used.
    pub fn step(&mut self, adapt: bool) {
        if !adapt {
            self.step_size = self.log_step_bar.exp();
        }

        let momentum_0 = self.metric.sample_momentum(&mut self.rng);
        let joint_0 = self.logp - self.metric.kinetic(&momentum_0);

        let mut position = self.position.clone();
        let mut momentum = momentum_0;
        let mut grad = self.grad.clone();
        let mut logp = self.logp;
        for _ in 0..self.n_leapfrog {
            logp = leapfrog(
                &self.target,
                &self.metric,
                &mut position,
                &mut momentum,
                &mut grad,
                self.step_size,
            );
            if !logp.is_finite() {
                break;
            }
        }

        let joint_1 = logp - self.metric.kinetic(&momentum);
        let log_ratio = joint_1 - joint_0;
        let alpha = if log_ratio.is_finite() {
            T::one().min(log_ratio.exp())
        } else {
            T::zero()
        };

        let u: T = self.rng.gen();
        if u < alpha {
            self.position = position;
            self.grad = grad;
            self.logp = logp;
        }

        if adapt {
            self.update_step_size(alpha);
        }
    }

    /// Runs `n_steps` steps and records each visited position as one row.
    pub fn collect(&mut self, n_steps: usize, adapt: bool) -> Array2<T> {
        let dim = self.position.len();
        let mut out = Array2::<T>::zeros((n_steps, dim));
        for i in 0..n_steps {
            self.step(adapt);
            out.row_mut(i).assign(&self.position);
        }
        out
    }

    fn update_step_size(&mut self, alpha: T) {
        let gamma = T::from(0.05).unwrap();
        let t_0 = T::from(10.0).unwrap();
        let kappa = T::from(0.75).unwrap();

        self.adapt_count += 1;
        let m = T::from_usize(self.adapt_count).unwrap();
        let eta = T::one() / (m + t_0);
        self.h_bar =
            (T::one() - eta) * self.h_bar + eta * (self.target_accept_p - alpha);
        let log_step = self.mu - m.sqrt() / gamma * self.h_bar;
        self.step_size = log_step.exp();
        let eta_bar = m.powf(-kappa);
        self.log_step_bar = (T::one() - eta_bar) * self.log_step_bar + eta_bar * log_step;
    }
}

/// One leapfrog update through the metric; returns the log-density at the new
/// position and refreshes `grad` in place.
fn leapfrog<T, D>(
    target: &D,
    metric: &DenseMetric<T>,
    position: &mut Array1<T>,
    momentum: &mut Array1<T>,
    grad: &mut Array1<T>,
    step_size: T,
) -> T
where
    T: Float + LinalgScalar,
    D: GradientTarget<T>,
{
    let half = T::from(0.5).unwrap();
    for (p, &g) in momentum.iter_mut().zip(grad.iter()) {
        *p = *p + g * step_size * half;
    }
    let velocity = metric.velocity(momentum);
    for (q, &v) in position.iter_mut().zip(velocity.iter()) {
        *q = *q + v * step_size;
    }
    let logp = target.logp_and_grad(position.view(), grad);
    for (p, &g) in momentum.iter_mut().zip(grad.iter()) {
        *p = *p + g * step_size * half;
    }
    logp
}

/// Doubles or halves an initial step size until a single leapfrog step
/// crosses 50% acceptance, starting from one and halving first past any
/// non-finite region.
fn find_reasonable_step_size<T, D>(
    target: &D,
    metric: &DenseMetric<T>,
    position: &Array1<T>,
    grad: &Array1<T>,
    logp: T,
    momentum: &Array1<T>,
) -> T
where
    T: Float + LinalgScalar,
    D: GradientTarget<T>,
{
    let half = T::from(0.5).unwrap();
    let two = T::from(2.0).unwrap();
    let mut step_size = T::one();

    let probe = |eps: T| -> T {
        let mut q = position.clone();
        let mut p = momentum.clone();
        let mut g = grad.clone();
        let logp_prime = leapfrog(target, metric, &mut q, &mut p, &mut g, eps);
        (logp_prime - metric.kinetic(&p)) - (logp - metric.kinetic(momentum))
    };

    let mut log_ratio = probe(step_size);
    for _ in 0..64 {
        if log_ratio.is_finite() {
            break;
        }
        step_size = step_size * half;
        log_ratio = probe(step_size);
    }

    let direction = if log_ratio > half.ln() { T::one() } else { -T::one() };
    for _ in 0..64 {
        if direction * log_ratio <= -direction * two.ln() {
            break;
        }
        step_size = step_size * two.powf(direction);
        log_ratio = probe(step_size);
    }
    step_size
}

/// A multi-chain HMC sampler bound to one metric.
#[derive(Debug, Clone)]
pub struct MetricHmc<T, D> {
    pub chains: Vec<HmcChain<T, D>>,
    pub seed: u64,
}

impl<T, D> MetricHmc<T, D>
where
    T: Float + FromPrimitive + LinalgScalar + Send + Sync + 'static,
    D: GradientTarget<T> + Clone + Send + Sync,
    StandardNormal: Distribution<T>,
    Standard: Distribution<T>,
{
    /// One chain per row of `start_positions`, seeded `seed + i + 1`.
    pub fn new(
        target: D,
        metric: DenseMetric<T>,
        start_positions: ArrayView2<T>,
        n_leapfrog: usize,
        target_accept_p: T,
        seed: u64,
    ) -> Result<Self, Box<dyn Error>> {
        let chains = start_positions
            .rows()
            .into_iter()
            .enumerate()
            .map(|(i, row)| {
                HmcChain::new(
                    target.clone(),
                    metric.clone(),
                    row.to_owned(),
                    n_leapfrog,
                    target_accept_p,
                    seed + i as u64 + 1,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { chains, seed })
    }

    /// Like [`MetricSampler::run`] but renders one progress bar per chain.
    pub fn run_progress(&mut self, n_collect: usize, n_discard: usize) -> Array3<T> {
        let multi = MultiProgress::new();
        let style = chain_progress_style();
        let per_chain: Vec<Array2<T>> = self
            .chains
            .par_iter_mut()
            .enumerate()
            .map(|(i, chain)| {
                let pb = multi.add(indicatif::ProgressBar::new((n_discard + n_collect) as u64));
                pb.set_prefix(format!("Chain {i}"));
                pb.set_style(style.clone());
                for _ in 0..n_discard {
                    chain.step(true);
                    pb.inc(1);
                }
                let dim = chain.position.len();
                let mut out = Array2::<T>::zeros((n_collect, dim));
                for r in 0..n_collect {
                    chain.step(false);
                    out.row_mut(r).assign(&chain.position);
                    pb.inc(1);
                }
                pb.finish_with_message("Done!");
                out
            })
            .collect();
        stack_chains(&per_chain)
    }
}

impl<T, D> MetricSampler<T> for MetricHmc<T, D>
where
    T: Float + FromPrimitive + LinalgScalar + Send + Sync + 'static,
    D: GradientTarget<T> + Clone + Send + Sync,
    StandardNormal: Distribution<T>,
    Standard: Distribution<T>,
{
    fn tune(&mut self, n_steps: usize) -> Array3<T> {
        let per_chain: Vec<Array2<T>> = self
            .chains
            .par_iter_mut()
            .map(|chain| chain.collect(n_steps, true))
            .collect();
        stack_chains(&per_chain)
    }

    fn run(&mut self, n_collect: usize, n_discard: usize) -> Array3<T> {
        let per_chain: Vec<Array2<T>> = self
            .chains
            .par_iter_mut()
            .map(|chain| {
                for _ in 0..n_discard {
                    chain.step(true);
                }
                chain.collect(n_collect, false)
            })
            .collect();
        stack_chains(&per_chain)
    }

    fn positions(&self) -> Array2<T> {
        let dim = self.chains.first().map_or(0, |c| c.position.len());
        Array2::from_shape_fn((self.chains.len(), dim), |(i, j)| self.chains[i].position[j])
    }
}

fn stack_chains<T: Float>(per_chain: &[Array2<T>]) -> Array3<T> {
    let views: Vec<_> = per_chain.iter().map(|s| s.view()).collect();
    ndarray::stack(ndarray::Axis(0), &views).expect("Expected stacking chain draws to succeed.")
}

/// Configuration for building [`MetricHmc`] samplers, one per tuning window.
#[derive(Debug, Clone)]
pub struct HmcEngine<T, D> {
    pub target: D,
    pub n_leapfrog: usize,
    pub target_accept_p: T,
}

impl<T, D> HmcEngine<T, D> {
    pub fn new(target: D, n_leapfrog: usize, target_accept_p: T) -> Self {
        Self {
            target,
            n_leapfrog,
            target_accept_p,
        }
    }
}

impl<T, D> MetricEngine<T> for HmcEngine<T, D>
where
    T: Float + FromPrimitive + LinalgScalar + Send + Sync + 'static,
    D: GradientTarget<T> + Clone + Send + Sync,
    StandardNormal: Distribution<T>,
    Standard: Distribution<T>,
{
    type Sampler = MetricHmc<T, D>;

    fn build(
        &self,
        metric: DenseMetric<T>,
        start_positions: ArrayView2<T>,
        seed: u64,
    ) -> Result<Self::Sampler, Box<dyn Error>> {
        MetricHmc::new(
            self.target.clone(),
            metric,
            start_positions,
            self.n_leapfrog,
            self.target_accept_p,
            seed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance::sample_cov;
    use crate::distributions::{IsotropicGaussian, MvGaussian};
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, s, Axis};

    fn gaussian_2d() -> MvGaussian<f64> {
        MvGaussian::new(arr1(&[0.0, 0.0]), arr2(&[[4.0, 2.0], [2.0, 3.0]])).unwrap()
    }

    #[test]
    fn test_reasonable_step_size_is_finite_and_positive() {
        let target = gaussian_2d();
        let chain = HmcChain::new(
            target,
            DenseMetric::identity(2),
            arr1(&[0.5, 0.5]),
            8,
            0.8,
            42,
        )
        .unwrap();
        assert!(chain.step_size.is_finite());
        assert!(chain.step_size > 0.0);
    }

    #[test]
    fn test_build_rejects_non_finite_start() {
        let target = gaussian_2d();
        let result = HmcChain::new(
            target,
            DenseMetric::identity(2),
            arr1(&[f64::NAN, 0.0]),
            8,
            0.8,
            42,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_chain_is_deterministic_given_seed() {
        let make = || {
            let mut chain = HmcChain::new(
                gaussian_2d(),
                DenseMetric::identity(2),
                arr1(&[1.0, -1.0]),
                8,
                0.8,
                123,
            )
            .unwrap();
            chain.collect(50, true)
        };
        assert_eq!(make(), make());
    }

    #[test]
    fn test_leapfrog_is_time_reversible() {
        let target = gaussian_2d();
        let metric = DenseMetric::from_covariance(arr2(&[[2.0, 0.5], [0.5, 1.0]])).unwrap();
        let mut position = arr1(&[1.0, 0.5]);
        let mut momentum = arr1(&[0.3, -0.2]);
        let mut grad = Array1::zeros(2);
        target.logp_and_grad(position.view(), &mut grad);
        let start = position.clone();

        let eps = 0.1;
        for _ in 0..10 {
            leapfrog(&target, &metric, &mut position, &mut momentum, &mut grad, eps);
        }
        momentum.mapv_inplace(|p| -p);
        for _ in 0..10 {
            leapfrog(&target, &metric, &mut position, &mut momentum, &mut grad, eps);
        }
        assert_abs_diff_eq!(position, start, epsilon = 1e-9);
    }

    #[test]
    fn test_sampler_recovers_gaussian_moments() {
        let target = gaussian_2d();
        let start = arr2(&[[0.0, 0.0], [1.0, 1.0], [-1.0, 1.0], [0.5, -0.5]]);
        let mut sampler =
            MetricHmc::new(target.clone(), DenseMetric::identity(2), start.view(), 10, 0.8, 42)
                .unwrap();
        let sample = sampler.run(2000, 500);
        assert_eq!(sample.dim(), (4, 2000, 2));

        let flat: Array2<f64> = flatten(&sample);
        let mean = flat.mean_axis(Axis(0)).unwrap();
        assert_abs_diff_eq!(mean, arr1(&[0.0, 0.0]), epsilon = 0.35);
        let cov = sample_cov(flat.view()).unwrap();
        assert_abs_diff_eq!(cov, target.covariance().to_owned(), epsilon = 1.0);
    }

    #[test]
    fn test_adapted_acceptance_near_target() {
        let target = IsotropicGaussian::new(1.0);
        let mut chain = HmcChain::new(
            target,
            DenseMetric::identity(2),
            arr1(&[0.1, -0.1]),
            8,
            0.8,
            42,
        )
        .unwrap();
        // Adapt, then measure acceptance with the averaged step size.
        for _ in 0..800 {
            chain.step(true);
        }
        let mut accepted = 0;
        let mut last = chain.position.clone();
        let n = 1000;
        for _ in 0..n {
            chain.step(false);
            if chain.position != last {
                accepted += 1;
            }
            last = chain.position.clone();
        }
        let rate = accepted as f64 / n as f64;
        assert!(
            (0.55..=0.99).contains(&rate),
            "acceptance rate {rate} drifted from the 0.8 target"
        );
    }

    #[test]
    fn test_dense_metric_beats_identity_on_correlated_target() {
        // Narrow, strongly correlated Gaussian: the exact covariance as the
        // metric should accept far larger steps than the unit metric.
        let cov = arr2(&[[1.0, 0.99], [0.99, 1.0]]);
        let target = MvGaussian::new(arr1(&[0.0, 0.0]), cov.clone()).unwrap();

        let identity = HmcChain::new(
            target.clone(),
            DenseMetric::identity(2),
            arr1(&[0.0, 0.0]),
            8,
            0.8,
            42,
        )
        .unwrap();
        let dense = HmcChain::new(
            target,
            DenseMetric::from_covariance(cov).unwrap(),
            arr1(&[0.0, 0.0]),
            8,
            0.8,
            42,
        )
        .unwrap();
        assert!(
            dense.step_size > identity.step_size,
            "dense {} vs identity {}",
            dense.step_size,
            identity.step_size
        );
    }

    #[test]
    fn test_positions_reflect_last_draw() {
        let target = gaussian_2d();
        let start = arr2(&[[0.0, 0.0], [1.0, 1.0]]);
        let mut sampler =
            MetricHmc::new(target, DenseMetric::identity(2), start.view(), 8, 0.8, 42).unwrap();
        let sample = sampler.tune(25);
        let positions = sampler.positions();
        for c in 0..2 {
            assert_eq!(
                sample.slice(s![c, 24, ..]).to_owned(),
                positions.row(c).to_owned()
            );
        }
    }

    fn flatten(sample: &Array3<f64>) -> Array2<f64> {
        let (n_chains, n_steps, dim) = sample.dim();
        let mut out = Array2::zeros((n_chains * n_steps, dim));
        for c in 0..n_chains {
            for t in 0..n_steps {
                for d in 0..dim {
                    out[[c * n_steps + t, d]] = sample[[c, t, d]];
                }
            }
        }
        out
    }
}
