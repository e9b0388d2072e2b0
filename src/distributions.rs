//! Gradient-bearing target distributions and synthetic-data helpers.

use crate::metric::{cholesky, invert_spd};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, LinalgScalar};
use num_traits::{Float, FromPrimitive};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use std::error::Error;

/// A continuous target that evaluates its unnormalized log-density and the
/// gradient in one call.
///
/// `grad` has the dimensionality of `position` and is overwritten in full.
pub trait GradientTarget<T: Float> {
    fn logp_and_grad(&self, position: ArrayView1<T>, grad: &mut Array1<T>) -> T;
}

/// A multivariate Gaussian with dense covariance.
///
/// The precision matrix is computed once at construction, so per-step
/// evaluations are a single matrix-vector product.
#[derive(Debug, Clone)]
pub struct MvGaussian<T> {
    pub mean: Array1<T>,
    cov: Array2<T>,
    precision: Array2<T>,
}

impl<T> MvGaussian<T>
where
    T: Float + LinalgScalar,
{
    pub fn new(mean: Array1<T>, cov: Array2<T>) -> Result<Self, Box<dyn Error>> {
        if cov.nrows() != mean.len() || cov.ncols() != mean.len() {
            return Err(format!(
                "Expected a {d}x{d} covariance for a {d}-dimensional mean, got {r}x{c}.",
                d = mean.len(),
                r = cov.nrows(),
                c = cov.ncols()
            )
            .into());
        }
        let precision = invert_spd(cov.view())
            .ok_or("Covariance of the Gaussian target is not positive definite.")?;
        Ok(Self {
            mean,
            cov,
            precision,
        })
    }

    pub fn covariance(&self) -> ArrayView2<T> {
        self.cov.view()
    }
}

impl<T> GradientTarget<T> for MvGaussian<T>
where
    T: Float + LinalgScalar,
{
    fn logp_and_grad(&self, position: ArrayView1<T>, grad: &mut Array1<T>) -> T {
        let diff = &position - &self.mean;
        let pd = self.precision.dot(&diff);
        for (g, v) in grad.iter_mut().zip(pd.iter()) {
            *g = -*v;
        }
        -T::from(0.5).unwrap() * diff.dot(&pd)
    }
}

/// An isotropic Gaussian centered at the origin.
#[derive(Debug, Clone, Copy)]
pub struct IsotropicGaussian<T> {
    pub std: T,
}

impl<T: Float> IsotropicGaussian<T> {
    pub fn new(std: T) -> Self {
        Self { std }
    }
}

impl<T> GradientTarget<T> for IsotropicGaussian<T>
where
    T: Float,
{
    fn logp_and_grad(&self, position: ArrayView1<T>, grad: &mut Array1<T>) -> T {
        let inv_var = T::one() / (self.std * self.std);
        let mut sq = T::zero();
        for (g, &x) in grad.iter_mut().zip(position.iter()) {
            *g = -x * inv_var;
            sq = sq + x * x;
        }
        -T::from(0.5).unwrap() * sq * inv_var
    }
}

/// Draws `n` exact samples from `N(mean, cov)` via the Cholesky factor.
pub fn sample_mvn<T>(
    mean: ArrayView1<T>,
    cov: ArrayView2<T>,
    n: usize,
    seed: u64,
) -> Result<Array2<T>, Box<dyn Error>>
where
    T: Float + LinalgScalar,
    StandardNormal: Distribution<T>,
{
    let dim = mean.len();
    if cov.nrows() != dim || cov.ncols() != dim {
        return Err(format!(
            "Expected a {dim}x{dim} covariance, got {}x{}.",
            cov.nrows(),
            cov.ncols()
        )
        .into());
    }
    let chol = cholesky(cov).ok_or("Covariance is not positive definite.")?;

    let mut rng = SmallRng::seed_from_u64(seed);
    let mut out = Array2::<T>::zeros((n, dim));
    let mut z = Array1::<T>::zeros(dim);
    for r in 0..n {
        for value in z.iter_mut() {
            *value = rng.sample(StandardNormal);
        }
        let x = chol.dot(&z);
        for j in 0..dim {
            out[[r, j]] = mean[j] + x[j];
        }
    }
    Ok(out)
}

/// A random well-conditioned covariance with substantial correlations:
/// `F·Fᵀ/dim` for a standard-normal factor `F`, plus a small diagonal bump.
pub fn random_covariance<T>(dim: usize, seed: u64) -> Array2<T>
where
    T: Float + FromPrimitive,
    StandardNormal: Distribution<T>,
{
    let mut rng = SmallRng::seed_from_u64(seed);
    let factor = Array2::<T>::from_shape_fn((dim, dim), |_| rng.sample(StandardNormal));
    let scale = T::from_usize(dim).unwrap();

    let mut cov = Array2::<T>::zeros((dim, dim));
    for i in 0..dim {
        for j in i..dim {
            let mut acc = T::zero();
            for k in 0..dim {
                acc = acc + factor[[i, k]] * factor[[j, k]];
            }
            let value = acc / scale;
            cov[[i, j]] = value;
            cov[[j, i]] = value;
        }
    }
    let bump = T::from(0.1).unwrap();
    for i in 0..dim {
        cov[[i, i]] = cov[[i, i]] + bump;
    }
    cov
}
