//! Dense mass-matrix handling for Hamiltonian samplers.
//!
//! A [`DenseMetric`] is built from a covariance estimate `Σ` over the target's
//! parameter space and plays the role of the inverse mass matrix: momenta are
//! drawn from `N(0, Σ⁻¹)`, velocities are `Σ·p`, and the kinetic energy is
//! `½·pᵀΣp`. Rebuilding the metric is how tuning information enters the
//! sampler.

use ndarray::{Array1, Array2, ArrayView2, LinalgScalar};
use num_traits::Float;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use std::error::Error;

#[derive(Debug, Clone)]
pub struct DenseMetric<T> {
    cov: Array2<T>,
    chol: Array2<T>,
}

impl<T> DenseMetric<T>
where
    T: Float + LinalgScalar,
{
    /// The unit metric. Used before any draws exist to estimate from.
    pub fn identity(dim: usize) -> Self {
        Self {
            cov: Array2::eye(dim),
            chol: Array2::eye(dim),
        }
    }

    /// Builds a metric from a covariance estimate.
    ///
    /// Fails if the matrix is not square or its Cholesky factorization breaks
    /// down, which is where a singular estimate (too few draws for the
    /// dimension) surfaces.
    pub fn from_covariance(cov: Array2<T>) -> Result<Self, Box<dyn Error>> {
        if cov.nrows() != cov.ncols() {
            return Err(format!(
                "Expected a square covariance matrix, got {}x{}.",
                cov.nrows(),
                cov.ncols()
            )
            .into());
        }
        let chol = cholesky(cov.view()).ok_or_else(|| {
            format!(
                "Covariance estimate of dimension {} is not positive definite.",
                cov.nrows()
            )
        })?;
        Ok(Self { cov, chol })
    }

    pub fn dim(&self) -> usize {
        self.cov.nrows()
    }

    /// The covariance the metric was built from (the inverse mass matrix).
    pub fn covariance(&self) -> ArrayView2<T> {
        self.cov.view()
    }

    /// Kinetic energy `½·pᵀΣp` of a momentum vector.
    pub fn kinetic(&self, momentum: &Array1<T>) -> T {
        let half = T::from(0.5).unwrap();
        half * momentum.dot(&self.cov.dot(momentum))
    }

    /// Velocity `Σ·p` entering the leapfrog position update.
    pub fn velocity(&self, momentum: &Array1<T>) -> Array1<T> {
        self.cov.dot(momentum)
    }

    /// Draws a momentum from `N(0, Σ⁻¹)` by solving `Lᵀp = z` with `z` standard
    /// normal and `L` the Cholesky factor of `Σ`.
    pub fn sample_momentum<R: Rng>(&self, rng: &mut R) -> Array1<T>
    where
        StandardNormal: Distribution<T>,
    {
        let dim = self.dim();
        let z: Array1<T> = (0..dim).map(|_| rng.sample(StandardNormal)).collect();
        solve_lower_transposed(self.chol.view(), z)
    }
}

/// Lower-triangular Cholesky factor of a symmetric matrix, or `None` when the
/// matrix is not positive definite.
pub(crate) fn cholesky<T>(a: ArrayView2<T>) -> Option<Array2<T>>
where
    T: Float,
{
    let dim = a.nrows();
    let mut l = Array2::<T>::zeros((dim, dim));
    for i in 0..dim {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum = sum - l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= T::zero() || !sum.is_finite() {
                    return None;
                }
                l[[i, j]] = sum.sqrt();
            } else {
                let d = l[[j, j]];
                if d <= T::zero() || !d.is_finite() {
                    return None;
                }
                l[[i, j]] = sum / d;
            }
        }
    }
    Some(l)
}

/// Inverse of a symmetric positive-definite matrix via its Cholesky factor.
pub(crate) fn invert_spd<T>(a: ArrayView2<T>) -> Option<Array2<T>>
where
    T: Float,
{
    let dim = a.nrows();
    let l = cholesky(a)?;

    let mut inv_l = Array2::<T>::zeros((dim, dim));
    for i in 0..dim {
        inv_l[[i, i]] = T::one() / l[[i, i]];
        for j in (i + 1)..dim {
            let mut sum = T::zero();
            for k in i..j {
                sum = sum - l[[j, k]] * inv_l[[k, i]];
            }
            inv_l[[j, i]] = sum / l[[j, j]];
        }
    }

    let mut inv = Array2::<T>::zeros((dim, dim));
    for i in 0..dim {
        for j in 0..=i {
            let mut sum = T::zero();
            for k in i..dim {
                sum = sum + inv_l[[k, i]] * inv_l[[k, j]];
            }
            inv[[i, j]] = sum;
            inv[[j, i]] = sum;
        }
    }
    Some(inv)
}

/// Solves `Lᵀx = z` for `x` by back substitution, `L` lower triangular.
fn solve_lower_transposed<T>(l: ArrayView2<T>, z: Array1<T>) -> Array1<T>
where
    T: Float,
{
    let dim = z.len();
    let mut x = Array1::<T>::zeros(dim);
    for i in (0..dim).rev() {
        let mut sum = z[i];
        for j in (i + 1)..dim {
            sum = sum - l[[j, i]] * x[j];
        }
        x[i] = sum / l[[i, i]];
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance::sample_cov;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, Array2};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn test_cholesky_hand_computed() {
        let cov = arr2(&[[4.0, 2.0], [2.0, 3.0]]);
        let l = cholesky(cov.view()).unwrap();
        let expected = arr2(&[[2.0, 0.0], [1.0, 2.0_f64.sqrt()]]);
        assert_abs_diff_eq!(l, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_cholesky_rejects_singular() {
        let cov = arr2(&[[1.0, 1.0], [1.0, 1.0]]);
        assert!(cholesky(cov.view()).is_none());
        assert!(DenseMetric::from_covariance(cov).is_err());
    }

    #[test]
    fn test_invert_spd_hand_computed() {
        let cov = arr2(&[[4.0, 2.0], [2.0, 3.0]]);
        let inv = invert_spd(cov.view()).unwrap();
        let expected = arr2(&[[0.375, -0.25], [-0.25, 0.5]]);
        assert_abs_diff_eq!(inv, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_kinetic_and_velocity() {
        let metric = DenseMetric::from_covariance(arr2(&[[2.0, 0.6], [0.6, 1.0]])).unwrap();
        let momentum = arr1(&[1.0, 2.0]);
        assert_abs_diff_eq!(
            metric.velocity(&momentum),
            arr1(&[3.2, 2.6]),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(metric.kinetic(&momentum), 4.2, epsilon = 1e-12);
    }

    #[test]
    fn test_identity_momentum_is_standard_normal_energy() {
        let metric = DenseMetric::<f64>::identity(3);
        let momentum = arr1(&[1.0, -2.0, 0.5]);
        assert_abs_diff_eq!(metric.kinetic(&momentum), 0.5 * 5.25, epsilon = 1e-12);
        assert_abs_diff_eq!(metric.velocity(&momentum), momentum, epsilon = 1e-12);
    }

    #[test]
    fn test_momentum_covariance_matches_inverse() {
        let cov = arr2(&[[2.0, 0.6], [0.6, 1.0]]);
        let metric = DenseMetric::from_covariance(cov.clone()).unwrap();
        let inv = invert_spd(cov.view()).unwrap();

        let mut rng = SmallRng::seed_from_u64(42);
        let n = 50_000;
        let mut draws = Array2::<f64>::zeros((n, 2));
        for r in 0..n {
            let p = metric.sample_momentum(&mut rng);
            draws[[r, 0]] = p[0];
            draws[[r, 1]] = p[1];
        }
        let empirical = sample_cov(draws.view()).unwrap();
        assert_abs_diff_eq!(empirical, inv, epsilon = 0.05);
    }
}
