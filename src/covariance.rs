//! Dense covariance estimation over accumulated draws.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use num_traits::{Float, FromPrimitive};
use std::error::Error;

/// Computes the unbiased sample covariance of `draws`.
///
/// Rows are draws, columns are parameters; the usual N−1 normalization is
/// used. The result is symmetric by construction. Requires at least two rows.
///
/// # Examples
///
/// ```rust
/// use metric_hmc::covariance::sample_cov;
/// use ndarray::arr2;
///
/// let draws = arr2(&[[1.0, 2.0], [3.0, 2.0], [5.0, 8.0]]);
/// let cov = sample_cov(draws.view()).unwrap();
/// assert_eq!(cov[[0, 0]], 4.0);
/// assert_eq!(cov[[0, 1]], 6.0);
/// ```
pub fn sample_cov<T>(draws: ArrayView2<T>) -> Result<Array2<T>, Box<dyn Error>>
where
    T: Float + FromPrimitive,
{
    let (n, dim) = draws.dim();
    if n < 2 {
        return Err(format!("Expected at least 2 draws for a covariance estimate, got {n}.").into());
    }
    let n_t = T::from_usize(n).ok_or("Draw count does not fit the scalar type.")?;
    let denom = T::from_usize(n - 1).ok_or("Draw count does not fit the scalar type.")?;

    let mean: Array1<T> = draws.sum_axis(Axis(0)).mapv(|s| s / n_t);
    let mut centered = draws.to_owned();
    for mut row in centered.rows_mut() {
        for (value, mu) in row.iter_mut().zip(mean.iter()) {
            *value = *value - *mu;
        }
    }

    let mut cov = Array2::<T>::zeros((dim, dim));
    for i in 0..dim {
        for j in i..dim {
            let mut acc = T::zero();
            for r in 0..n {
                acc = acc + centered[[r, i]] * centered[[r, j]];
            }
            let value = acc / denom;
            cov[[i, j]] = value;
            cov[[j, i]] = value;
        }
    }
    Ok(cov)
}

/// Sample covariance shrunk toward a scaled identity.
///
/// The empirical estimate is weighted by `N/(N + regular_window)` and every
/// diagonal entry receives `regular_variance * regular_window/(N + regular_window)`,
/// treating `regular_window` as a pseudo-count of prior draws with variance
/// `regular_variance`. With `regular_window = 0` this returns the raw sample
/// covariance unchanged.
pub fn regularized_cov<T>(
    draws: ArrayView2<T>,
    regular_window: usize,
    regular_variance: T,
) -> Result<Array2<T>, Box<dyn Error>>
where
    T: Float + FromPrimitive,
{
    if regular_window == 0 {
        return sample_cov(draws);
    }

    let mut cov = sample_cov(draws)?;
    let n = T::from_usize(draws.nrows()).ok_or("Draw count does not fit the scalar type.")?;
    let window = T::from_usize(regular_window).ok_or("Window does not fit the scalar type.")?;
    let shrink = n / (n + window);
    cov.mapv_inplace(|value| value * shrink);
    let bump = regular_variance * window / (n + window);
    for i in 0..cov.nrows() {
        cov[[i, i]] = cov[[i, i]] + bump;
    }
    Ok(cov)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{random_covariance, sample_mvn};
    use approx::assert_abs_diff_eq;
    use ndarray::{arr2, Array1};

    #[test]
    fn test_sample_cov_hand_computed() {
        let draws = arr2(&[[1.0, 2.0], [3.0, 2.0], [5.0, 8.0]]);
        let cov = sample_cov(draws.view()).unwrap();
        assert_abs_diff_eq!(cov, arr2(&[[4.0, 6.0], [6.0, 12.0]]), epsilon = 1e-12);
    }

    #[test]
    fn test_sample_cov_needs_two_draws() {
        let draws = arr2(&[[1.0, 2.0]]);
        assert!(sample_cov(draws.view()).is_err());
    }

    #[test]
    fn test_zero_window_is_identical_to_raw() {
        let draws = arr2(&[[1.0, 2.0], [3.0, 2.0], [5.0, 8.0], [0.5, -1.0]]);
        let raw = sample_cov(draws.view()).unwrap();
        let regularized = regularized_cov(draws.view(), 0, 1e-3).unwrap();
        assert_eq!(raw, regularized);
    }

    #[test]
    fn test_regularized_diagonal_between_raw_and_prior() {
        let draws = arr2(&[[1.0, 2.0], [3.0, 2.0], [5.0, 8.0]]);
        let raw = sample_cov(draws.view()).unwrap();
        let regular_variance = 1.0;
        let regularized = regularized_cov(draws.view(), 5, regular_variance).unwrap();
        for i in 0..2 {
            let lo = regular_variance.min(raw[[i, i]]);
            let hi = regular_variance.max(raw[[i, i]]);
            assert!(
                regularized[[i, i]] > lo && regularized[[i, i]] < hi,
                "diagonal {i}: {} not strictly between {lo} and {hi}",
                regularized[[i, i]]
            );
        }
        // Off-diagonals are only shrunk, never bumped.
        assert_abs_diff_eq!(regularized[[0, 1]], raw[[0, 1]] * 3.0 / 8.0, epsilon = 1e-12);
    }

    #[test]
    fn test_regularization_vanishes_with_sample_size() {
        let cov = random_covariance::<f64>(3, 11);
        let small = sample_mvn(Array1::zeros(3).view(), cov.view(), 50, 7).unwrap();
        let large = sample_mvn(Array1::zeros(3).view(), cov.view(), 5000, 7).unwrap();

        let gap = |draws: ndarray::ArrayView2<f64>| {
            let raw = sample_cov(draws).unwrap();
            let reg = regularized_cov(draws, 10, 1.0).unwrap();
            (&raw - &reg).mapv(f64::abs).sum()
        };
        assert!(
            gap(large.view()) < gap(small.view()),
            "shrinkage should fade as draws accumulate"
        );
    }

    #[test]
    fn test_sample_cov_converges_to_generating_covariance() {
        let cov = random_covariance::<f64>(5, 3);
        let frob = |m: &ndarray::Array2<f64>| m.mapv(|x| x * x).sum().sqrt();

        for seed in [19, 20, 21] {
            let err_at = |n: usize| {
                let draws = sample_mvn(Array1::zeros(5).view(), cov.view(), n, seed).unwrap();
                let estimate = sample_cov(draws.view()).unwrap();
                frob(&(&estimate - &cov)) / frob(&cov)
            };
            let coarse = err_at(200);
            let fine = err_at(5_000);
            assert!(
                fine < coarse,
                "seed {seed}: error {fine} at n=5000 should be below {coarse} at n=200"
            );
            assert!(fine < 0.1, "seed {seed}: relative error {fine} too large");
        }
    }
}
