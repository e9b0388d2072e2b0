//! Builds the burst schedule for windowed metric tuning.

use std::error::Error;

/// Splits a tuning budget into bursts of doubling length.
///
/// The schedule starts at `initial_window` and doubles per entry while the
/// cumulative sum stays within `total_tune - burn_in`; a final entry absorbs
/// whatever remains so the windows sum to the budget exactly. A zero-length
/// remainder is omitted.
///
/// # Examples
///
/// ```rust
/// use metric_hmc::schedule::expanding_windows;
///
/// let windows = expanding_windows(25, 500, 5000).unwrap();
/// assert_eq!(windows, vec![25, 50, 100, 200, 400, 800, 1600, 1325]);
/// assert_eq!(windows.iter().sum::<usize>(), 4500);
/// ```
pub fn expanding_windows(
    initial_window: usize,
    burn_in: usize,
    total_tune: usize,
) -> Result<Vec<usize>, Box<dyn Error>> {
    if initial_window == 0 {
        return Err("Expected initial_window to be positive.".into());
    }
    if total_tune <= burn_in {
        return Err(format!(
            "Expected total_tune ({total_tune}) to exceed burn_in ({burn_in})."
        )
        .into());
    }

    let budget = total_tune - burn_in;
    let mut windows = Vec::new();
    let mut assigned = 0;
    let mut width = initial_window;
    while assigned + width <= budget {
        windows.push(width);
        assigned += width;
        width *= 2;
    }
    if assigned < budget {
        windows.push(budget - assigned);
    }
    Ok(windows)
}
