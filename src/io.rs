#[cfg(feature = "csv")]
use csv::Writer;
#[cfg(feature = "csv")]
use ndarray::ArrayView3;
#[cfg(feature = "csv")]
use std::error::Error;
#[cfg(feature = "csv")]
use std::fs::File;

#[cfg(feature = "csv")]
/// Saves a sample of shape `[n_chains, n_steps, dim]` as a CSV file.
///
/// The header row is `chain,sample,dim_0,...`; every draw becomes one row.
///
/// # Examples
///
/// ```rust
/// # use metric_hmc::io::save_csv;
/// use ndarray::Array3;
/// let sample = Array3::<f64>::zeros((2, 3, 2));
/// save_csv(sample.view(), "/tmp/sample.csv")?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn save_csv<T: std::fmt::Display + Copy>(
    sample: ArrayView3<T>,
    filename: &str,
) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(filename)?);
    let (n_chains, n_steps, dim) = sample.dim();

    let mut header: Vec<String> = vec!["chain".to_string(), "sample".to_string()];
    header.extend((0..dim).map(|i| format!("dim_{}", i)));
    wtr.write_record(&header)?;

    for chain in 0..n_chains {
        for step in 0..n_steps {
            let mut row = vec![chain.to_string(), step.to_string()];
            row.extend((0..dim).map(|d| sample[[chain, step, d]].to_string()));
            wtr.write_record(&row)?;
        }
    }

    wtr.flush()?;
    Ok(())
}
