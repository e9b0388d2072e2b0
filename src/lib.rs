pub mod adapt;
pub mod core;
pub mod covariance;
pub mod distributions;
pub mod hmc;
pub mod io;
pub mod metric;
pub mod schedule;
pub mod stats;
