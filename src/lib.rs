pub mod backtest;
pub mod cointegration;
pub mod config;
pub mod error;
pub mod half_life;
pub mod logging;
pub mod model;
pub mod monitor;
pub mod ports;
pub mod registry;
pub mod scanner;
pub mod signal;
pub mod spread;
pub mod stats;
pub mod synthetic;
pub mod trade;
pub mod workers;

pub use error::{AnalysisError, AnalysisResult};
