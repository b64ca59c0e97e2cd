//! Seams to the outside world: price dumps in, signals and pair records out.

pub mod price_file;
pub mod sinks;

pub use price_file::{load_price_file, write_price_file};
pub use sinks::{JsonlPairStore, LogSignalSink, PairStore, SignalSink};
