pub mod engine;
pub mod window;

pub use engine::{aggregate_records, LogSummarySink, RollupEngine, SummarySink, DEFAULT_INTERVALS};
pub use window::Rollup;
