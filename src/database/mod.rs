pub mod connection;
pub mod operations;

pub use connection::{create_ssl_connector, execute_with_retry};
pub use operations::{ensure_schema, get_summaries, store_summary, PostgresSummaryStore};
