pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod rollup;
pub mod utils;
pub mod vantage;
