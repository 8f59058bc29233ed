pub mod api;
pub mod bench;
pub mod config;
pub mod dedup;
pub mod error;
pub mod generator;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod query;
pub mod rollup;
pub mod store;
pub mod transport;
