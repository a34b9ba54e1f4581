pub mod asset_cache;
pub mod batch;
pub mod cli;
pub mod config;
pub mod contract;
pub mod download;
pub mod error;
pub mod failure_log;
pub mod load_config;
pub mod output;
pub mod prefetch;
pub mod progress;
pub mod references;
pub mod resource;
pub mod retry;
pub mod source;
pub mod sync_cache;
pub mod synchronise;
