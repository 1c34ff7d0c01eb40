//! History collector for the YuniKorn scheduler.
//!
//! The crate ships the `yhs-collector` binary. The library surface exists so
//! the sync engine can be driven from integration tests.

pub mod api;
pub mod client;
pub mod config;
pub mod counters;
pub mod db;
pub mod shutdown;
pub mod store;
pub mod sync;
pub mod workqueue;
