//! An identity-keyed, non-expiring cache of subjects with single-flight loading.
//!
//! The [`LoadCoordinator`](coordinator::LoadCoordinator) is the entry point for most callers: it
//! translates external keys into internal [`Identity`](types::Identity) values, deduplicates
//! concurrent loads from the backing [`Storage`](services::Storage), and bounds how long a caller
//! waits for a load to finish before falling back to a substitute.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod coordinator;
pub mod logging;
pub mod services;
pub mod types;
pub mod utils;
