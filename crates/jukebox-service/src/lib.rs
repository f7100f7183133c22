//! The single-flight fetch-and-serve core of jukebox.
//!
//! A request for a media key is deduplicated by the [`Coordinator`](coordinator::Coordinator),
//! fetched at most once by a [`Fetcher`](fetch::Fetcher), gated on the file being complete by the
//! [`ReadinessGate`](readiness::ReadinessGate), streamed out by the
//! [`AudioService`](service::AudioService) and finally purged by the
//! [`Reclaimer`](reclaim::Reclaimer).

#[macro_use]
pub mod metrics;

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod readiness;
pub mod reclaim;
pub mod search;
pub mod service;
pub mod storage;
pub mod types;
pub mod utils;

#[cfg(any(feature = "test", test))]
pub mod test;
