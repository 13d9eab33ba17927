//! Resilient data fetching for the Sergipe SDG indicator dashboard.
//!
//! Each indicator goes through [`indicators::IndicatorService`]: cache,
//! static snapshot, circuit breaker, multi-endpoint retries and finally a
//! historical fallback value.

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod indicators;
pub mod logging;
pub mod resilience;
pub mod storage;
