//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! fetch for one indicator:
//!     → breaker.rs (gate: may the network be tried at all?)
//!     → orchestrator.rs (candidate endpoints, strictly in order)
//!     → retry.rs (per endpoint: timeout per attempt, exponential backoff)
//!     → breaker.rs (one failure per failed attempt, reset on success)
//! ```

pub mod breaker;
pub mod orchestrator;
pub mod retry;

pub use breaker::{BreakerLedger, BreakerState};
pub use orchestrator::{EndpointOrchestrator, EndpointsExhausted};
pub use retry::{backoff_delay, RetryEngine};
