//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Read against the remote store:
//!     → retries.rs (check if retryable, retry with backoff)
//!     → backoff.rs (exponential delay with jitter)
//!     → Exhausted: error surfaces to the caller (fatal in the change loop)
//! ```
//!
//! # Design Decisions
//! - Only backend communication failures are retried; absence and decode
//!   errors are answers, not failures
//! - Attempts are bounded; the contract stays fail-fast after exhaustion
//! - Jittered backoff prevents thundering herd against the store

pub mod backoff;
pub mod retries;

pub use retries::{RetryPolicy, Retryable};
