//! Failure isolation for downstream AI providers.
//!
//! One three-state breaker per downstream target, so a failing provider
//! never blocks calls to a healthy one. Recovery is time-based with
//! exponential, capped backoff and a half-open probe phase.

mod backoff;
mod circuit;
mod registry;

pub use backoff::ExponentialBackoff;
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState};
pub use registry::{BreakerError, BreakerRegistry};
