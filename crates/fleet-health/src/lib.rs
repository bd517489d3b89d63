//! `fleet-health`: the `health` scheduler executor.
//!
//! Params are a JSON [`Probe`]: an HTTP GET that must answer with the expected
//! status, or a plain TCP connect. A failed probe fails the run, so the
//! outcome shows up as an `error` record on the schedule.

pub mod error;
pub mod probe;

pub use error::{HealthError, Result};
pub use probe::{register, HealthProber, HealthTask, Probe, HEALTH_EXECUTOR};
