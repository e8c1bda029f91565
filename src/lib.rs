use std::{ops::Deref, str::FromStr};

use serde::{Deserialize, Serialize};

mod arrival;
mod middleware;
mod plan;
mod request;
mod runner;

pub use arrival::{ArrivalModel, ExpSampler};
pub use middleware::{
    LogFailures, Retry, RetryDelay, RetryInterrupted, RetryPolicy, RetryPredicate,
};
pub use plan::{LoadPattern, Plan, Step};
pub use request::{FailureLogger, HttpError, Requester};
pub use runner::{Config, Report, Runner, Shutdown};

/// Request rate in requests per second.
///
/// Rates are real-valued so that ramps can be sampled smoothly. A rate of
/// zero (or below) means "no pacing".
#[derive(Clone, Copy, Default, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Rate(pub f64);

impl Rate {
    pub const ZERO: Rate = Rate(0.0);

    /// Whether this rate imposes any pacing at all.
    pub fn is_unlimited(&self) -> bool {
        self.0 <= 0.0
    }
}

impl std::fmt::Debug for Rate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Deref for Rate {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for Rate {
    type Err = std::num::ParseFloatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Rate(f64::from_str(s)?))
    }
}
