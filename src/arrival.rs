use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::Rate;

const STATE_POISONED: &str = "arrival controller state poisoned";

/// Statistical shape of the gaps between consecutive admissions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArrivalModel {
    /// Evenly spaced admissions behind a token bucket.
    #[default]
    Uniform,
    /// Exponentially distributed gaps with mean `1 / rate`.
    Poisson,
}

/// Draws `Exp(1)` variates for the Poisson arrival process.
///
/// Injectable so that tests can pin the process to a known sequence.
pub type ExpSampler = Box<dyn FnMut() -> f64 + Send>;

/// Returned by [`Arrival::wait`] when the governing scope was cancelled
/// before the next admission came due.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Cancelled;

/// Gates the issuance of requests in time.
///
/// The controller owns the current target rate. The scheduler blocks on
/// [`wait`](Arrival::wait) while the plan driver retargets the rate through
/// [`set_rate`](Arrival::set_rate) from another task; both operations are
/// safe to call concurrently.
pub(crate) enum Arrival {
    Uniform(TokenBucket),
    Poisson(PoissonGate),
}

impl Arrival {
    pub(crate) fn new(
        model: ArrivalModel,
        rate: Rate,
        burst: Option<u32>,
        seed: u64,
        sampler: Option<ExpSampler>,
    ) -> Self {
        match model {
            ArrivalModel::Uniform => Arrival::Uniform(TokenBucket::new(rate, burst)),
            ArrivalModel::Poisson => {
                let sampler = sampler.unwrap_or_else(|| default_sampler(seed));
                Arrival::Poisson(PoissonGate::new(rate, sampler))
            }
        }
    }

    /// Suspends until the next request may be issued, or until `cancel`
    /// fires.
    pub(crate) async fn wait(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        match self {
            Arrival::Uniform(bucket) => bucket.wait(cancel).await,
            Arrival::Poisson(gate) => gate.wait(cancel).await,
        }
    }

    /// Replaces the target rate. Safe to call while another task is parked
    /// in [`wait`](Arrival::wait).
    pub(crate) fn set_rate(&self, rate: Rate) {
        match self {
            Arrival::Uniform(bucket) => bucket.set_rate(rate),
            Arrival::Poisson(gate) => gate.set_rate(rate),
        }
    }
}

/// Token bucket with a reconfigurable fill rate.
///
/// Burst capacity follows the rate as `max(1, ceil(rate))` unless pinned by
/// an explicit override. A non-positive rate disables pacing entirely.
pub(crate) struct TokenBucket {
    state: Mutex<BucketState>,
    burst_override: Option<u32>,
    retargeted: Notify,
}

struct BucketState {
    rate: f64,
    burst: f64,
    tokens: f64,
    updated: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        if self.rate > 0.0 {
            let elapsed = (now - self.updated).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        }
        self.updated = now;
    }
}

impl TokenBucket {
    fn new(rate: Rate, burst_override: Option<u32>) -> Self {
        let burst = burst_capacity(rate, burst_override);
        Self {
            state: Mutex::new(BucketState {
                rate: rate.0.max(0.0),
                burst,
                tokens: burst,
                updated: Instant::now(),
            }),
            burst_override,
            retargeted: Notify::new(),
        }
    }

    async fn wait(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        loop {
            let shortfall = {
                let mut state = self.state.lock().expect(STATE_POISONED);
                state.refill(Instant::now());

                if state.rate <= 0.0 {
                    return Ok(());
                }
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }

                // Round sub-nanosecond shortfalls up so the sleep always
                // advances the clock.
                Duration::from_secs_f64((1.0 - state.tokens) / state.rate)
                    .max(Duration::from_nanos(1))
            };

            // A retarget invalidates the computed shortfall, so sleeping
            // races against the notify and loops back to re-read the bucket.
            tokio::select! {
                _ = tokio::time::sleep(shortfall) => {}
                _ = self.retargeted.notified() => {}
                _ = cancel.cancelled() => return Err(Cancelled),
            }
        }
    }

    fn set_rate(&self, rate: Rate) {
        {
            let mut state = self.state.lock().expect(STATE_POISONED);
            state.refill(Instant::now());
            state.rate = rate.0.max(0.0);
            state.burst = burst_capacity(rate, self.burst_override);
            state.tokens = state.tokens.min(state.burst);
        }
        self.retargeted.notify_waiters();
    }
}

fn burst_capacity(rate: Rate, burst_override: Option<u32>) -> f64 {
    match burst_override {
        Some(burst) => f64::from(burst.max(1)),
        None if rate.is_unlimited() => 0.0,
        None => rate.0.ceil().max(1.0),
    }
}

/// Poisson arrival gate: exponential think time between admissions.
pub(crate) struct PoissonGate {
    state: Mutex<PoissonState>,
}

struct PoissonState {
    rate: f64,
    sampler: ExpSampler,
}

impl PoissonGate {
    fn new(rate: Rate, sampler: ExpSampler) -> Self {
        Self {
            state: Mutex::new(PoissonState {
                rate: rate.0.max(0.0),
                sampler,
            }),
        }
    }

    async fn wait(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let delay = {
            let mut state = self.state.lock().expect(STATE_POISONED);

            // Rate zero acts as an open gate so that a plan transition can
            // use `set_rate(0)` as a temporary off-switch without stranding
            // the scheduler.
            if state.rate <= 0.0 {
                return Ok(());
            }

            let variate = (state.sampler)().max(0.0);
            Duration::from_secs_f64(variate / state.rate)
        };

        if delay.is_zero() {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(Cancelled),
        }
    }

    fn set_rate(&self, rate: Rate) {
        self.state.lock().expect(STATE_POISONED).rate = rate.0.max(0.0);
    }
}

fn default_sampler(seed: u64) -> ExpSampler {
    let seed = if seed == 0 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
    } else {
        seed
    };

    let mut rng = StdRng::seed_from_u64(seed);
    Box::new(move || -(1.0 - rng.gen::<f64>()).ln())
}
