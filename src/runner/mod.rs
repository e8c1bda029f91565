mod driver;
mod scheduler;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::arrival::{Arrival, ArrivalModel, ExpSampler};
use crate::plan::{LoadPattern, Plan};
use crate::request::Requester;
use crate::Rate;

/// Drain window applied when a zero-length graceful shutdown is configured.
const DEFAULT_SHUTDOWN_WINDOW: Duration = Duration::from_secs(5);

/// How the runner treats in-flight requests once admission has stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Shutdown {
    /// Cancel in-flight requests as soon as admission stops.
    Immediate,
    /// Give in-flight requests this long to drain, then force-cancel
    /// whatever remains. A zero window selects the five second default.
    Graceful(#[serde(with = "humantime_serde")] Duration),
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown::Graceful(DEFAULT_SHUTDOWN_WINDOW)
    }
}

/// Load run configuration.
///
/// Out-of-range values are clamped into range by [`Runner::new`] rather
/// than rejected; validating user input is the embedding application's
/// job.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Worker pool size.
    pub concurrency: usize,
    /// Hard cap on admissions; zero means unbounded.
    pub total_requests: u64,
    /// Wall-clock admission deadline.
    #[serde(with = "humantime_serde")]
    pub duration: Option<Duration>,
    /// Base rate when no load patterns are declared; zero means unlimited.
    pub rate: Rate,
    /// Arrival process shaping the gaps between admissions.
    pub arrival_model: ArrivalModel,
    /// Seed for the Poisson sampler; zero derives a seed from the clock.
    pub random_seed: u64,
    /// Load patterns compiled into the rate plan. A non-empty plan
    /// overrides `rate`.
    pub load_patterns: Vec<LoadPattern>,
    /// Drain policy applied once admission stops.
    pub graceful_shutdown: Shutdown,
    /// Token-bucket burst override; defaults to `ceil(rate)`.
    pub burst: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 1,
            total_requests: 0,
            duration: None,
            rate: Rate::ZERO,
            arrival_model: ArrivalModel::default(),
            random_seed: 0,
            load_patterns: Vec::new(),
            graceful_shutdown: Shutdown::default(),
            burst: None,
        }
    }
}

/// Aggregate outcome of a load run.
#[derive(Clone, Debug, Serialize)]
pub struct Report {
    /// Number of requests admitted (and therefore handed to a worker).
    pub total: u64,
    /// Number of requester invocations that returned a failure.
    pub errors: u64,
    /// Wall-clock length of the run, including the drain window.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

/// Drives a load run: admits requests at the configured rate and executes
/// them on a fixed-size worker pool.
///
/// # Examples
/// ```no_run
/// use std::sync::Arc;
/// use stoker::{Config, Runner};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example(requester: Arc<dyn stoker::Requester>) {
/// let config = Config {
///     concurrency: 8,
///     total_requests: 1_000,
///     rate: stoker::Rate(100.0),
///     ..Config::default()
/// };
///
/// let report = Runner::new(config, requester)
///     .run(CancellationToken::new())
///     .await;
/// println!("{} sent, {} failed", report.total, report.errors);
/// # }
/// ```
pub struct Runner {
    config: Config,
    requester: Arc<dyn Requester>,
    sampler: Option<ExpSampler>,
}

impl Runner {
    /// Creates a runner, clamping out-of-range configuration into range.
    pub fn new(config: Config, requester: Arc<dyn Requester>) -> Self {
        Self {
            config: normalize(config),
            requester,
            sampler: None,
        }
    }

    /// Injects the `Exp(1)` sampler used by the Poisson arrival process,
    /// replacing the seeded default. Mainly useful for deterministic
    /// tests.
    pub fn sampler(mut self, sampler: ExpSampler) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Runs to completion and reports the outcome.
    ///
    /// Cancelling `cancel` stops admission and force-terminates in-flight
    /// requests. The run itself never fails: requester errors are counted,
    /// not propagated.
    pub async fn run(self, cancel: CancellationToken) -> Report {
        let started = Instant::now();

        // Nested scopes: `run` interrupts in-flight requests,
        // `admission` stops the scheduler, and the plan driver sits one
        // level further in so that plan exhaustion stops admission without
        // touching in-flight work.
        let run = cancel.child_token();
        let admission = run.child_token();

        let plan = Plan::compile(&self.config.load_patterns);
        let initial_rate = match &plan {
            Some(plan) => plan.rate_at(Duration::ZERO).unwrap_or(Rate::ZERO),
            None => self.config.rate,
        };

        let arrival = Arc::new(Arrival::new(
            self.config.arrival_model,
            initial_rate,
            self.config.burst,
            self.config.random_seed,
            self.sampler,
        ));

        let total = Arc::new(AtomicU64::new(0));
        let errors = Arc::new(AtomicU64::new(0));

        let (permit_tx, permit_rx) = mpsc::channel(self.config.concurrency);
        let permit_rx = Arc::new(tokio::sync::Mutex::new(permit_rx));

        let mut workers = JoinSet::new();
        for _ in 0..self.config.concurrency {
            workers.spawn(scheduler::work(
                Arc::clone(&permit_rx),
                Arc::clone(&self.requester),
                run.clone(),
                Arc::clone(&errors),
            ));
        }

        // The scheduler watches the innermost live scope: when a plan is
        // present its exhaustion must stop admission too.
        let gate = match &plan {
            Some(_) => admission.child_token(),
            None => admission.clone(),
        };

        let driver = plan.map(|plan| {
            tokio::spawn(driver::drive(plan, Arc::clone(&arrival), gate.clone()))
        });

        if let Some(deadline) = self.config.duration {
            let admission = admission.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(deadline) => admission.cancel(),
                    _ = admission.cancelled() => {}
                }
            });
        }

        debug!(
            concurrency = self.config.concurrency,
            total_requests = self.config.total_requests,
            "starting load run"
        );

        let producer = tokio::spawn(scheduler::produce(
            permit_tx,
            Arc::clone(&arrival),
            gate.clone(),
            self.config.total_requests,
            Arc::clone(&total),
        ));

        // Wind-down begins once the scheduler has exited and closed the
        // permit channel; only then is the graceful window armed.
        let _ = producer.await;

        let drain = async move { while workers.join_next().await.is_some() {} };
        tokio::pin!(drain);

        match self.config.graceful_shutdown {
            Shutdown::Immediate => {
                run.cancel();
                drain.await;
            }
            Shutdown::Graceful(window) => {
                tokio::select! {
                    _ = &mut drain => {}
                    _ = run.cancelled() => drain.await,
                    _ = tokio::time::sleep(window) => {
                        debug!(?window, "graceful shutdown window elapsed, force-cancelling");
                        run.cancel();
                        drain.await;
                    }
                }
            }
        }

        // The plan driver deliberately keeps retargeting after the
        // admission cap is reached; rein it in now that the pool is dry.
        admission.cancel();
        if let Some(driver) = driver {
            let _ = driver.await;
        }

        let report = Report {
            total: total.load(Ordering::Relaxed),
            errors: errors.load(Ordering::Relaxed),
            duration: started.elapsed(),
        };
        info!(
            total = report.total,
            errors = report.errors,
            "load run complete"
        );

        report
    }
}

fn normalize(mut config: Config) -> Config {
    config.concurrency = config.concurrency.max(1);
    config.rate = Rate(config.rate.0.max(0.0));
    if let Shutdown::Graceful(window) = config.graceful_shutdown {
        if window.is_zero() {
            config.graceful_shutdown = Shutdown::Graceful(DEFAULT_SHUTDOWN_WINDOW);
        }
    }
    config
}
