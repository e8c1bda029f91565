use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use stoker::{ArrivalModel, Config, LoadPattern, Rate, Requester, Runner, Shutdown, Step};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Counts invocations and holds each request open for a fixed latency,
/// failing if force-cancelled mid-request.
struct StubRequester {
    calls: AtomicU64,
    latency: Duration,
}

impl StubRequester {
    fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU64::new(0),
            latency,
        })
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Requester for StubRequester {
    async fn call(&self, cancel: CancellationToken) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        if self.latency.is_zero() {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(self.latency) => Ok(()),
            _ = cancel.cancelled() => Err(anyhow!("request cancelled")),
        }
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

#[tokio::test(start_paused = true)]
async fn total_bound_admits_exactly_the_cap() {
    let requester = StubRequester::new(ms(1));
    let config = Config {
        concurrency: 4,
        total_requests: 25,
        ..Config::default()
    };

    let report = Runner::new(config, requester.clone())
        .run(CancellationToken::new())
        .await;

    assert_eq!(report.total, 25);
    assert_eq!(requester.calls(), 25);
    assert_eq!(report.errors, 0);
}

#[tokio::test(start_paused = true)]
async fn duration_bound_stops_admission_on_deadline() {
    let requester = StubRequester::new(ms(5));
    let config = Config {
        concurrency: 10,
        duration: Some(ms(50)),
        ..Config::default()
    };

    let report = Runner::new(config, requester.clone())
        .run(CancellationToken::new())
        .await;

    assert!(report.total > 0);
    assert!(
        report.duration >= ms(40) && report.duration <= ms(250),
        "duration {:?}",
        report.duration
    );
}

#[tokio::test(start_paused = true)]
async fn rate_cap_bounds_throughput() {
    let requester = StubRequester::new(Duration::ZERO);
    let config = Config {
        concurrency: 20,
        duration: Some(ms(100)),
        rate: Rate(100.0),
        burst: Some(1),
        ..Config::default()
    };

    let report = Runner::new(config, requester.clone())
        .run(CancellationToken::new())
        .await;

    // 100 RPS over 100ms with a burst of one: roughly eleven admissions,
    // never more than twelve.
    assert!(report.total >= 1, "total {}", report.total);
    assert!(report.total <= 12, "total {}", report.total);
    assert_eq!(requester.calls(), report.total);
}

#[tokio::test(start_paused = true)]
async fn plan_exhaustion_ends_admission_without_a_deadline() {
    let requester = StubRequester::new(Duration::ZERO);
    let config = Config {
        concurrency: 8,
        load_patterns: vec![LoadPattern::Steps {
            steps: vec![
                Step {
                    rate: Rate(80.0),
                    duration: ms(80),
                },
                Step {
                    rate: Rate(160.0),
                    duration: ms(40),
                },
            ],
        }],
        ..Config::default()
    };

    let report = Runner::new(config, requester.clone())
        .run(CancellationToken::new())
        .await;

    assert!(report.total > 0);
    assert!(
        report.duration >= ms(100) && report.duration <= ms(500),
        "duration {:?}",
        report.duration
    );
}

#[tokio::test(start_paused = true)]
async fn spike_pattern_admits_a_burst() {
    let requester = StubRequester::new(Duration::ZERO);
    let config = Config {
        concurrency: 32,
        load_patterns: vec![LoadPattern::Spike {
            rate: Rate(500.0),
            duration: ms(50),
        }],
        ..Config::default()
    };

    let report = Runner::new(config, requester.clone())
        .run(CancellationToken::new())
        .await;

    assert!(report.total >= 10, "total {}", report.total);
}

#[tokio::test(start_paused = true)]
async fn poisson_arrivals_draw_one_variate_per_admission() {
    let requester = StubRequester::new(Duration::ZERO);
    let draws = Arc::new(AtomicU64::new(0));
    let sampler = {
        let draws = Arc::clone(&draws);
        Box::new(move || {
            draws.fetch_add(1, Ordering::Relaxed);
            0.0
        })
    };

    let config = Config {
        concurrency: 2,
        total_requests: 5,
        rate: Rate(100.0),
        arrival_model: ArrivalModel::Poisson,
        ..Config::default()
    };

    let report = Runner::new(config, requester.clone())
        .sampler(sampler)
        .run(CancellationToken::new())
        .await;

    assert_eq!(report.total, 5);
    assert_eq!(requester.calls(), 5);
    assert!(draws.load(Ordering::Relaxed) >= 5);
}

#[tokio::test(start_paused = true)]
async fn fast_requests_drain_inside_the_graceful_window() {
    let requester = StubRequester::new(ms(10));
    let config = Config {
        concurrency: 2,
        total_requests: 4,
        graceful_shutdown: Shutdown::Graceful(Duration::from_secs(1)),
        ..Config::default()
    };

    let report = Runner::new(config, requester.clone())
        .run(CancellationToken::new())
        .await;

    assert_eq!(report.total, 4);
    assert_eq!(report.errors, 0);
    assert!(
        report.duration < Duration::from_secs(1),
        "duration {:?}",
        report.duration
    );
}

#[tokio::test(start_paused = true)]
async fn immediate_shutdown_is_visible_to_in_flight_requests() {
    let requester = StubRequester::new(Duration::from_secs(10));
    let config = Config {
        concurrency: 2,
        total_requests: 2,
        graceful_shutdown: Shutdown::Immediate,
        ..Config::default()
    };

    let report = Runner::new(config, requester.clone())
        .run(CancellationToken::new())
        .await;

    // Both requests were force-cancelled rather than allowed to finish.
    assert_eq!(report.total, 2);
    assert_eq!(report.errors, 2);
    assert!(
        report.duration < Duration::from_secs(1),
        "duration {:?}",
        report.duration
    );
}

#[tokio::test(start_paused = true)]
async fn slow_requests_are_force_cancelled_after_the_window() {
    let requester = StubRequester::new(Duration::from_secs(10));
    let config = Config {
        concurrency: 2,
        total_requests: 2,
        graceful_shutdown: Shutdown::Graceful(ms(50)),
        ..Config::default()
    };

    let report = Runner::new(config, requester.clone())
        .run(CancellationToken::new())
        .await;

    assert_eq!(report.total, 2);
    assert_eq!(report.errors, 2);
    assert!(
        report.duration >= ms(40) && report.duration <= ms(500),
        "duration {:?}",
        report.duration
    );
}

#[tokio::test(start_paused = true)]
async fn unbounded_run_ends_only_on_external_cancellation() {
    let requester = StubRequester::new(ms(1));
    let config = Config {
        concurrency: 2,
        ..Config::default()
    };

    let cancel = CancellationToken::new();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(Runner::new(config, requester.clone()).run(cancel))
    };

    tokio::time::sleep(ms(30)).await;
    assert!(!run.is_finished());

    cancel.cancel();
    let report = run.await.unwrap();

    assert!(report.total > 0);
    assert!(report.duration >= ms(30));
}

#[tokio::test(start_paused = true)]
async fn requester_failures_are_counted_not_fatal() {
    /// Fails every other request.
    struct HalfFailing {
        calls: AtomicU64,
    }

    #[async_trait]
    impl Requester for HalfFailing {
        async fn call(&self, _cancel: CancellationToken) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::Relaxed);
            if call % 2 == 0 {
                Err(anyhow!("synthetic failure"))
            } else {
                Ok(())
            }
        }
    }

    let config = Config {
        concurrency: 3,
        total_requests: 10,
        ..Config::default()
    };

    let report = Runner::new(
        config,
        Arc::new(HalfFailing {
            calls: AtomicU64::new(0),
        }),
    )
    .run(CancellationToken::new())
    .await;

    assert_eq!(report.total, 10);
    assert_eq!(report.errors, 5);
}

#[tokio::test(start_paused = true)]
async fn panicking_requester_costs_one_error_per_call() {
    struct Panicking;

    #[async_trait]
    impl Requester for Panicking {
        async fn call(&self, _cancel: CancellationToken) -> Result<()> {
            panic!("requester blew up");
        }
    }

    let config = Config {
        concurrency: 2,
        total_requests: 6,
        ..Config::default()
    };

    let report = Runner::new(config, Arc::new(Panicking))
        .run(CancellationToken::new())
        .await;

    // The pool survives every panic and keeps consuming permits.
    assert_eq!(report.total, 6);
    assert_eq!(report.errors, 6);
}

#[tokio::test(start_paused = true)]
async fn single_worker_single_request() {
    let requester = StubRequester::new(ms(1));
    let config = Config {
        concurrency: 1,
        total_requests: 1,
        ..Config::default()
    };

    let report = Runner::new(config, requester.clone())
        .run(CancellationToken::new())
        .await;

    assert_eq!(report.total, 1);
    assert_eq!(requester.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn report_duration_tracks_the_virtual_clock() {
    let requester = StubRequester::new(ms(5));
    let config = Config {
        concurrency: 1,
        total_requests: 3,
        ..Config::default()
    };

    let started = Instant::now();
    let report = Runner::new(config, requester)
        .run(CancellationToken::new())
        .await;

    assert_eq!(report.duration, started.elapsed());
}
