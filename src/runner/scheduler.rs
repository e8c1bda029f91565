use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::arrival::Arrival;
use crate::request::Requester;

/// One unit of admitted work, consumed by exactly one worker.
pub(super) struct Permit;

/// Admission loop.
///
/// Paces permits onto the bounded channel until a termination rule fires,
/// then closes the channel by dropping the sender. Invariant: `total`
/// equals the number of permits actually released. The count is taken
/// before the hand-off and compensated if cancellation beats the publish.
pub(super) async fn produce(
    permits: Sender<Permit>,
    arrival: Arc<Arrival>,
    gate: CancellationToken,
    total_requests: u64,
    total: Arc<AtomicU64>,
) {
    loop {
        if gate.is_cancelled() {
            break;
        }
        if total_requests > 0 && total.load(Ordering::Relaxed) >= total_requests {
            debug!(total_requests, "admission cap reached");
            break;
        }
        if arrival.wait(&gate).await.is_err() {
            break;
        }

        total.fetch_add(1, Ordering::Relaxed);
        tokio::select! {
            sent = permits.send(Permit) => {
                if sent.is_err() {
                    total.fetch_sub(1, Ordering::Relaxed);
                    break;
                }
            }
            _ = gate.cancelled() => {
                total.fetch_sub(1, Ordering::Relaxed);
                break;
            }
        }
    }

    debug!("admission stopped");
    // Dropping `permits` here closes the channel on every exit path.
}

/// Worker loop.
///
/// Executes one requester call per received permit and exits once the
/// permit channel is closed and drained. Workers never observe admission
/// cancellation; in-flight work is only interrupted through `run`, and only
/// to the extent the requester honours it.
pub(super) async fn work(
    permits: Arc<Mutex<Receiver<Permit>>>,
    requester: Arc<dyn Requester>,
    run: CancellationToken,
    errors: Arc<AtomicU64>,
) {
    loop {
        let permit = permits.lock().await.recv().await;
        if permit.is_none() {
            break;
        }

        let outcome = AssertUnwindSafe(requester.call(run.clone()))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                errors.fetch_add(1, Ordering::Relaxed);
            }
            Err(panic) => {
                // A panicking requester costs one error, never the worker.
                errors.fetch_add(1, Ordering::Relaxed);
                warn!("requester panicked: {}", describe_panic(panic.as_ref()));
            }
        }
    }
}

fn describe_panic(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("opaque panic payload")
}
