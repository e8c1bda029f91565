use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::arrival::Arrival;
use crate::plan::Plan;

/// How often the compiled plan is resampled into the arrival controller.
const RETARGET_INTERVAL: Duration = Duration::from_millis(100);

/// Plan driver.
///
/// Periodically retargets the arrival controller with the plan's rate for
/// the current elapsed time, and cancels `scope` once the plan timeline is
/// exhausted. Exits immediately when `scope` is cancelled from outside.
pub(super) async fn drive(plan: Plan, arrival: Arc<Arrival>, scope: CancellationToken) {
    let started = Instant::now();

    if let Some(rate) = plan.rate_at(Duration::ZERO) {
        arrival.set_rate(rate);
    }

    let mut tick = tokio::time::interval(RETARGET_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick.tick().await; // the zeroth tick completes immediately

    loop {
        tokio::select! {
            _ = tick.tick() => match plan.rate_at(started.elapsed()) {
                Some(rate) => arrival.set_rate(rate),
                None => {
                    debug!("plan exhausted, stopping admission");
                    scope.cancel();
                    break;
                }
            },
            _ = scope.cancelled() => break,
        }
    }
}
