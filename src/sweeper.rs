use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::SweeperConfig;
use crate::engine::Engine;
use crate::model::Ms;
use crate::observability::SWEEPER_ACTIONS_TOTAL;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub completed: usize,
}

fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Background task that cancels lapsed holds and, if enabled, completes
/// bookings whose interval is over. Stops when `shutdown` is cancelled.
pub async fn run_sweeper(engine: Arc<Engine>, config: SweeperConfig, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(config.interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let report = sweep_once(&engine, now_ms(), config.auto_complete).await;
        if report != SweepReport::default() {
            info!(expired = report.expired, completed = report.completed, "sweep");
        }
    }
}

/// One pass as of `now`.
pub async fn sweep_once(engine: &Arc<Engine>, now: Ms, auto_complete: bool) -> SweepReport {
    let mut report = SweepReport::default();

    for (booking_id, _resource_id) in engine.collect_expired_holds(now) {
        match engine.expire_hold(booking_id, now).await {
            Ok(true) => {
                report.expired += 1;
                metrics::counter!(SWEEPER_ACTIONS_TOTAL, "action" => "expire_hold").increment(1);
            }
            Ok(false) => {}
            // Confirmed or cancelled since it was collected
            Err(e) => tracing::debug!("sweeper skip hold {booking_id}: {e}"),
        }
    }

    if auto_complete {
        for (booking_id, _resource_id) in engine.collect_finished(now) {
            match engine.complete_booking(booking_id).await {
                Ok(_) => {
                    report.completed += 1;
                    metrics::counter!(SWEEPER_ACTIONS_TOTAL, "action" => "complete").increment(1);
                }
                Err(e) => tracing::debug!("sweeper skip completion {booking_id}: {e}"),
            }
        }
    }

    report
}
