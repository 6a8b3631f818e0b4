//! Liveness monitor.
//!
//! Every tick asks the controller to sweep all channels. A channel pings
//! each Active connection and stages those whose last heartbeat is older
//! than the threshold. Channels left with nothing in them are reaped.
//!
//! # Graceful Shutdown
//!
//! The task exits when the cancellation token is triggered.

use crate::actors::ChannelControllerHandle;

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Run the sweep loop until cancelled.
///
/// `threshold` is the absolute silence a connection may accumulate before
/// it is staged (`VC_HEARTBEAT_MISS_THRESHOLD_SECONDS`), independent of
/// `interval`.
#[instrument(skip_all, name = "vc.task.liveness")]
pub async fn run_liveness_monitor(
    controller: ChannelControllerHandle,
    interval: Duration,
    threshold: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "vc.task.liveness",
        interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        threshold_ms = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX),
        "Liveness monitor started"
    );

    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; nothing can be stale yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!(target: "vc.task.liveness", "Liveness monitor received shutdown signal, exiting");
                break;
            }
            _ = ticker.tick() => {
                match controller.sweep(threshold).await {
                    Ok(summary) => {
                        if summary.staged > 0 || summary.channels_reaped > 0 {
                            info!(
                                target: "vc.task.liveness",
                                channels = summary.channels_swept,
                                staged = summary.staged,
                                reaped = summary.channels_reaped,
                                "Liveness sweep"
                            );
                        } else {
                            debug!(
                                target: "vc.task.liveness",
                                channels = summary.channels_swept,
                                "Liveness sweep found nothing stale"
                            );
                        }
                    }
                    Err(e) => {
                        warn!(target: "vc.task.liveness", error = %e, "Liveness sweep failed");
                        if controller.is_cancelled() {
                            break;
                        }
                    }
                }
            }
        }
    }
}
