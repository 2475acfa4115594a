//! Periodic cycle scheduler for daemon mode.
//!
//! Fires a cache cycle on a fixed interval until ctrl-c. The manager
//! serializes cycles internally; a tick that lands while a cycle is still
//! running simply queues behind it.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tiercache_core::config::SchedulerConfig;
use tiercache_core::CacheManager;

pub async fn run(manager: Arc<CacheManager>, config: &SchedulerConfig) {
    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    let mut timer = interval(Duration::from_secs(
        u64::from(config.cycle_interval_minutes.max(1)) * 60,
    ));

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("Scheduler stopped");
                return;
            }
            _ = timer.tick() => {
                match manager.run_cycle().await {
                    Ok(summary) => {
                        if let Some(reason) = &summary.skipped {
                            info!(reason = %reason, "Cycle skipped");
                        } else {
                            info!(
                                transferred = summary.transferred,
                                restored = summary.restored,
                                duration_seconds = summary.duration_seconds,
                                "Cycle finished"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Cycle failed"),
                }
            }
        }
    }
}
