use lib_common::MatchService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;

/// Periodically releases reservations whose engine never resolved them.
pub async fn run(
    service: Arc<MatchService>,
    every: Duration,
    ttl: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut check_interval = interval(every);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Reservation sweeper received shutdown signal.");
                break;
            }
            _ = check_interval.tick() => {
                if let Err(e) = service.sweep_stale(ttl).await {
                    tracing::warn!(error = %e, "reservation sweep failed");
                }
            }
        }
    }
}
