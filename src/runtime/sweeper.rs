/// Lease sweeper: returns abandoned claims to the queue
///
/// A worker that dies mid-step stops heartbeating its claim. Once the lease
/// expires the step goes back to `READY` with its attempt counter intact, and
/// the next claim bumps it, which fences off any late write from the old owner.

use crate::config::MIN_PERIOD;
use crate::repository::Repository;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub fn spawn_lease_sweeper(
    repository: Repository,
    sweep_interval: Duration,
    lease_timeout: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval.max(MIN_PERIOD));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match repository.requeue_stale_steps(lease_timeout).await {
                Ok(reclaimed) if !reclaimed.is_empty() => {
                    tracing::warn!(
                        "🧹 Requeued {} step(s) with expired leases: {:?}",
                        reclaimed.len(),
                        reclaimed
                    );
                }
                Ok(_) => {}
                Err(err) => tracing::error!("❌ Lease sweep failed: {}", err),
            }
        }

        tracing::debug!("🛑 Lease sweeper stopped");
    })
}
