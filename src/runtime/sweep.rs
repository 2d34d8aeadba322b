//! Periodic reconciliation of conversation state
//!
//! Records for users who left the active set, or who went quiet longer than
//! the idle timeout, are dropped so the store stays bounded.

use super::executor::RelayCoordinator;
use super::traits::{MembershipGate, Transport, UserDirectory};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct SweepSettings {
    pub interval: Duration,
    pub idle_timeout: Duration,
}

/// Run the sweep until `cancel` fires
///
/// A failed pass is logged and retried on the next tick.
pub async fn run_sweep<D, G, T>(
    coordinator: Arc<RelayCoordinator<D, G, T>>,
    settings: SweepSettings,
    cancel: CancellationToken,
) where
    D: UserDirectory,
    G: MembershipGate,
    T: Transport,
{
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; nothing is stale at startup
    ticker.tick().await;

    tracing::info!(
        interval_secs = settings.interval.as_secs(),
        idle_timeout_secs = settings.idle_timeout.as_secs(),
        "Reconciliation sweep started"
    );

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match coordinator.reconcile(settings.idle_timeout).await {
                    Ok(expired) if expired.is_empty() => {}
                    Ok(expired) => tracing::info!(expired = expired.len(), "Reconciliation pass"),
                    Err(e) => tracing::warn!(error = %e, "Reconciliation pass failed"),
                }
            }
        }
    }

    tracing::info!("Reconciliation sweep stopped");
}
