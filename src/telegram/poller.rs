//! Long-poll loop feeding updates to the coordinator
//!
//! Each update is handled on its own task so one slow delivery never holds
//! up other users. Updates from the same sender take turns in arrival order,
//! across batches too. On shutdown the loop stops fetching and waits for
//! in-flight handlers.

use super::client::TelegramClient;
use super::types::Update;
use super::{TransportError, TransportErrorKind};
use crate::runtime::{MembershipGate, RelayCoordinator, Transport, UserDirectory};
use crate::state_machine::UserId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Where updates come from
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn fetch(&self, offset: Option<i64>, timeout: Duration) -> Result<Vec<Update>, TransportError>;

    async fn acknowledge_button(&self, callback_id: &str) -> Result<(), TransportError>;
}

#[async_trait]
impl UpdateSource for TelegramClient {
    async fn fetch(&self, offset: Option<i64>, timeout: Duration) -> Result<Vec<Update>, TransportError> {
        self.get_updates(offset, timeout).await
    }

    async fn acknowledge_button(&self, callback_id: &str) -> Result<(), TransportError> {
        self.answer_callback_query(callback_id).await
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Poll until `cancel` fires or the token is rejected
pub async fn run_poller<S, D, G, T>(
    source: Arc<S>,
    coordinator: Arc<RelayCoordinator<D, G, T>>,
    poll_timeout: Duration,
    cancel: CancellationToken,
) -> Result<(), TransportError>
where
    S: UpdateSource + 'static,
    D: UserDirectory + 'static,
    G: MembershipGate + 'static,
    T: Transport + 'static,
{
    let mut offset: Option<i64> = None;
    let mut backoff = INITIAL_BACKOFF;
    let mut handlers = JoinSet::new();
    // Completion signal of each sender's latest update
    let mut turns: HashMap<UserId, oneshot::Receiver<()>> = HashMap::new();

    tracing::info!(poll_timeout_secs = poll_timeout.as_secs(), "Polling for updates");

    let outcome = loop {
        let fetched = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            fetched = source.fetch(offset, poll_timeout) => fetched,
        };

        match fetched {
            Ok(updates) => {
                backoff = INITIAL_BACKOFF;
                for update in updates {
                    offset = Some(update.update_id + 1);
                    let (done, turn) = oneshot::channel();
                    let after = update.sender_id().and_then(|id| turns.insert(id, turn));
                    handlers.spawn(dispatch(
                        source.clone(),
                        coordinator.clone(),
                        update,
                        after,
                        done,
                    ));
                }
            }
            Err(e) if e.kind == TransportErrorKind::Unauthorized => {
                tracing::error!(error = %e, "Bot token rejected; stopping");
                break Err(e);
            }
            Err(e) => {
                let delay = e.retry_after.unwrap_or(backoff);
                if e.kind.is_retryable() {
                    tracing::warn!(error = %e, delay_secs = delay.as_secs(), "Polling failed; retrying");
                } else {
                    tracing::error!(error = %e, kind = ?e.kind, delay_secs = delay.as_secs(), "Polling failed; retrying");
                }
                backoff = next_backoff(backoff);
                tokio::select! {
                    () = cancel.cancelled() => break Ok(()),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }

        while let Some(finished) = handlers.try_join_next() {
            log_handler_exit(finished);
        }
        turns.retain(|_, turn| matches!(turn.try_recv(), Err(TryRecvError::Empty)));
    };

    if !handlers.is_empty() {
        tracing::info!(in_flight = handlers.len(), "Waiting for in-flight updates");
    }
    while let Some(finished) = handlers.join_next().await {
        log_handler_exit(finished);
    }
    tracing::info!("Polling stopped");
    outcome
}

/// Handle one update once the sender's previous update is done
///
/// `_done` is dropped on return, which releases the sender's next update.
async fn dispatch<S, D, G, T>(
    source: Arc<S>,
    coordinator: Arc<RelayCoordinator<D, G, T>>,
    update: Update,
    after: Option<oneshot::Receiver<()>>,
    _done: oneshot::Sender<()>,
) where
    S: UpdateSource,
    D: UserDirectory,
    G: MembershipGate,
    T: Transport,
{
    if let Some(previous) = after {
        // Closed either way once the previous handler returns or panics
        let _ = previous.await;
    }

    let update_id = update.update_id;
    if let Some(query) = &update.callback_query {
        if let Err(e) = source.acknowledge_button(&query.id).await {
            tracing::debug!(update_id, error = %e, "Could not answer callback query");
        }
    }

    let Some(event) = update.into_event() else {
        tracing::debug!(update_id, "Ignoring unsupported update");
        return;
    };
    // Failures were already reported to the sender
    if let Err(e) = coordinator.handle_event(event).await {
        tracing::debug!(update_id, error = %e, "Update handling failed");
    }
}

fn log_handler_exit(finished: Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        tracing::error!(error = %e, "Update handler panicked");
    }
}
