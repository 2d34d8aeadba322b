//! In-memory conversation state, keyed by user
//!
//! Reads and writes of different users never wait on each other: the map
//! itself sits behind a short-lived sync mutex, and a per-user async lock
//! serializes whole read/decide/execute/commit steps for one user.

use crate::state_machine::state::Payload;
use crate::state_machine::{can_transition, ConversationState, StateRecord, TransitionError, UserId};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;

struct Entry {
    record: StateRecord,
    touched_at: Instant,
}

/// Why the sweep dropped a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    /// The user is no longer in the active set
    Inactive,
    /// No step touched the record within the idle timeout
    IdleTimeout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expired {
    pub record: StateRecord,
    pub reason: ExpiryReason,
}

#[derive(Default)]
pub struct StateStore {
    records: Mutex<HashMap<UserId, Entry>>,
    locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<UserId, Entry>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn user_lock(&self, user_id: UserId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(user_id).or_default().clone()
    }

    /// Serialize steps for one user; hold the guard until the step commits
    pub async fn lock_user(&self, user_id: UserId) -> OwnedMutexGuard<()> {
        self.user_lock(user_id).lock_owned().await
    }

    /// Current state; users without a record are `Idle`
    pub fn get(&self, user_id: UserId) -> ConversationState {
        self.records()
            .get(&user_id)
            .map_or(ConversationState::Idle, |e| e.record.state)
    }

    /// Snapshot of the full record
    pub fn record(&self, user_id: UserId) -> StateRecord {
        self.records()
            .get(&user_id)
            .map_or_else(|| StateRecord::idle(user_id), |e| e.record.clone())
    }

    /// Set the state and merge `patch` into the payload
    ///
    /// Moving to `Idle` clears the record. No graph check; see `transition`.
    pub fn set_state(&self, user_id: UserId, state: ConversationState, patch: Option<Payload>) {
        let mut records = self.records();
        let old = records
            .get(&user_id)
            .map_or(ConversationState::Idle, |e| e.record.state);

        if state.is_idle() {
            records.remove(&user_id);
        } else {
            let entry = records.entry(user_id).or_insert_with(|| Entry {
                record: StateRecord::idle(user_id),
                touched_at: Instant::now(),
            });
            entry.record.state = state;
            entry.record.payload.extend(patch.unwrap_or_default());
            entry.touched_at = Instant::now();
        }
        drop(records);

        if old != state {
            tracing::info!(user_id, from = %old, to = %state, "State transition");
        }
    }

    /// Validated transition; a pair outside the graph leaves the record as is
    ///
    /// Staying in the current state is always allowed.
    pub fn transition(
        &self,
        user_id: UserId,
        target: ConversationState,
        patch: Option<Payload>,
    ) -> Result<(), TransitionError> {
        let current = self.get(user_id);
        if current != target && !can_transition(current, target) {
            tracing::warn!(user_id, from = %current, to = %target, "Rejected transition");
            return Err(TransitionError::StateViolation {
                from: current,
                to: target,
            });
        }
        self.set_state(user_id, target, patch);
        Ok(())
    }

    /// Back to `Idle`, dropping the payload; legal from every state
    pub fn clear(&self, user_id: UserId) {
        self.set_state(user_id, ConversationState::Idle, None);
    }

    /// One payload value, or the whole payload as an object when `key` is `None`
    #[allow(dead_code)] // Used in tests
    pub fn get_payload(&self, user_id: UserId, key: Option<&str>) -> Option<Value> {
        let records = self.records();
        let payload = &records.get(&user_id)?.record.payload;
        match key {
            Some(key) => payload.get(key).cloned(),
            None => Some(Value::Object(
                payload.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            )),
        }
    }

    /// Users with a stored record in `state`; never lists `Idle` users
    #[allow(dead_code)] // Used in tests
    pub fn list_users_in_state(&self, state: ConversationState) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .records()
            .values()
            .filter(|e| e.record.state == state)
            .map(|e| e.record.user_id)
            .collect();
        users.sort_unstable();
        users
    }

    /// Drop records for users outside `active` or idle past `idle_timeout`
    pub fn reconcile(&self, active: &HashSet<UserId>, idle_timeout: Duration) -> Vec<Expired> {
        self.reconcile_at(Instant::now(), active, idle_timeout)
    }

    /// Records whose user lock is held belong to an in-flight step and are
    /// left alone.
    pub fn reconcile_at(
        &self,
        now: Instant,
        active: &HashSet<UserId>,
        idle_timeout: Duration,
    ) -> Vec<Expired> {
        let mut records = self.records();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let mut expired = Vec::new();

        records.retain(|user_id, entry| {
            let reason = if !active.contains(user_id) {
                ExpiryReason::Inactive
            } else if now.saturating_duration_since(entry.touched_at) > idle_timeout {
                ExpiryReason::IdleTimeout
            } else {
                return true;
            };
            let busy = locks.get(user_id).is_some_and(|lock| lock.try_lock().is_err());
            if busy {
                return true;
            }
            expired.push(Expired {
                record: entry.record.clone(),
                reason,
            });
            false
        });

        // Locks nobody holds or waits on, for users with nothing stored
        locks.retain(|user_id, lock| records.contains_key(user_id) || Arc::strong_count(lock) > 1);

        for Expired { record, reason } in &expired {
            tracing::info!(user_id = record.user_id, from = %record.state, ?reason, "Expired conversation state");
        }
        expired
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.records().len()
    }
}
