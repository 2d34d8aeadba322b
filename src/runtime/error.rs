//! Errors surfaced by the relay runtime

use crate::db::DbError;
use crate::state_machine::{TransitionError, UserId};
use crate::telegram::TransportError;
use thiserror::Error;

/// The user directory could not be reached or queried
#[derive(Debug, Clone, Error)]
#[error("User directory unavailable: {0}")]
pub struct DirectoryError(pub String);

impl From<DbError> for DirectoryError {
    fn from(e: DbError) -> Self {
        Self(e.to_string())
    }
}

/// Why a step failed; decides what the invoker is told
#[derive(Debug, Error)]
pub enum RelayError {
    /// Input was understood but cannot be acted on
    #[error("{0}")]
    Validation(String),

    #[error("Delivery to {user_id} failed: {source}")]
    Delivery {
        user_id: UserId,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    StateViolation(#[from] TransitionError),

    #[error(transparent)]
    Storage(#[from] DirectoryError),
}

impl RelayError {
    pub fn delivery(user_id: UserId, source: TransportError) -> Self {
        Self::Delivery { user_id, source }
    }

    /// Notice sent back to whoever triggered the failed step
    pub fn user_message(&self) -> String {
        match self {
            RelayError::Validation(message) => message.clone(),
            RelayError::Delivery { user_id, source } => {
                format!("Could not deliver to {user_id}: {source}. You can try again or cancel.")
            }
            RelayError::StateViolation(_) => crate::state_machine::transition::USE_CANCEL.to_string(),
            RelayError::Storage(_) => {
                "A temporary storage error occurred. Please try again later.".to_string()
            }
        }
    }
}
