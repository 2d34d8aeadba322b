//! Runtime for relaying events
//!
//! Owns the in-memory conversation state, the coordinator that acts on
//! inbound events, and the background sweep that keeps state bounded.

mod error;
mod executor;
mod store;
mod sweep;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use error::{DirectoryError, RelayError};
pub use executor::{BroadcastTally, RelayCoordinator, RelaySettings};
pub use store::{Expired, ExpiryReason, StateStore};
pub use sweep::{run_sweep, SweepSettings};
pub use traits::*;

use crate::telegram::TelegramClient;
use std::sync::Arc;

/// Type alias for the production coordinator with concrete implementations
pub type ProductionCoordinator =
    RelayCoordinator<DatabaseDirectory, Arc<dyn MembershipGate>, Arc<TelegramClient>>;
