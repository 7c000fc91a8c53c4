//! Persisted lease and failure state.
//!
//! The state file lives in an owner-only (0700) directory, is itself 0600,
//! and is always replaced through a temp-file-then-rename so a crash never
//! leaves a partial write behind.

mod error;
mod store;

pub use error::{StateError, StateResult};
pub use store::{PersistedState, STATE_VERSION, StateStore};
