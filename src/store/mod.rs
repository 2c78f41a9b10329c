//! Durable relay state.

pub mod state;

pub use state::{DEFAULT_STATE_FILE, ProcessedKey, StateStore};
