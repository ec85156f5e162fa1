//! Epoch-based memory reclamation for rowcache
//!
//! Readers of a table's current generation enter a protected region before loading
//! the pointer and leave it when they are done. A generation displaced by a refresh
//! is dropped only after every reader that could have loaded it has left.

mod light_epoch;
mod thread_slot;

pub use light_epoch::{EpochGuard, LightEpoch, UNPROTECTED};
pub use thread_slot::thread_slot;
