//! State module for tracking harvest progress
//!
//! # Components
//!
//! - `ItemStatus`: lifecycle of one item (pending, in progress, done, failed)
//! - `CheckpointRecord`: the durable ledger row for one item
//! - `ItemDescriptor` / `Universe`: the ordered work list a run walks

mod descriptor;
mod item_state;

// Re-export main types
pub use descriptor::{ItemDescriptor, Universe};
pub use item_state::{CheckpointRecord, ItemStatus};
