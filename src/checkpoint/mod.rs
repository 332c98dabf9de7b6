//! Checkpoint ledger for resumable runs
//!
//! The ledger records, per job and item, whether the item is pending, in
//! progress, done or failed. Every update is its own durably synced
//! statement, so a crash loses at most the items that were in flight, and
//! those come back as pending on the next load.

mod ledger;
mod schema;

pub use ledger::CheckpointLedger;

use crate::state::ItemStatus;

/// Item counts per status for one job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    pub pending: u64,
    pub in_progress: u64,
    pub done: u64,
    pub failed: u64,
}

impl LedgerSummary {
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.done + self.failed
    }

    pub fn count(&self, status: ItemStatus) -> u64 {
        match status {
            ItemStatus::Pending => self.pending,
            ItemStatus::InProgress => self.in_progress,
            ItemStatus::Done => self.done,
            ItemStatus::Failed => self.failed,
        }
    }

    pub(crate) fn add(&mut self, status: ItemStatus, n: u64) {
        match status {
            ItemStatus::Pending => self.pending += n,
            ItemStatus::InProgress => self.in_progress += n,
            ItemStatus::Done => self.done += n,
            ItemStatus::Failed => self.failed += n,
        }
    }
}
