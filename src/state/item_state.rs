/// Item status definitions for tracking harvest progress
///
/// Every item in the universe moves through `pending -> in_progress -> {done | failed}`.
/// `done` is terminal within a run; `failed` items are picked up again on resume.
use chrono::{DateTime, Utc};
use std::fmt;

/// Represents the checkpoint status of one item for one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemStatus {
    /// Not yet attempted, or reclassified after an interrupted attempt
    Pending,

    /// Claimed by a worker; a crash leaves the item here
    InProgress,

    /// Fetched and persisted
    Done,

    /// Last attempt failed with an item-level error
    Failed,
}

impl ItemStatus {
    /// Returns true if this item is not done and must be (re)attempted
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Done)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Returns true if the state machine allows moving from `self` to `next`
    ///
    /// Resets to `Pending` are always allowed; they are how force refresh and
    /// crash recovery re-open an item.
    pub fn can_transition_to(&self, next: ItemStatus) -> bool {
        match (self, next) {
            (_, Self::Pending) => true,
            (Self::Pending | Self::Failed, Self::InProgress) => true,
            (Self::InProgress, Self::Done | Self::Failed) => true,
            _ => false,
        }
    }

    /// Converts the status to its database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Parses a status from its database string representation
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns all statuses in lifecycle order
    pub fn all_states() -> Vec<Self> {
        vec![Self::Pending, Self::InProgress, Self::Done, Self::Failed]
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Durable progress record for one item of one job
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub item_id: String,
    pub status: ItemStatus,
    /// Number of times the item has been claimed by a worker
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}
