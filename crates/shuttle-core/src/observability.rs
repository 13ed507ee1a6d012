use serde::{Deserialize, Serialize};

use crate::domain::ItemStatus;

/// Work item counts per status.
///
/// `parked` is the subset of `running` rows that are workflow roots waiting
/// on their subtasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub running: u64,
    pub parked: u64,
    pub done: u64,
    pub error: u64,
}

impl QueueCounts {
    pub fn add(&mut self, status: ItemStatus, n: u64) {
        match status {
            ItemStatus::Pending => self.pending += n,
            ItemStatus::Running => self.running += n,
            ItemStatus::Done => self.done += n,
            ItemStatus::Error => self.error += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.running + self.done + self.error
    }

    /// Items not yet terminal.
    pub fn in_flight(&self) -> u64 {
        self.pending + self.running
    }
}
