//! Append-only grade sync log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Outcome of one score submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Accepted by the platform
    Success,
    /// Not delivered
    Failed,
}

impl SyncStatus {
    /// `true` for [`SyncStatus::Success`].
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// One score submission attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeSyncLogEntry {
    /// Unique attempt id
    pub sync_id: Uuid,
    /// Target platform
    pub platform_id: String,
    /// Internal assignment, when the attempt came from a sync
    pub assignment_id: Option<String>,
    /// Internal student (platform user for direct submissions)
    pub student_id: String,
    /// Points awarded
    pub score: f64,
    /// Points possible
    pub max_score: f64,
    /// Line item the score targeted; empty if it was never resolved
    pub line_item_url: String,
    /// Outcome
    pub status: SyncStatus,
    /// Failure reason
    pub error_message: Option<String>,
    /// Attempt time
    pub synced_at: DateTime<Utc>,
}

impl GradeSyncLogEntry {
    /// Build an entry from the outcome of an attempt.
    #[must_use]
    pub fn new(
        platform_id: &str,
        assignment_id: Option<&str>,
        student_id: &str,
        (score, max_score): (f64, f64),
        line_item_url: &str,
        outcome: Result<(), String>,
    ) -> Self {
        let (status, error_message) = match outcome {
            Ok(()) => (SyncStatus::Success, None),
            Err(e) => (SyncStatus::Failed, Some(e)),
        };
        Self {
            sync_id: Uuid::new_v4(),
            platform_id: platform_id.to_string(),
            assignment_id: assignment_id.map(str::to_string),
            student_id: student_id.to_string(),
            score,
            max_score,
            line_item_url: line_item_url.to_string(),
            status,
            error_message,
            synced_at: Utc::now(),
        }
    }
}

/// Storage for sync attempts.
#[async_trait::async_trait]
pub trait GradeSyncLog: Send + Sync + 'static {
    /// Append one entry.
    async fn append(&self, entry: GradeSyncLogEntry);

    /// All entries in append order.
    async fn entries(&self) -> Vec<GradeSyncLogEntry>;
}

/// In-memory sync log.
#[derive(Default)]
pub struct InMemoryGradeSyncLog {
    entries: RwLock<Vec<GradeSyncLogEntry>>,
}

impl InMemoryGradeSyncLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl GradeSyncLog for InMemoryGradeSyncLog {
    async fn append(&self, entry: GradeSyncLogEntry) {
        self.entries.write().await.push(entry);
    }

    async fn entries(&self) -> Vec<GradeSyncLogEntry> {
        self.entries.read().await.clone()
    }
}
