//! Ingestion indicator kept on the owning resource, outside the job row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ingestq_core::{DomainError, ResourceId};

use super::types::IngestResult;

/// Ingestion state as seen by upstream consumers of the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl IngestionStatus {
    pub const ALL: [IngestionStatus; 4] = [
        IngestionStatus::Pending,
        IngestionStatus::Processing,
        IngestionStatus::Completed,
        IngestionStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Pending => "pending",
            IngestionStatus::Processing => "processing",
            IngestionStatus::Completed => "completed",
            IngestionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IngestionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IngestionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::unknown_variant("ingestion status", s))
    }
}

/// Per-resource ingestion record.
///
/// `error` is only set while `status == Failed`; `result` and `completed_at`
/// survive a re-enqueue until the next successful completion replaces them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceIngestion {
    pub resource_id: ResourceId,
    pub status: IngestionStatus,
    pub result: Option<IngestResult>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceIngestion {
    pub fn pending(resource_id: ResourceId, now: DateTime<Utc>) -> Self {
        Self {
            resource_id,
            status: IngestionStatus::Pending,
            result: None,
            error: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn mark_pending(&mut self, now: DateTime<Utc>) {
        self.status = IngestionStatus::Pending;
        self.error = None;
        self.updated_at = now;
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = IngestionStatus::Processing;
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, result: IngestResult, now: DateTime<Utc>) {
        self.status = IngestionStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: Option<String>, now: DateTime<Utc>) {
        self.status = IngestionStatus::Failed;
        self.error = error;
        self.updated_at = now;
    }
}
