//! Report persistence.
//!
//! The orchestrator talks to storage only through [`ReportStore`]. Three
//! backends share the same semantics: SQLite for local runs, a PostgREST
//! endpoint for the hosted database, and an in-memory map for tests.

pub mod memory;
pub mod rest;
pub mod sqlite;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stages::StageId;

pub use memory::MemoryReportStore;
pub use rest::RestReportStore;
pub use sqlite::SqliteReportStore;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    #[serde(rename = "stage1_complete")]
    Stage1Complete,
    #[serde(rename = "stage2_complete")]
    Stage2Complete,
    #[serde(rename = "stage3_complete")]
    Stage3Complete,
    Completed,
    Failed,
}

impl ReportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Stage1Complete => "stage1_complete",
            Self::Stage2Complete => "stage2_complete",
            Self::Stage3Complete => "stage3_complete",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Number of stages this status vouches for. `failed` vouches for none.
    pub fn progress(self) -> u8 {
        match self {
            Self::Pending | Self::Failed => 0,
            Self::Stage1Complete => 1,
            Self::Stage2Complete => 2,
            Self::Stage3Complete => 3,
            Self::Completed => 4,
        }
    }

    /// Status recorded once `stage` has a validated output.
    pub fn after(stage: StageId) -> Self {
        match stage {
            StageId::ProblemAnalysis => Self::Stage1Complete,
            StageId::ToolResearch => Self::Stage2Complete,
            StageId::ToolCuration => Self::Stage3Complete,
            StageId::ReportGeneration => Self::Completed,
        }
    }

    /// Forward-only transition: never moves behind the current status.
    pub fn advance(self, stage: StageId) -> Self {
        let candidate = Self::after(stage);
        if candidate.progress() > self.progress() {
            candidate
        } else {
            self
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "stage1_complete" => Ok(Self::Stage1Complete),
            "stage2_complete" => Ok(Self::Stage2Complete),
            "stage3_complete" => Ok(Self::Stage3Complete),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Corrupt(format!("unknown report status `{other}`"))),
        }
    }
}

/// One client's pipeline run and its persisted stage outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: String,
    pub status: ReportStatus,
    pub intake_data: Value,
    pub stage1_output: Option<Value>,
    pub stage2_output: Option<Value>,
    pub stage3_output: Option<Value>,
    pub stage4_output: Option<Value>,
    pub share_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Report {
    /// A fresh pending report with a new id and share token.
    pub fn new(intake_data: Value) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: ReportStatus::Pending,
            intake_data,
            stage1_output: None,
            stage2_output: None,
            stage3_output: None,
            stage4_output: None,
            share_token: Some(new_share_token()),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stage_output(&self, stage: StageId) -> Option<&Value> {
        match stage {
            StageId::ProblemAnalysis => self.stage1_output.as_ref(),
            StageId::ToolResearch => self.stage2_output.as_ref(),
            StageId::ToolCuration => self.stage3_output.as_ref(),
            StageId::ReportGeneration => self.stage4_output.as_ref(),
        }
    }

    fn stage_output_mut(&mut self, stage: StageId) -> &mut Option<Value> {
        match stage {
            StageId::ProblemAnalysis => &mut self.stage1_output,
            StageId::ToolResearch => &mut self.stage2_output,
            StageId::ToolCuration => &mut self.stage3_output,
            StageId::ReportGeneration => &mut self.stage4_output,
        }
    }

    /// Apply an update in place and restamp `updated_at`.
    pub(crate) fn apply(&mut self, update: &ReportUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some((stage, value)) = &update.stage_output {
            *self.stage_output_mut(*stage) = Some(value.clone());
        }
        if let Some(token) = &update.share_token {
            self.share_token = Some(token.clone());
        }
        self.updated_at = now;
    }
}

/// Opaque public token: 32 lowercase hex characters.
pub fn new_share_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Public read-only URL for a shared report.
pub fn share_url(base_url: &str, share_token: &str) -> String {
    format!("{}/report/view/{}", base_url.trim_end_matches('/'), share_token)
}

/// Fields to change in one update call. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportUpdate {
    pub status: Option<ReportStatus>,
    pub stage_output: Option<(StageId, Value)>,
    pub share_token: Option<String>,
    /// Apply only if the stored status still equals this value.
    pub expected_status: Option<ReportStatus>,
}

impl ReportUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: ReportStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn stage_output(mut self, stage: StageId, value: Value) -> Self {
        self.stage_output = Some((stage, value));
        self
    }

    pub fn share_token(mut self, token: impl Into<String>) -> Self {
        self.share_token = Some(token.into());
        self
    }

    pub fn expect_status(mut self, status: ReportStatus) -> Self {
        self.expected_status = Some(status);
        self
    }
}

// =============================================================================
// Error
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store API returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("task join error: {0}")]
    Join(String),
    #[error("store is closed")]
    Closed,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("report {id} changed concurrently: expected status {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: ReportStatus,
        actual: ReportStatus,
    },
    #[error("invalid store configuration: {0}")]
    Config(String),
}

impl StoreError {
    fn not_found(id: &str) -> Self {
        Self::NotFound(format!("report {id}"))
    }

    /// Check an update's status precondition against the stored status.
    pub(crate) fn check_expected(
        id: &str,
        update: &ReportUpdate,
        actual: ReportStatus,
    ) -> Result<(), Self> {
        match update.expected_status {
            Some(expected) if expected != actual => Err(Self::Conflict {
                id: id.to_string(),
                expected,
                actual,
            }),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Trait
// =============================================================================

/// Persistence for reports. Implementations never interpret stage outputs.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Insert a new report as given.
    async fn create(&self, report: Report) -> Result<Report, StoreError>;

    async fn get(&self, id: &str) -> Result<Report, StoreError>;

    /// Apply `update` in one write and restamp `updated_at`.
    ///
    /// Fails with [`StoreError::Conflict`] when `expected_status` is set and
    /// no longer matches, leaving the record untouched.
    async fn update(&self, id: &str, update: ReportUpdate) -> Result<Report, StoreError>;

    async fn find_by_share_token(&self, share_token: &str) -> Result<Report, StoreError>;
}
