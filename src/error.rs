//! Pipeline-level error taxonomy.
//!
//! Module errors convert into [`PipelineError`]; stage failures carry the
//! stage they happened in. Every variant leaves the report untouched, so the
//! retry decision is the caller's.

use std::time::Duration;

use crate::gateway::ProviderError;
use crate::json_repair::MalformedOutputError;
use crate::prompts::InputError;
use crate::stages::{SchemaError, StageId};
use crate::store::{ReportStatus, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("unusable input: {0}")]
    Input(#[from] InputError),

    #[error("{stage} timed out after {}s", .timeout.as_secs_f64())]
    Timeout { stage: StageId, timeout: Duration },

    #[error("{stage} provider call failed: {source}")]
    Api {
        stage: StageId,
        #[source]
        source: ProviderError,
    },

    #[error("{stage} was cancelled")]
    Cancelled { stage: StageId },

    #[error("{stage} returned malformed output: {source}")]
    MalformedOutput {
        stage: StageId,
        #[source]
        source: MalformedOutputError,
    },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("store error: {0}")]
    Store(#[source] StoreError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("report {id} changed concurrently: expected status {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: ReportStatus,
        actual: ReportStatus,
    },
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict {
                id,
                expected,
                actual,
            } => Self::Conflict {
                id,
                expected,
                actual,
            },
            other => Self::Store(other),
        }
    }
}

impl PipelineError {
    /// Attach the stage to a provider failure.
    pub fn provider(stage: StageId, err: ProviderError) -> Self {
        match err {
            ProviderError::Timeout(timeout) => Self::Timeout { stage, timeout },
            ProviderError::Cancelled => Self::Cancelled { stage },
            source => Self::Api { stage, source },
        }
    }

    pub fn malformed(stage: StageId, source: MalformedOutputError) -> Self {
        Self::MalformedOutput { stage, source }
    }

    /// Stage the failure happened in, when it is stage-specific.
    pub fn stage(&self) -> Option<StageId> {
        match self {
            Self::Timeout { stage, .. }
            | Self::Api { stage, .. }
            | Self::Cancelled { stage }
            | Self::MalformedOutput { stage, .. } => Some(*stage),
            Self::Schema(e) => Some(e.stage),
            Self::Input(InputError::MissingPriorOutput { stage, .. })
            | Self::Input(InputError::InvalidStoredOutput { stage, .. }) => Some(*stage),
            _ => None,
        }
    }

    /// Whether re-invoking the same stage can succeed without new input.
    ///
    /// Model output varies between calls, so malformed and schema failures
    /// count as retryable. Any provider rejection (auth included) is
    /// retryable once the operator has backed off or fixed the credentials.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Api {
                source: ProviderError::Api { .. },
                ..
            } => true,
            Self::Api { source, .. } => source.is_retryable(),
            Self::MalformedOutput { .. } | Self::Schema(_) => true,
            Self::Store(StoreError::Http(e)) => e.is_timeout() || e.is_connect(),
            Self::Store(StoreError::Api { status, .. }) => *status >= 500,
            Self::Input(_)
            | Self::Cancelled { .. }
            | Self::Store(_)
            | Self::NotFound(_)
            | Self::Conflict { .. } => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Input(_) => "input_error",
            Self::Timeout { .. } => "timeout",
            Self::Api { source, .. } => source.code(),
            Self::Cancelled { .. } => "cancelled",
            Self::MalformedOutput { .. } => "malformed_output",
            Self::Schema(_) => "schema_error",
            Self::Store(_) => "store_error",
            Self::NotFound(_) => "not_found",
            Self::Conflict { .. } => "conflict",
        }
    }
}
