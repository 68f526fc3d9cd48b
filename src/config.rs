//! Environment-driven configuration.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::gateway::openai::{OpenAiAdapter, DEFAULT_BASE_URL};
use crate::gateway::{CompletionClient, LlmClient, ProviderError, TracingUsageSink};
use crate::runner::RunnerConfig;
use crate::stages::StageId;
use crate::store::{ReportStore, RestReportStore, SqliteReportStore, StoreError};

pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Base for public share links when `REPORT_BASE_URL` is unset.
pub const DEFAULT_REPORT_BASE_URL: &str = "http://localhost:3000";

/// Where reports live.
#[derive(Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite(PathBuf),
    /// PostgREST endpoint, e.g. `https://<project>.supabase.co`.
    Rest { url: String, api_key: String },
}

impl fmt::Debug for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(path) => f.debug_tuple("Sqlite").field(path).finish(),
            Self::Rest { url, .. } => f
                .debug_struct("Rest")
                .field("url", url)
                .field("api_key", &"<redacted>")
                .finish(),
        }
    }
}

#[derive(Clone)]
pub struct PipelineConfig {
    pub api_key: Option<String>,
    pub llm_base_url: String,
    pub model: String,
    pub store: StoreBackend,
    pub report_base_url: String,
    pub runner: RunnerConfig,
    /// Connection setup bound for LLM requests; per-stage deadlines are separate.
    pub connect_timeout: Duration,
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("llm_base_url", &self.llm_base_url)
            .field("model", &self.model)
            .field("store", &self.store)
            .field("report_base_url", &self.report_base_url)
            .field("runner", &self.runner)
            .finish()
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            llm_base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            store: StoreBackend::Sqlite(SqliteReportStore::default_path()),
            report_base_url: DEFAULT_REPORT_BASE_URL.to_string(),
            runner: RunnerConfig::default(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let store = match (get("REPORT_STORE_URL"), get("REPORT_STORE_KEY")) {
            (Some(url), Some(api_key)) => StoreBackend::Rest { url, api_key },
            _ => match get("REPORT_STORE_PATH") {
                Some(path) => StoreBackend::Sqlite(PathBuf::from(path)),
                None => defaults.store,
            },
        };

        let mut runner = defaults.runner;
        for stage in StageId::ALL {
            let var = format!("STAGE{}_TIMEOUT_SECONDS", stage.number());
            let Some(raw) = get(var.as_str()) else { continue };
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => {
                    runner = runner.with_timeout(stage, Duration::from_secs(secs));
                }
                _ => warn!(var = %var, value = %raw, "ignoring invalid stage timeout"),
            }
        }

        Self {
            api_key: get("LLM_API_KEY").or_else(|| get("OPENAI_API_KEY")),
            llm_base_url: get("LLM_BASE_URL").unwrap_or(defaults.llm_base_url),
            model: get("LLM_MODEL").unwrap_or(defaults.model),
            store,
            report_base_url: get("REPORT_BASE_URL").unwrap_or(defaults.report_base_url),
            runner,
            connect_timeout: defaults.connect_timeout,
        }
    }

    /// Production completion client. Requires an API key.
    pub fn completion_client(&self) -> Result<Arc<dyn LlmClient>, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::config("LLM_API_KEY not set"))?;
        let adapter =
            OpenAiAdapter::with_config(api_key, self.llm_base_url.as_str(), self.connect_timeout)?;
        let client: Arc<dyn LlmClient> = Arc::new(CompletionClient::openai(
            adapter,
            self.model.as_str(),
            Arc::new(TracingUsageSink),
        ));
        Ok(client)
    }

    pub fn open_store(&self) -> Result<Arc<dyn ReportStore>, StoreError> {
        let store: Arc<dyn ReportStore> = match &self.store {
            StoreBackend::Sqlite(path) => Arc::new(SqliteReportStore::new(path)?),
            StoreBackend::Rest { url, api_key } => {
                Arc::new(RestReportStore::new(url.as_str(), api_key)?)
            }
        };
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> PipelineConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config(&[]);
        assert_eq!(cfg.model, DEFAULT_MODEL);
        assert_eq!(cfg.llm_base_url, DEFAULT_BASE_URL);
        assert!(cfg.api_key.is_none());
        assert_eq!(
            cfg.runner.timeout(StageId::ToolCuration),
            Duration::from_secs(180)
        );
        assert!(cfg.completion_client().is_err());
        assert_eq!(
            cfg.store,
            StoreBackend::Sqlite(PathBuf::from(".intake_reports.sqlite"))
        );
    }

    #[test]
    fn env_values_override_defaults() {
        let cfg = config(&[
            ("OPENAI_API_KEY", "sk-fallback"),
            ("LLM_MODEL", "gpt-4o-mini"),
            ("REPORT_STORE_PATH", "/tmp/reports.sqlite"),
            ("STAGE1_TIMEOUT_SECONDS", "30"),
            ("STAGE2_TIMEOUT_SECONDS", "soon"),
        ]);
        assert_eq!(cfg.api_key.as_deref(), Some("sk-fallback"));
        assert_eq!(cfg.model, "gpt-4o-mini");
        assert_eq!(
            cfg.store,
            StoreBackend::Sqlite(PathBuf::from("/tmp/reports.sqlite"))
        );
        assert_eq!(
            cfg.runner.timeout(StageId::ProblemAnalysis),
            Duration::from_secs(30)
        );
        assert_eq!(
            cfg.runner.timeout(StageId::ToolResearch),
            StageId::ToolResearch.default_timeout()
        );
    }

    #[test]
    fn primary_key_wins_and_rest_store_needs_both_vars() {
        let cfg = config(&[
            ("LLM_API_KEY", "sk-primary"),
            ("OPENAI_API_KEY", "sk-fallback"),
            ("REPORT_STORE_URL", "https://db.example.com"),
        ]);
        assert_eq!(cfg.api_key.as_deref(), Some("sk-primary"));
        assert!(matches!(cfg.store, StoreBackend::Sqlite(_)));

        let cfg = config(&[
            ("REPORT_STORE_URL", "https://db.example.com"),
            ("REPORT_STORE_KEY", "service-key"),
        ]);
        assert!(matches!(cfg.store, StoreBackend::Rest { .. }));
        assert!(!format!("{cfg:?}").contains("service-key"));
    }
}
