#![forbid(unsafe_code)]

//! # intake-report
//!
//! Turns a business intake questionnaire into a structured client report
//! through four sequential LLM stages:
//!
//! 1. problem analysis: the three biggest automation opportunities
//! 2. tool research: candidate software for each opportunity
//! 3. tool curation: three prioritised tools and where to start
//! 4. report generation: the client-facing report
//!
//! Every model response goes through tolerant JSON parsing and per-stage
//! validation before it is persisted. The [`PipelineOrchestrator`] always
//! resumes at the first stage without a stored output, so a failed or
//! interrupted run is continued by simply running it again.

pub mod config;
pub mod error;
pub mod gateway;
pub mod json_repair;
pub mod orchestrator;
pub mod prompts;
pub mod runner;
pub mod stages;
pub mod store;
pub mod trace;

pub use config::{PipelineConfig, StoreBackend};
pub use error::PipelineError;
pub use gateway::{
    Attribution, CompletionCall, CompletionClient, LlmClient, NoopUsageSink, ProviderError,
    TracingUsageSink, UsageSink,
};
pub use json_repair::{MalformedOutputError, RepairPass};
pub use orchestrator::{PipelineOrchestrator, StepOutcome};
pub use prompts::{InputError, IntakeData, PromptInstance};
pub use runner::{RunnerConfig, StageInputs, StageRunner};
pub use stages::{PriorOutputs, SchemaError, StageId, StageOutput};
pub use store::{
    share_url, MemoryReportStore, Report, ReportStatus, ReportStore, ReportUpdate,
    RestReportStore, SqliteReportStore, StoreError,
};
pub use trace::{JsonlTraceSink, StageTrace, TraceError, TraceSink, TraceWorker};
