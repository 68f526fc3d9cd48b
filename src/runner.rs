//! Run one pipeline stage: prompt, completion, repair, validation.
//!
//! A runner attempt either yields a validated [`StageOutput`] or an error;
//! it never persists anything and never retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::gateway::{Attribution, CompletionCall, LlmClient};
use crate::json_repair;
use crate::prompts::{self, IntakeData, PromptInstance};
use crate::stages::{self, PriorOutputs, StageId, StageOutput};
use crate::trace::{now_epoch_ms, prompt_hash, StageTrace, TraceSink};

// =============================================================================
// Config
// =============================================================================

/// Per-stage call limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    timeouts: [Duration; 4],
    max_completion_tokens: [u32; 4],
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeouts: StageId::ALL.map(StageId::default_timeout),
            max_completion_tokens: StageId::ALL.map(StageId::max_completion_tokens),
        }
    }
}

impl RunnerConfig {
    fn slot(stage: StageId) -> usize {
        usize::from(stage.number() - 1)
    }

    pub fn timeout(&self, stage: StageId) -> Duration {
        self.timeouts[Self::slot(stage)]
    }

    pub fn max_completion_tokens(&self, stage: StageId) -> u32 {
        self.max_completion_tokens[Self::slot(stage)]
    }

    pub fn with_timeout(mut self, stage: StageId, timeout: Duration) -> Self {
        self.timeouts[Self::slot(stage)] = timeout;
        self
    }

    pub fn with_max_completion_tokens(mut self, stage: StageId, tokens: u32) -> Self {
        self.max_completion_tokens[Self::slot(stage)] = tokens;
        self
    }
}

// =============================================================================
// Runner
// =============================================================================

/// Everything a stage reads.
#[derive(Debug, Clone, Copy)]
pub struct StageInputs<'a> {
    pub report_id: Option<&'a str>,
    pub intake: &'a IntakeData,
    pub prior: &'a PriorOutputs,
}

#[derive(Clone)]
pub struct StageRunner {
    client: Arc<dyn LlmClient>,
    config: RunnerConfig,
    trace_sink: Option<Arc<dyn TraceSink>>,
}

impl StageRunner {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            config: RunnerConfig::default(),
            trace_sink: None,
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace_sink = Some(sink);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub async fn run(
        &self,
        stage: StageId,
        inputs: StageInputs<'_>,
        cancel: &CancellationToken,
    ) -> Result<StageOutput, PipelineError> {
        let prompt = prompts::build(stage, inputs.prior, inputs.intake)?;

        let mut attribution = Attribution::new(stage.caller());
        if let Some(id) = inputs.report_id {
            attribution = attribution.with_report(id);
        }
        let call = CompletionCall {
            system_prompt: &prompt.system,
            user_prompt: &prompt.user,
            timeout: self.config.timeout(stage),
            max_completion_tokens: Some(self.config.max_completion_tokens(stage)),
            attribution,
        };

        debug!(
            stage = stage.as_str(),
            template = %prompt.template_slug,
            timeout_s = call.timeout.as_secs(),
            "running stage"
        );
        let start = Instant::now();
        let mut attempt = Attempt {
            stage,
            report_id: inputs.report_id,
            prompt: &prompt,
            start,
            raw_output: None,
            repair_passes: Vec::new(),
        };

        let raw = match self.client.send(call, cancel).await {
            Ok(raw) => raw,
            Err(e) => return Err(self.fail(&attempt, PipelineError::provider(stage, e))),
        };
        let parsed = json_repair::parse_with_report(&raw);
        attempt.raw_output = Some(raw);

        let repaired = match parsed {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.fail(&attempt, PipelineError::malformed(stage, e))),
        };
        attempt.repair_passes = repaired.passes_applied.iter().map(|p| p.name()).collect();
        if repaired.was_repaired() {
            debug!(
                stage = stage.as_str(),
                passes = ?attempt.repair_passes,
                "model output needed repair"
            );
        }

        let output = match stages::validate(stage, &repaired.value, inputs.prior) {
            Ok(output) => output,
            Err(e) => return Err(self.fail(&attempt, e.into())),
        };

        let latency_ms = start.elapsed().as_millis() as u64;
        info!(
            stage = stage.as_str(),
            report_id = inputs.report_id.unwrap_or("-"),
            latency_ms,
            "stage output validated"
        );
        self.record(&attempt, "ok", None);
        Ok(output)
    }

    fn fail(&self, attempt: &Attempt<'_>, err: PipelineError) -> PipelineError {
        warn!(
            stage = attempt.stage.as_str(),
            report_id = attempt.report_id.unwrap_or("-"),
            code = err.code(),
            error = %err,
            "stage failed"
        );
        self.record(attempt, err.code(), Some(err.to_string()));
        err
    }

    fn record(&self, attempt: &Attempt<'_>, outcome: &str, error: Option<String>) {
        let Some(sink) = &self.trace_sink else {
            return;
        };
        let event = StageTrace {
            timestamp_ms: now_epoch_ms(),
            report_id: attempt.report_id.map(str::to_string),
            stage: attempt.stage.number(),
            stage_name: attempt.stage.as_str(),
            prompt_template_slug: attempt.prompt.template_slug.clone(),
            prompt_hash: prompt_hash(&attempt.prompt.system, &attempt.prompt.user),
            latency_ms: attempt.start.elapsed().as_millis() as u64,
            raw_output: attempt.raw_output.clone(),
            repair_passes: attempt.repair_passes.clone(),
            outcome: outcome.to_string(),
            error,
        };
        if let Err(e) = sink.record(event) {
            warn!(error = %e, "failed to record stage trace");
        }
    }
}

/// Bookkeeping for one attempt, used for tracing.
struct Attempt<'a> {
    stage: StageId,
    report_id: Option<&'a str>,
    prompt: &'a PromptInstance,
    start: Instant,
    raw_output: Option<String>,
    repair_passes: Vec<&'static str>,
}
