//! Resumable pipeline driver.
//!
//! A report's next stage is the first one without a persisted output. Each
//! step loads the report, runs exactly that stage, and writes the output and
//! the advanced status in one guarded update. A failed step writes nothing,
//! so every call is a safe "continue from where it stopped".

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::prompts::{InputError, IntakeData};
use crate::runner::{StageInputs, StageRunner};
use crate::stages::{self, PriorOutputs, StageId, StageOutput};
use crate::store::{new_share_token, Report, ReportStore, ReportUpdate};

/// Result of one [`PipelineOrchestrator::run_next`] call.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// `stage` ran and its output was persisted.
    Advanced { stage: StageId, report: Report },
    /// Every stage already had an output; nothing ran.
    AlreadyComplete(Report),
}

impl StepOutcome {
    pub fn report(&self) -> &Report {
        match self {
            Self::Advanced { report, .. } | Self::AlreadyComplete(report) => report,
        }
    }

    pub fn into_report(self) -> Report {
        match self {
            Self::Advanced { report, .. } | Self::AlreadyComplete(report) => report,
        }
    }
}

pub struct PipelineOrchestrator {
    runner: StageRunner,
    store: Arc<dyn ReportStore>,
    cancel: CancellationToken,
}

impl PipelineOrchestrator {
    pub fn new(runner: StageRunner, store: Arc<dyn ReportStore>) -> Self {
        Self {
            runner,
            store,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling `token` aborts the in-flight stage call; nothing is persisted.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn store(&self) -> &Arc<dyn ReportStore> {
        &self.store
    }

    /// First stage whose output is not persisted, if any.
    pub fn next_stage(report: &Report) -> Option<StageId> {
        StageId::ALL
            .into_iter()
            .find(|stage| report.stage_output(*stage).is_none())
    }

    /// Persist a new pending report for `intake`.
    pub async fn create(&self, intake: &IntakeData) -> Result<Report, PipelineError> {
        create_report(self.store.as_ref(), intake).await
    }

    /// Run the next incomplete stage of report `id`.
    pub async fn run_next(&self, id: &str) -> Result<StepOutcome, PipelineError> {
        let report = self.store.get(id).await?;
        self.step(report).await
    }

    /// Run every remaining stage.
    pub async fn run(&self, id: &str) -> Result<Report, PipelineError> {
        self.run_through(id, StageId::ReportGeneration).await
    }

    /// Run remaining stages up to and including `last`.
    pub async fn run_through(&self, id: &str, last: StageId) -> Result<Report, PipelineError> {
        let mut report = self.store.get(id).await?;
        loop {
            match Self::next_stage(&report) {
                Some(stage) if stage <= last => {
                    report = self.step(report).await?.into_report();
                }
                _ => return Ok(report),
            }
        }
    }

    /// Persist an externally produced output for the report's next stage.
    pub async fn import_stage(
        &self,
        id: &str,
        stage: StageId,
        value: &Value,
    ) -> Result<Report, PipelineError> {
        import_stage(self.store.as_ref(), id, stage, value).await
    }

    async fn step(&self, report: Report) -> Result<StepOutcome, PipelineError> {
        let Some(stage) = Self::next_stage(&report) else {
            debug!(report_id = %report.id, "report already complete");
            return Ok(StepOutcome::AlreadyComplete(report));
        };

        let intake = IntakeData::from_value(report.intake_data.clone())?;
        let prior = load_prior(&report, stage)?;
        let inputs = StageInputs {
            report_id: Some(&report.id),
            intake: &intake,
            prior: &prior,
        };
        let output = self.runner.run(stage, inputs, &self.cancel).await?;
        let report = persist_output(self.store.as_ref(), &report, output).await?;
        Ok(StepOutcome::Advanced { stage, report })
    }
}

/// Persist a new pending report for `intake`.
pub async fn create_report(
    store: &dyn ReportStore,
    intake: &IntakeData,
) -> Result<Report, PipelineError> {
    let report = store.create(Report::new(intake.to_value())).await?;
    info!(report_id = %report.id, "report created");
    Ok(report)
}

/// Persist an externally produced output for the report's next stage, after
/// the same validation a model output gets. No model call is made.
pub async fn import_stage(
    store: &dyn ReportStore,
    id: &str,
    stage: StageId,
    value: &Value,
) -> Result<Report, PipelineError> {
    let report = store.get(id).await?;
    let next = PipelineOrchestrator::next_stage(&report);
    if next != Some(stage) {
        return Err(InputError::StageOutOfOrder { stage, next }.into());
    }
    let prior = load_prior(&report, stage)?;
    let output = stages::validate(stage, value, &prior)?;
    info!(report_id = %report.id, stage = stage.as_str(), "importing stage output");
    persist_output(store, &report, output).await
}

/// Write one validated output and advance status, guarded by the status the
/// caller read.
async fn persist_output(
    store: &dyn ReportStore,
    report: &Report,
    output: StageOutput,
) -> Result<Report, PipelineError> {
    let stage = output.stage();
    let status = report.status.advance(stage);
    let mut update = ReportUpdate::new()
        .status(status)
        .stage_output(stage, output.to_value())
        .expect_status(report.status);
    if stage == StageId::ReportGeneration && report.share_token.is_none() {
        update = update.share_token(new_share_token());
    }

    let updated = store.update(&report.id, update).await?;
    info!(
        report_id = %updated.id,
        stage = stage.as_str(),
        status = %updated.status,
        "stage persisted"
    );
    Ok(updated)
}

/// Decode the persisted outputs of every stage before `stage`.
fn load_prior(report: &Report, stage: StageId) -> Result<PriorOutputs, PipelineError> {
    let mut prior = PriorOutputs::default();
    for earlier in StageId::ALL.into_iter().filter(|s| *s < stage) {
        let value = report
            .stage_output(earlier)
            .ok_or(InputError::MissingPriorOutput {
                stage,
                requires: earlier,
            })?;
        // A stored output that no longer validates will not be rerun, so the
        // failure is reported as bad input rather than a retryable schema error.
        let output = stages::validate(earlier, value, &prior).map_err(|e| {
            InputError::InvalidStoredOutput {
                stage,
                requires: earlier,
                reason: e.to_string(),
            }
        })?;
        prior.insert(output);
    }
    Ok(prior)
}
