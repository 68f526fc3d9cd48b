use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use intake_report::{
    CompletionCall, InputError, IntakeData, LlmClient, MemoryReportStore, PipelineError,
    PipelineOrchestrator, ProviderError, Report, ReportStatus, ReportStore, ReportUpdate,
    StageId, StageRunner, StepOutcome, StoreError,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

const INTAKE: &str = include_str!("fixtures/intake.json");
const STAGE1: &str = include_str!("fixtures/stage1_problem_analysis.json");
const STAGE2: &str = include_str!("fixtures/stage2_tool_research.json");
const STAGE3: &str = include_str!("fixtures/stage3_tool_curation.json");
const STAGE4: &str = include_str!("fixtures/stage4_report_generation.json");

/// Replays queued replies in order and records the prompts it was sent.
#[derive(Default)]
struct ScriptedClient {
    replies: Mutex<VecDeque<Result<String, ProviderError>>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    fn with_replies(replies: Vec<Result<String, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        })
    }

    fn push(&self, reply: Result<String, ProviderError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn prompt(&self, idx: usize) -> String {
        self.prompts.lock().unwrap()[idx].clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn send(
        &self,
        call: CompletionCall<'_>,
        _cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap()
            .push(format!("{}\n{}", call.system_prompt, call.user_prompt));
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::invalid_response("no scripted reply left")))
    }
}

fn all_stages() -> Vec<Result<String, ProviderError>> {
    vec![
        Ok(STAGE1.to_string()),
        Ok(format!("```json\n{STAGE2}\n```")),
        Ok(format!("Here is the curation:\n{STAGE3}")),
        Ok(STAGE4.to_string()),
    ]
}

fn fixture(text: &str) -> Value {
    serde_json::from_str(text).unwrap()
}

struct Harness {
    client: Arc<ScriptedClient>,
    store: Arc<MemoryReportStore>,
    orchestrator: PipelineOrchestrator,
}

fn harness(replies: Vec<Result<String, ProviderError>>) -> Harness {
    let client = ScriptedClient::with_replies(replies);
    let store = Arc::new(MemoryReportStore::new());
    let orchestrator = PipelineOrchestrator::new(StageRunner::new(client.clone()), store.clone());
    Harness {
        client,
        store,
        orchestrator,
    }
}

async fn new_report(h: &Harness) -> Report {
    let intake = IntakeData::parse(INTAKE).unwrap();
    h.orchestrator.create(&intake).await.unwrap()
}

#[tokio::test]
async fn full_run_completes_and_keeps_share_token() {
    let h = harness(all_stages());
    let created = new_report(&h).await;
    assert_eq!(created.status, ReportStatus::Pending);
    let token = created.share_token.clone().unwrap();

    let done = h.orchestrator.run(&created.id).await.unwrap();

    assert_eq!(h.client.calls(), 4);
    assert_eq!(done.status, ReportStatus::Completed);
    assert_eq!(done.share_token.as_deref(), Some(token.as_str()));
    for stage in StageId::ALL {
        assert!(done.stage_output(stage).is_some(), "{stage} missing");
    }
    assert_eq!(done.stage3_output.as_ref().unwrap()["whereToStart"]["toolName"], "Weave");

    let shared = h.store.find_by_share_token(&token).await.unwrap();
    assert_eq!(shared.id, created.id);
}

#[tokio::test]
async fn prompts_carry_intake_and_earlier_outputs() {
    let h = harness(all_stages());
    let created = new_report(&h).await;
    h.orchestrator.run(&created.id).await.unwrap();

    let stage1 = h.client.prompt(0);
    assert!(stage1.contains("Bright Smiles Dental"));
    assert!(stage1.contains("7.5 hours per week"));
    assert!(stage1.contains("$3,000 per month"));

    let stage2 = h.client.prompt(1);
    assert!(stage2.contains("Insurance verification by phone"));

    let stage4 = h.client.prompt(3);
    assert!(stage4.contains("Vyne Trellis"));
}

#[tokio::test]
async fn completed_report_is_not_rerun() {
    let h = harness(all_stages());
    let created = new_report(&h).await;
    let done = h.orchestrator.run(&created.id).await.unwrap();

    let outcome = h.orchestrator.run_next(&created.id).await.unwrap();
    assert!(matches!(outcome, StepOutcome::AlreadyComplete(_)));
    let again = h.orchestrator.run(&created.id).await.unwrap();

    assert_eq!(h.client.calls(), 4);
    assert_eq!(again.stage4_output, done.stage4_output);
    assert_eq!(again.updated_at, done.updated_at);
}

#[tokio::test]
async fn timeout_leaves_report_pending_and_rerun_resumes() {
    let h = harness(vec![Err(ProviderError::Timeout(Duration::from_secs(60)))]);
    let created = new_report(&h).await;

    let err = h.orchestrator.run(&created.id).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Timeout {
            stage: StageId::ProblemAnalysis,
            ..
        }
    ));
    assert!(err.is_retryable());
    let stored = h.store.get(&created.id).await.unwrap();
    assert_eq!(stored.status, ReportStatus::Pending);
    assert!(stored.stage1_output.is_none());

    for reply in all_stages() {
        h.client.push(reply);
    }
    let done = h.orchestrator.run(&created.id).await.unwrap();
    assert_eq!(done.status, ReportStatus::Completed);
    assert_eq!(h.client.calls(), 5);
}

#[tokio::test]
async fn schema_failure_keeps_earlier_progress() {
    let h = harness(vec![
        Ok(STAGE1.to_string()),
        Ok(r#"{"tools": [{"name": "Weave"}]}"#.to_string()),
    ]);
    let created = new_report(&h).await;

    let err = h.orchestrator.run(&created.id).await.unwrap_err();
    match &err {
        PipelineError::Schema(schema) => {
            assert_eq!(schema.stage, StageId::ToolResearch);
            assert!(schema
                .violations
                .iter()
                .any(|v| v.contains("recommendedSolutions")));
        }
        other => panic!("expected schema error, got {other:?}"),
    }

    let stored = h.store.get(&created.id).await.unwrap();
    assert_eq!(stored.status, ReportStatus::Stage1Complete);
    assert!(stored.stage1_output.is_some());
    assert!(stored.stage2_output.is_none());

    h.client.push(Ok(STAGE2.to_string()));
    let outcome = h.orchestrator.run_next(&created.id).await.unwrap();
    match outcome {
        StepOutcome::Advanced { stage, report } => {
            assert_eq!(stage, StageId::ToolResearch);
            assert_eq!(report.status, ReportStatus::Stage2Complete);
            assert_eq!(report.stage1_output, stored.stage1_output);
        }
        other => panic!("expected stage 2 to run, got {other:?}"),
    }
}

#[tokio::test]
async fn prose_reply_is_malformed_and_persists_nothing() {
    let h = harness(vec![Ok(
        "I'm sorry, I can't produce that analysis right now.".to_string()
    )]);
    let created = new_report(&h).await;

    let err = h.orchestrator.run_next(&created.id).await.unwrap_err();
    assert_eq!(err.code(), "malformed_output");
    assert_eq!(err.stage(), Some(StageId::ProblemAnalysis));

    let stored = h.store.get(&created.id).await.unwrap();
    assert_eq!(stored, created);
}

#[tokio::test]
async fn trailing_commas_are_repaired() {
    let sloppy = STAGE1.replace("\"category\": \"scheduling\"", "\"category\": \"scheduling\",");
    let h = harness(vec![Ok(sloppy)]);
    let created = new_report(&h).await;

    let outcome = h.orchestrator.run_next(&created.id).await.unwrap();
    assert_eq!(outcome.report().status, ReportStatus::Stage1Complete);
}

#[tokio::test]
async fn report_naming_an_uncurated_tool_is_rejected() {
    let mut stage4 = fixture(STAGE4);
    stage4["recommendedSolutions"][2]["toolName"] = json!("Salesforce");
    let mut replies = all_stages();
    replies[3] = Ok(stage4.to_string());
    let h = harness(replies);
    let created = new_report(&h).await;

    let err = h.orchestrator.run(&created.id).await.unwrap_err();
    assert_eq!(err.code(), "schema_error");
    let stored = h.store.get(&created.id).await.unwrap();
    assert_eq!(stored.status, ReportStatus::Stage3Complete);
    assert!(stored.stage4_output.is_none());
}

#[tokio::test]
async fn run_through_stops_after_requested_stage() {
    let h = harness(all_stages());
    let created = new_report(&h).await;

    let partial = h
        .orchestrator
        .run_through(&created.id, StageId::ToolResearch)
        .await
        .unwrap();
    assert_eq!(partial.status, ReportStatus::Stage2Complete);
    assert_eq!(h.client.calls(), 2);

    let done = h.orchestrator.run(&created.id).await.unwrap();
    assert_eq!(done.status, ReportStatus::Completed);
    assert_eq!(h.client.calls(), 4);
}

#[tokio::test]
async fn imported_stage_is_validated_and_run_continues_after_it() {
    let h = harness(vec![
        Ok(STAGE2.to_string()),
        Ok(STAGE3.to_string()),
        Ok(STAGE4.to_string()),
    ]);
    let created = new_report(&h).await;

    let err = h
        .orchestrator
        .import_stage(&created.id, StageId::ToolCuration, &fixture(STAGE3))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Input(InputError::StageOutOfOrder {
            stage: StageId::ToolCuration,
            next: Some(StageId::ProblemAnalysis),
        })
    ));

    let err = h
        .orchestrator
        .import_stage(&created.id, StageId::ProblemAnalysis, &json!({"topOpportunities": []}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "schema_error");

    let imported = h
        .orchestrator
        .import_stage(&created.id, StageId::ProblemAnalysis, &fixture(STAGE1))
        .await
        .unwrap();
    assert_eq!(imported.status, ReportStatus::Stage1Complete);
    assert_eq!(h.client.calls(), 0);

    let done = h.orchestrator.run(&created.id).await.unwrap();
    assert_eq!(done.status, ReportStatus::Completed);
    assert_eq!(h.client.calls(), 3);
}

#[tokio::test]
async fn unknown_report_is_not_found() {
    let h = harness(Vec::new());
    let err = h.orchestrator.run("missing").await.unwrap_err();
    assert_eq!(err.code(), "not_found");
    assert_eq!(h.client.calls(), 0);
}

#[tokio::test]
async fn stored_output_that_no_longer_validates_is_not_retryable() {
    let h = harness(vec![Ok(STAGE2.to_string())]);
    let created = new_report(&h).await;
    h.store
        .update(
            &created.id,
            ReportUpdate::new()
                .status(ReportStatus::Stage1Complete)
                .stage_output(StageId::ProblemAnalysis, json!({"topOpportunities": []})),
        )
        .await
        .unwrap();

    for _ in 0..2 {
        let err = h.orchestrator.run(&created.id).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Input(InputError::InvalidStoredOutput {
                stage: StageId::ToolResearch,
                requires: StageId::ProblemAnalysis,
                ..
            })
        ));
        assert_eq!(err.code(), "input_error");
        assert!(!err.is_retryable());
        assert_eq!(err.stage(), Some(StageId::ToolResearch));
    }
    assert_eq!(h.client.calls(), 0);

    let report = h.store.get(&created.id).await.unwrap();
    assert_eq!(report.status, ReportStatus::Stage1Complete);
}

/// Lets another writer advance the report between the orchestrator's read
/// and its write.
struct RacingStore {
    inner: MemoryReportStore,
    raced: AtomicUsize,
}

#[async_trait]
impl ReportStore for RacingStore {
    async fn create(&self, report: Report) -> Result<Report, StoreError> {
        self.inner.create(report).await
    }

    async fn get(&self, id: &str) -> Result<Report, StoreError> {
        self.inner.get(id).await
    }

    async fn update(&self, id: &str, update: ReportUpdate) -> Result<Report, StoreError> {
        if self.raced.fetch_add(1, Ordering::SeqCst) == 0 {
            let rival = ReportUpdate::new()
                .status(ReportStatus::Stage1Complete)
                .stage_output(StageId::ProblemAnalysis, fixture(STAGE1));
            self.inner.update(id, rival).await?;
        }
        self.inner.update(id, update).await
    }

    async fn find_by_share_token(&self, share_token: &str) -> Result<Report, StoreError> {
        self.inner.find_by_share_token(share_token).await
    }
}

#[tokio::test]
async fn concurrent_advance_is_a_conflict() {
    let client = ScriptedClient::with_replies(all_stages());
    let store = Arc::new(RacingStore {
        inner: MemoryReportStore::new(),
        raced: AtomicUsize::new(0),
    });
    let orchestrator = PipelineOrchestrator::new(StageRunner::new(client.clone()), store.clone());
    let created = orchestrator
        .create(&IntakeData::parse(INTAKE).unwrap())
        .await
        .unwrap();

    let err = orchestrator.run_next(&created.id).await.unwrap_err();
    match err {
        PipelineError::Conflict {
            expected, actual, ..
        } => {
            assert_eq!(expected, ReportStatus::Pending);
            assert_eq!(actual, ReportStatus::Stage1Complete);
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    let stored = store.get(&created.id).await.unwrap();
    assert_eq!(stored.status, ReportStatus::Stage1Complete);
}

#[tokio::test]
async fn cancelled_run_persists_nothing() {
    struct Hanging;

    #[async_trait]
    impl LlmClient for Hanging {
        async fn send(
            &self,
            _call: CompletionCall<'_>,
            cancel: &CancellationToken,
        ) -> Result<String, ProviderError> {
            cancel.cancelled().await;
            Err(ProviderError::Cancelled)
        }
    }

    let store = Arc::new(MemoryReportStore::new());
    let cancel = CancellationToken::new();
    let orchestrator = PipelineOrchestrator::new(StageRunner::new(Arc::new(Hanging)), store.clone())
        .with_cancellation(cancel.clone());
    let created = orchestrator
        .create(&IntakeData::parse(INTAKE).unwrap())
        .await
        .unwrap();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = orchestrator.run(&created.id).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Cancelled {
            stage: StageId::ProblemAnalysis
        }
    ));
    assert_eq!(store.get(&created.id).await.unwrap(), created);
}
