use std::sync::Arc;

use async_trait::async_trait;
use intake_report::{
    CompletionCall, IntakeData, JsonlTraceSink, LlmClient, MemoryReportStore, PipelineOrchestrator,
    ProviderError, StageRunner, StageTrace, TraceSink,
};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

#[derive(Debug, serde::Deserialize)]
struct TraceRow {
    report_id: Option<String>,
    stage: u8,
    stage_name: String,
    prompt_template_slug: String,
    prompt_hash: String,
    raw_output: Option<String>,
    repair_passes: Vec<String>,
    outcome: String,
    error: Option<String>,
}

fn make_trace(stage: u8, outcome: &str) -> StageTrace {
    StageTrace {
        timestamp_ms: 0,
        report_id: Some("r1".to_string()),
        stage,
        stage_name: "problem_analysis",
        prompt_template_slug: "problem_analysis_v1".to_string(),
        prompt_hash: "hash".to_string(),
        latency_ms: 12,
        raw_output: Some("{}".to_string()),
        repair_passes: vec!["remove_trailing_commas"],
        outcome: outcome.to_string(),
        error: None,
    }
}

#[test]
fn jsonl_trace_sink_appends_and_flushes_on_join() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");

    let (sink, worker) = JsonlTraceSink::new(&path).unwrap();
    sink.record(make_trace(1, "ok")).unwrap();
    drop(sink);
    worker.join().unwrap();

    let (sink, worker) = JsonlTraceSink::new(&path).unwrap();
    sink.record(make_trace(2, "schema_error")).unwrap();
    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<TraceRow> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].stage, 1);
    assert_eq!(rows[0].repair_passes, vec!["remove_trailing_commas"]);
    assert_eq!(rows[1].outcome, "schema_error");
}

struct Prose;

#[async_trait]
impl LlmClient for Prose {
    async fn send(
        &self,
        _call: CompletionCall<'_>,
        _cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        Ok("Happy to help! Unfortunately I need more details.".to_string())
    }
}

#[tokio::test]
async fn failed_attempts_are_traced_with_raw_output() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");
    let (sink, worker) = JsonlTraceSink::new(&path).unwrap();
    let sink: Arc<dyn TraceSink> = Arc::new(sink);

    let runner = StageRunner::new(Arc::new(Prose)).with_trace_sink(sink.clone());
    let orchestrator = PipelineOrchestrator::new(runner, Arc::new(MemoryReportStore::new()));
    let intake = IntakeData::parse(r#"{"businessName": "Bright Smiles Dental"}"#).unwrap();
    let report = orchestrator.create(&intake).await.unwrap();
    let err = orchestrator.run(&report.id).await.unwrap_err();
    assert_eq!(err.code(), "malformed_output");

    drop(orchestrator);
    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<TraceRow> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.report_id.as_deref(), Some(report.id.as_str()));
    assert_eq!(row.stage, 1);
    assert_eq!(row.stage_name, "problem_analysis");
    assert_eq!(row.prompt_template_slug, "problem_analysis_v1");
    assert_eq!(row.prompt_hash.len(), 64);
    assert_eq!(row.outcome, "malformed_output");
    assert!(row.raw_output.as_deref().unwrap().starts_with("Happy to help"));
    assert!(row.error.is_some());
}
