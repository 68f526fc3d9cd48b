//! Report store backed by a PostgREST endpoint (`/rest/v1/reports`).
//!
//! Rows use the hosted schema's column names: `report_status` rather than
//! `status`, snake_case stage columns. The status precondition becomes a
//! `report_status=eq.<status>` filter on the PATCH, so the check and the
//! write are one request.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::{Report, ReportStatus, ReportStore, ReportUpdate, StoreError};
use crate::stages::StageId;

const TABLE_PATH: &str = "rest/v1/reports";

#[derive(Debug, Clone)]
pub struct RestReportStore {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReportRow {
    id: String,
    report_status: ReportStatus,
    #[serde(default)]
    intake_data: Value,
    stage1_output: Option<Value>,
    stage2_output: Option<Value>,
    stage3_output: Option<Value>,
    stage4_output: Option<Value>,
    share_token: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<Report> for ReportRow {
    fn from(r: Report) -> Self {
        Self {
            id: r.id,
            report_status: r.status,
            intake_data: r.intake_data,
            stage1_output: r.stage1_output,
            stage2_output: r.stage2_output,
            stage3_output: r.stage3_output,
            stage4_output: r.stage4_output,
            share_token: r.share_token,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

impl From<ReportRow> for Report {
    fn from(r: ReportRow) -> Self {
        Self {
            id: r.id,
            status: r.report_status,
            intake_data: r.intake_data,
            stage1_output: r.stage1_output,
            stage2_output: r.stage2_output,
            stage3_output: r.stage3_output,
            stage4_output: r.stage4_output,
            share_token: r.share_token,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// Column name for a stage's output.
fn stage_column(stage: StageId) -> &'static str {
    match stage {
        StageId::ProblemAnalysis => "stage1_output",
        StageId::ToolResearch => "stage2_output",
        StageId::ToolCuration => "stage3_output",
        StageId::ReportGeneration => "stage4_output",
    }
}

/// PATCH body: only the fields the update sets, plus the new timestamp.
fn patch_body(update: &ReportUpdate, now: DateTime<Utc>) -> Value {
    let mut body = Map::new();
    if let Some(status) = update.status {
        body.insert("report_status".into(), Value::String(status.as_str().into()));
    }
    if let Some((stage, value)) = &update.stage_output {
        body.insert(stage_column(*stage).into(), value.clone());
    }
    if let Some(token) = &update.share_token {
        body.insert("share_token".into(), Value::String(token.clone()));
    }
    body.insert("updated_at".into(), Value::String(now.to_rfc3339()));
    Value::Object(body)
}

impl RestReportStore {
    /// `api_key` is sent both as `apikey` and as a bearer token.
    pub fn new(base_url: impl Into<String>, api_key: &str) -> Result<Self, StoreError> {
        Self::with_timeout(base_url, api_key, Duration::from_secs(30))
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        if api_key.trim().is_empty() {
            return Err(StoreError::Config("store API key is empty".into()));
        }
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let key = HeaderValue::from_str(api_key)
            .map_err(|_| StoreError::Config("invalid store API key format".into()))?;
        headers.insert("apikey", key);
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| StoreError::Config("invalid store API key format".into()))?;
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn table_url(&self) -> String {
        format!("{}/{TABLE_PATH}", self.base_url)
    }

    async fn rows(response: reqwest::Response) -> Result<Vec<ReportRow>, StoreError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
                .unwrap_or(body);
            return Err(StoreError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn select(&self, column: &str, value: &str) -> Result<Option<Report>, StoreError> {
        let response = self
            .client
            .get(self.table_url())
            .query(&[(column, format!("eq.{value}")), ("select", "*".to_string())])
            .send()
            .await?;
        Ok(Self::rows(response).await?.into_iter().next().map(Report::from))
    }
}

#[async_trait]
impl ReportStore for RestReportStore {
    async fn create(&self, report: Report) -> Result<Report, StoreError> {
        let response = self
            .client
            .post(self.table_url())
            .header("Prefer", "return=representation")
            .json(&ReportRow::from(report))
            .send()
            .await?;
        Self::rows(response)
            .await?
            .into_iter()
            .next()
            .map(Report::from)
            .ok_or_else(|| StoreError::Corrupt("insert returned no row".into()))
    }

    async fn get(&self, id: &str) -> Result<Report, StoreError> {
        self.select("id", id)
            .await?
            .ok_or_else(|| StoreError::not_found(id))
    }

    async fn update(&self, id: &str, update: ReportUpdate) -> Result<Report, StoreError> {
        let mut filters = vec![("id", format!("eq.{id}"))];
        if let Some(expected) = update.expected_status {
            filters.push(("report_status", format!("eq.{}", expected.as_str())));
        }
        let response = self
            .client
            .patch(self.table_url())
            .header("Prefer", "return=representation")
            .query(&filters)
            .json(&patch_body(&update, Utc::now()))
            .send()
            .await?;

        if let Some(row) = Self::rows(response).await?.into_iter().next() {
            return Ok(row.into());
        }

        // Nothing matched: either the id is unknown or the precondition failed.
        let current = self.get(id).await?;
        match update.expected_status {
            Some(expected) => {
                debug!(
                    report_id = id,
                    %expected,
                    actual = %current.status,
                    "status precondition failed"
                );
                Err(StoreError::Conflict {
                    id: id.to_string(),
                    expected,
                    actual: current.status,
                })
            }
            None => Err(StoreError::not_found(id)),
        }
    }

    async fn find_by_share_token(&self, share_token: &str) -> Result<Report, StoreError> {
        self.select("share_token", share_token)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("share token {share_token}")))
    }
}
