//! In-process store for tests and dry runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{Report, ReportStore, ReportUpdate, StoreError};

#[derive(Debug, Default)]
pub struct MemoryReportStore {
    reports: Mutex<HashMap<String, Report>>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Report>> {
        // A panicked writer cannot leave a half-applied update behind.
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn create(&self, report: Report) -> Result<Report, StoreError> {
        let mut reports = self.lock();
        if reports.contains_key(&report.id) {
            return Err(StoreError::Corrupt(format!(
                "report {} already exists",
                report.id
            )));
        }
        reports.insert(report.id.clone(), report.clone());
        Ok(report)
    }

    async fn get(&self, id: &str) -> Result<Report, StoreError> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(id))
    }

    async fn update(&self, id: &str, update: ReportUpdate) -> Result<Report, StoreError> {
        let mut reports = self.lock();
        let report = reports.get_mut(id).ok_or_else(|| StoreError::not_found(id))?;
        StoreError::check_expected(id, &update, report.status)?;
        report.apply(&update, Utc::now());
        Ok(report.clone())
    }

    async fn find_by_share_token(&self, share_token: &str) -> Result<Report, StoreError> {
        self.lock()
            .values()
            .find(|r| r.share_token.as_deref() == Some(share_token))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("share token {share_token}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::StageId;
    use crate::store::ReportStatus;
    use serde_json::json;

    #[tokio::test]
    async fn update_respects_expected_status() {
        let store = MemoryReportStore::new();
        let report = store.create(Report::new(json!({}))).await.unwrap();

        let update = ReportUpdate::new()
            .status(ReportStatus::Stage1Complete)
            .stage_output(StageId::ProblemAnalysis, json!({"a": 1}))
            .expect_status(ReportStatus::Pending);
        let updated = store.update(&report.id, update.clone()).await.unwrap();
        assert_eq!(updated.status, ReportStatus::Stage1Complete);

        let err = store.update(&report.id, update).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: ReportStatus::Pending,
                actual: ReportStatus::Stage1Complete,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn lookups_report_not_found() {
        let store = MemoryReportStore::new();
        assert!(matches!(store.get("nope").await, Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.update("nope", ReportUpdate::new()).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.find_by_share_token("nope").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn finds_by_share_token() {
        let store = MemoryReportStore::new();
        let report = store.create(Report::new(json!({}))).await.unwrap();
        let token = report.share_token.clone().unwrap();
        assert_eq!(store.find_by_share_token(&token).await.unwrap().id, report.id);
        assert_eq!(store.len(), 1);
    }
}
