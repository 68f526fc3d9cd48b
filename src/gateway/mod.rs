//! Completion gateway: the single outbound call to the LLM provider.

pub mod error;
pub mod fence;
pub mod openai;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use openai::{ChatProvider, OpenAiAdapter};
use usage::{ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ProviderError};
pub use fence::strip_code_fence;
pub use types::*;
pub use usage::{NoopUsageSink, TracingUsageSink, UsageSink};

/// One completion call as seen by a pipeline stage.
#[derive(Debug, Clone)]
pub struct CompletionCall<'a> {
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    /// Hard wall-clock deadline for the whole call.
    pub timeout: Duration,
    pub max_completion_tokens: Option<u32>,
    pub attribution: Attribution,
}

/// Sends a prompt pair to the model and returns its text, fence-stripped.
///
/// Implementations do not retry; retry policy belongs to the caller.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn send(
        &self,
        call: CompletionCall<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError>;
}

/// Production [`LlmClient`]: one provider request per call, bounded by a
/// deadline that cancels the request in flight.
pub struct CompletionClient<P: ChatProvider, U: UsageSinkTrait> {
    provider: P,
    model: String,
    usage_sink: Arc<U>,
}

impl<U: UsageSinkTrait> CompletionClient<OpenAiAdapter, U> {
    pub fn openai(adapter: OpenAiAdapter, model: impl Into<String>, usage_sink: Arc<U>) -> Self {
        Self::new(adapter, model, usage_sink)
    }
}

impl<P: ChatProvider, U: UsageSinkTrait> CompletionClient<P, U> {
    pub fn new(provider: P, model: impl Into<String>, usage_sink: Arc<U>) -> Self {
        Self {
            provider,
            model: model.into(),
            usage_sink,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Issue the request and race it against the deadline and the caller's
    /// cancellation. Dropping the losing request future aborts the HTTP call.
    pub async fn send_raw(
        &self,
        call: CompletionCall<'_>,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        let mut req = ChatRequest::new(
            self.model.clone(),
            vec![
                Message::system(call.system_prompt),
                Message::user(call.user_prompt),
            ],
            call.attribution.clone(),
        );
        if let Some(max) = call.max_completion_tokens {
            req = req.max_completion_tokens(max);
        }

        let deadline = cancel.child_token();
        let timer = {
            let deadline = deadline.clone();
            let timeout = call.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                deadline.cancel();
            })
        };

        let result = tokio::select! {
            biased;
            _ = deadline.cancelled() => {
                if cancel.is_cancelled() {
                    Err(ProviderError::Cancelled)
                } else {
                    Err(ProviderError::Timeout(call.timeout))
                }
            }
            res = self.provider.chat(&req) => res,
        };
        timer.abort();

        self.record_usage(&req, &result).await;
        result
    }

    async fn record_usage(&self, req: &ChatRequest, result: &Result<ChatResponse, ProviderError>) {
        let record = ProviderCallRecord::new("chat/completions", &req.model, req.attribution.caller)
            .report(req.attribution.report_id.clone());
        let record = match result {
            Ok(resp) => record
                .tokens(resp.input_tokens, resp.output_tokens)
                .latency(resp.latency.as_millis() as u64),
            Err(err) => {
                warn!(
                    code = err.code(),
                    request_id = err.request_id().unwrap_or("-"),
                    error = %err,
                    "completion call failed"
                );
                record.error(err.code())
            }
        };
        self.usage_sink.record(record).await;
    }
}

#[async_trait::async_trait]
impl<P: ChatProvider, U: UsageSinkTrait> LlmClient for CompletionClient<P, U> {
    async fn send(
        &self,
        call: CompletionCall<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let resp = self.send_raw(call, cancel).await?;
        if resp.finish_reason == FinishReason::Length {
            debug!(
                output_tokens = resp.output_tokens,
                "completion stopped at the token limit"
            );
        }
        Ok(strip_code_fence(&resp.content).to_string())
    }
}
