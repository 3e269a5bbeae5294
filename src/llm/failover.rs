//! Ordered provider fallback with a per-call timeout.
//!
//! Each call tries providers in priority order. A provider that errors or
//! exceeds the timeout is skipped for that call only; nothing is retried on
//! the same provider. When every provider fails the caller gets
//! `LlmError::AllProvidersFailed` and applies its own canned fallback.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::provider::{CompletionRequest, CompletionResponse, LlmProvider, estimate_cost};
use crate::error::LlmError;

/// Provider chain.
pub struct FailoverProvider {
    providers: Vec<Arc<dyn LlmProvider>>,
    default_timeout: Duration,
}

impl FailoverProvider {
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>, default_timeout: Duration) -> Self {
        Self {
            providers,
            default_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl LlmProvider for FailoverProvider {
    fn model_name(&self) -> &str {
        self.providers
            .first()
            .map(|p| p.model_name())
            .unwrap_or("none")
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        self.providers
            .first()
            .map(|p| p.cost_per_token())
            .unwrap_or((Decimal::ZERO, Decimal::ZERO))
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let mut last = String::from("no providers configured");

        for provider in &self.providers {
            let model = provider.model_name().to_string();
            match tokio::time::timeout(timeout, provider.complete(request.clone())).await {
                Ok(Ok(response)) => {
                    debug!(
                        model = %model,
                        input_tokens = response.input_tokens,
                        output_tokens = response.output_tokens,
                        cost_usd = %estimate_cost(provider.as_ref(), &response),
                        "Completion succeeded"
                    );
                    return Ok(response);
                }
                Ok(Err(e)) => {
                    warn!(model = %model, error = %e, "Provider failed; trying next");
                    last = e.to_string();
                }
                Err(_) => {
                    let e = LlmError::Timeout {
                        provider: model.clone(),
                        timeout,
                    };
                    warn!(model = %model, ?timeout, "Provider timed out; trying next");
                    last = e.to_string();
                }
            }
        }

        Err(LlmError::AllProvidersFailed {
            attempted: self.providers.len(),
            last,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::llm::provider::ChatMessage;

    enum Behavior {
        Reply(&'static str),
        Fail,
        Hang,
    }

    struct StubProvider {
        name: &'static str,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl StubProvider {
        fn new(name: &'static str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name,
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for StubProvider {
        fn model_name(&self) -> &str {
            self.name
        }
        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Reply(text) => Ok(CompletionResponse {
                    content: text.to_string(),
                    input_tokens: 1,
                    output_tokens: 1,
                }),
                Behavior::Fail => Err(LlmError::RequestFailed {
                    provider: self.name.into(),
                    reason: "boom".into(),
                }),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    unreachable!("timeout should fire first")
                }
            }
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![ChatMessage::user("oi")])
    }

    #[tokio::test]
    async fn first_healthy_provider_wins() {
        let a = StubProvider::new("a", Behavior::Reply("from a"));
        let b = StubProvider::new("b", Behavior::Reply("from b"));
        let chain = FailoverProvider::new(vec![a.clone(), b.clone()], Duration::from_secs(1));

        let resp = chain.complete(request()).await.unwrap();
        assert_eq!(resp.content, "from a");
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);
        assert_eq!(chain.model_name(), "a");
    }

    #[tokio::test]
    async fn error_falls_through_to_next() {
        let a = StubProvider::new("a", Behavior::Fail);
        let b = StubProvider::new("b", Behavior::Reply("from b"));
        let chain = FailoverProvider::new(vec![a.clone(), b], Duration::from_secs(1));

        let resp = chain.complete(request()).await.unwrap();
        assert_eq!(resp.content, "from b");
        assert_eq!(a.calls.load(Ordering::SeqCst), 1, "no retry on the failed provider");
    }

    #[tokio::test]
    async fn timeout_falls_through_to_next() {
        let a = StubProvider::new("slow", Behavior::Hang);
        let b = StubProvider::new("b", Behavior::Reply("fast"));
        let chain = FailoverProvider::new(vec![a, b], Duration::from_secs(5));

        let resp = chain
            .complete(request().with_timeout(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(resp.content, "fast");
    }

    #[tokio::test]
    async fn all_failed_reports_count() {
        let chain = FailoverProvider::new(
            vec![StubProvider::new("a", Behavior::Fail), StubProvider::new("b", Behavior::Fail)],
            Duration::from_secs(1),
        );
        let err = chain.complete(request()).await.unwrap_err();
        assert!(matches!(err, LlmError::AllProvidersFailed { attempted: 2, .. }));
    }

    #[tokio::test]
    async fn empty_chain_fails_cleanly() {
        let chain = FailoverProvider::new(Vec::new(), Duration::from_secs(1));
        assert!(chain.is_empty());
        let err = chain.complete(request()).await.unwrap_err();
        assert!(matches!(err, LlmError::AllProvidersFailed { attempted: 0, .. }));
    }
}
