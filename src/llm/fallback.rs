//! 主备 LLM 组合：主端点限流时切换到备用端点
//!
//! 只在限流类错误（429 / RESOURCE_EXHAUSTED / quota）上切换；
//! 其余错误原样上抛，由调用方的确定性路径兜底。

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::Message;

/// 主备组合客户端
pub struct FallbackLlmClient {
    primary: Arc<dyn LlmClient>,
    fallback: Arc<dyn LlmClient>,
}

impl FallbackLlmClient {
    pub fn new(primary: Arc<dyn LlmClient>, fallback: Arc<dyn LlmClient>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl LlmClient for FallbackLlmClient {
    fn name(&self) -> &'static str {
        "fallback-pair"
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        let (p1, c1, t1) = self.primary.token_usage();
        let (p2, c2, t2) = self.fallback.token_usage();
        (p1 + p2, c1 + c2, t1 + t2)
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        match self.primary.complete(messages).await {
            Ok(text) => Ok(text),
            Err(e) if e.is_rate_limit() => {
                tracing::warn!(
                    primary = self.primary.name(),
                    "llm rate limited, switching to fallback: {}",
                    e
                );
                self.fallback.complete(messages).await
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[tokio::test]
    async fn test_fallback_on_rate_limit() {
        let primary = Arc::new(MockLlmClient::with_responses(vec![Err(
            LlmError::RateLimited("429".into()),
        )]));
        let fallback = Arc::new(MockLlmClient::with_responses(vec![Ok("ok".into())]));
        let client = FallbackLlmClient::new(primary, fallback);

        let out = client.complete(&[Message::user("hola")]).await.unwrap();
        assert_eq!(out, "ok");
    }

    #[tokio::test]
    async fn test_no_fallback_on_other_errors() {
        let primary = Arc::new(MockLlmClient::with_responses(vec![Err(LlmError::Api(
            "boom".into(),
        ))]));
        let fallback = Arc::new(MockLlmClient::with_responses(vec![Ok("nunca".into())]));
        let client = FallbackLlmClient::new(primary, fallback);

        let err = client.complete(&[Message::user("hola")]).await.unwrap_err();
        assert!(matches!(err, LlmError::Api(_)));
    }
}
