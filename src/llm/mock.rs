//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本顺序弹出预置响应，可混入错误；脚本耗尽后返回 Api 错误，
//! 便于断言「LLM 不可用时引擎仍然给出良构结果」。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::Message;

/// Mock 客户端：预置响应队列
pub struct MockLlmClient {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    /// 已消费的调用次数
    calls: Mutex<usize>,
}

impl MockLlmClient {
    pub fn with_responses(responses: Vec<Result<String, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            calls: Mutex::new(0),
        }
    }

    /// 无脚本：所有调用都失败（等价于「LLM 未配置」）
    pub fn unavailable() -> Self {
        Self::with_responses(vec![])
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
        *self.calls.lock().unwrap() += 1;
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Api("mock: no scripted response".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_responses_in_order() {
        let mock = MockLlmClient::with_responses(vec![Ok("uno".into()), Ok("dos".into())]);
        assert_eq!(mock.complete(&[]).await.unwrap(), "uno");
        assert_eq!(mock.complete(&[]).await.unwrap(), "dos");
        assert!(mock.complete(&[]).await.is_err());
        assert_eq!(mock.call_count(), 3);
    }
}
