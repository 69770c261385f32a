//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Fallback 组合 / Mock）实现 LlmClient。
//! 引擎只依赖 complete：给定消息列表返回自由文本；结构化输出统一走
//! `llm::complete_json`（解析 + 一次修复重试）。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Message;

/// LLM 调用错误：限流与其余错误分开，Fallback 组合依赖这一区分
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("llm timeout after {0}s")]
    Timeout(u64),

    /// 限流（429 / RESOURCE_EXHAUSTED / quota）：可切换备用端点
    #[error("llm rate limited: {0}")]
    RateLimited(String),

    #[error("llm api error: {0}")]
    Api(String),
}

impl LlmError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LlmError::RateLimited(_))
    }

    /// 从错误消息归类：上游 SDK 不区分限流时按关键字判断
    pub fn from_message(msg: String) -> LlmError {
        let lower = msg.to_lowercase();
        if msg.contains("429")
            || lower.contains("rate limit")
            || lower.contains("resource_exhausted")
            || lower.contains("quota")
        {
            LlmError::RateLimited(msg)
        } else {
            LlmError::Api(msg)
        }
    }
}

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成，返回整段文本
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 后端名（日志用）
    fn name(&self) -> &'static str {
        "llm"
    }

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
