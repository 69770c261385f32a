//! 引擎错误类型
//!
//! 与编排器配合：每个错误类别映射到一条处理策略（丢弃单条查询 / 反思重试 /
//! 降级为确定性路径 / 终止并 finish(error)）。阶段内部的错误永远不会越过
//! 编排器直接终止流，只会被写入状态由状态机决定下一步。

use thiserror::Error;

/// 引擎运行过程中可能出现的错误（目录、参数、上游、LLM、取消等）
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// 查询 id 不在目录中：开发期视为编程错误，生产按 data_unavailable 处理
    #[error("unknown query: {0}")]
    UnknownQuery(String),

    /// 参数校验失败：该查询从批次中丢弃，其余继续
    #[error("invalid params for {query_id}: {reason}")]
    InvalidParams { query_id: String, reason: String },

    /// 数据库传输层不可用
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// 单条查询超时
    #[error("upstream timeout after {0}s")]
    UpstreamTimeout(u64),

    /// 数据库返回错误体
    #[error("upstream error: {0}")]
    UpstreamError(String),

    /// LLM 输出无法解析：一次带错误信息的修复重试，再失败走确定性路径
    #[error("llm parse error: {0}")]
    LlmParse(String),

    /// LLM 调用失败（网络 / 限流 / 超时）
    #[error("llm error: {0}")]
    Llm(String),

    /// 所有选中的查询都失败：触发 reflect 重试
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    /// 看板构建失败：一次缩减槽位的重试，再失败只发 payload
    #[error("presentation error: {0}")]
    Presentation(String),

    /// 调用方断开或显式取消
    #[error("cancelled")]
    Cancelled,

    /// 整个请求超过墙钟截止时间
    #[error("request deadline exceeded")]
    DeadlineExceeded,

    /// 记忆存储读写失败（不阻塞主路径，仅记录）
    #[error("memory store error: {0}")]
    Memory(String),
}

impl EngineError {
    /// 稳定的类别名，写入 agent_steps 与日志
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::UnknownQuery(_) => "unknown_query",
            EngineError::InvalidParams { .. } => "invalid_params",
            EngineError::UpstreamUnavailable(_) => "upstream_unavailable",
            EngineError::UpstreamTimeout(_) => "upstream_timeout",
            EngineError::UpstreamError(_) => "upstream_error",
            EngineError::LlmParse(_) => "llm_parse_error",
            EngineError::Llm(_) => "llm_error",
            EngineError::DataUnavailable(_) => "data_unavailable",
            EngineError::Presentation(_) => "presentation_error",
            EngineError::Cancelled => "cancelled",
            EngineError::DeadlineExceeded => "deadline_exceeded",
            EngineError::Memory(_) => "memory_error",
        }
    }

    /// 是否值得在 reflect 后重试（上游瞬时故障类）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::UpstreamUnavailable(_)
                | EngineError::UpstreamTimeout(_)
                | EngineError::UpstreamError(_)
                | EngineError::DataUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_names() {
        assert_eq!(
            EngineError::UnknownQuery("x".into()).kind(),
            "unknown_query"
        );
        assert_eq!(EngineError::UpstreamTimeout(30).kind(), "upstream_timeout");
        assert_eq!(
            EngineError::DataUnavailable("all failed".into()).kind(),
            "data_unavailable"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::UpstreamTimeout(30).is_retryable());
        assert!(EngineError::DataUnavailable("x".into()).is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(!EngineError::LlmParse("bad json".into()).is_retryable());
    }
}
