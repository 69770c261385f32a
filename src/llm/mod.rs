//! LLM 层：客户端抽象与实现（OpenAI 兼容 / 主备组合 / Mock）
//!
//! 结构化输出统一通过 complete_json：解析失败时带着错误信息再问一次，
//! 第二次仍失败则上抛，由各调用方的确定性路径兜底。

pub mod fallback;
pub mod json;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

use serde::de::DeserializeOwned;

pub use fallback::FallbackLlmClient;
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, LlmError};

use crate::config::LlmSection;
use crate::error::EngineError;
use crate::memory::Message;

/// 结构化完成：一次调用 + 一次带解析错误的修复重试
///
/// 两次都无法得到合法 JSON 时返回 LlmParse，调用方落回确定性路径。
pub async fn complete_json<T: DeserializeOwned>(
    client: &dyn LlmClient,
    messages: &[Message],
) -> Result<T, EngineError> {
    let raw = client
        .complete(messages)
        .await
        .map_err(|e| EngineError::Llm(e.to_string()))?;

    let parse_err = match json::parse_loose::<T>(&raw) {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };

    tracing::warn!(llm = client.name(), "llm output unparseable, repairing: {}", parse_err);

    // 修复轮：把原始输出与解析错误一起回给模型
    let mut repair = messages.to_vec();
    repair.push(Message::assistant(raw));
    repair.push(Message::user(format!(
        "Tu respuesta no es JSON valido ({}). Responde de nuevo SOLO con el objeto JSON, sin markdown.",
        parse_err
    )));

    let raw2 = client
        .complete(&repair)
        .await
        .map_err(|e| EngineError::Llm(e.to_string()))?;

    json::parse_loose::<T>(&raw2).map_err(EngineError::LlmParse)
}

/// 根据配置构建 LLM 客户端；未配置 API Key 时返回 None（引擎全程可离线）
pub fn create_llm_from_config(cfg: &LlmSection) -> Option<Arc<dyn LlmClient>> {
    let has_key =
        std::env::var("FARO_LLM_API_KEY").is_ok() || std::env::var("OPENAI_API_KEY").is_ok();
    if !has_key {
        tracing::warn!("no LLM API key configured, heuristic paths only");
        return None;
    }

    let primary: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(
        cfg.base_url.as_deref(),
        &cfg.model,
        None,
        cfg.timeout_seconds,
    ));
    tracing::info!(model = %cfg.model, provider = %cfg.provider, "LLM primario configurado");

    match &cfg.fallback_model {
        Some(fallback_model) => {
            let fallback: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(
                cfg.fallback_base_url.as_deref(),
                fallback_model,
                None,
                cfg.timeout_seconds,
            ));
            tracing::info!(model = %fallback_model, "LLM fallback configurado");
            let combined: Arc<dyn LlmClient> = Arc::new(FallbackLlmClient::new(primary, fallback));
            Some(combined)
        }
        None => Some(primary),
    }
}
