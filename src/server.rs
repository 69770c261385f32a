//! HTTP 服务：流式聊天端点 + 辅助端点
//!
//! - POST /v1/chat/stream  长连接 SSE，载荷见 stream 模块的线约定
//! - GET  /api/health      数据库连通性 + 缓存统计
//! - GET  /api/queries     目录 id -> 描述
//! - POST /api/insights/run 非流式变体，直接返回最终结果
//!
//! 400（请求体不合法）在开流之前返回；开流之后的一切错误都走
//! in-band 的 finish 事件，HTTP 状态保持 200。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderName, StatusCode},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::NaiveDate;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agents::{DataAgent, PresentationBuilder};
use crate::cache::{CacheStats, TtlCache};
use crate::catalog::{CatalogError, QueryCatalog};
use crate::config::AppConfig;
use crate::dashboard::DashboardSpec;
use crate::executor::{QueryBackend, QueryExecutor, QueryOutcome};
use crate::intent::{IntentClassifier, RouteKind};
use crate::llm::LlmClient;
use crate::memory::{append_detached, render_context, ChatStore, Role, StoredMessage};
use crate::observability::generate_trace_id;
use crate::payload::DataPayload;
use crate::pipeline::{ConversationState, Pipeline};
use crate::stream::{sse_frame, StreamEmitter, DONE_FRAME};

/// 共享应用状态
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub backend: Arc<dyn QueryBackend>,
    pub catalog: Arc<QueryCatalog>,
    pub cache: Arc<TtlCache<QueryOutcome>>,
    pub memory: Arc<dyn ChatStore>,
    pub max_retries: u32,
    pub max_context_messages: usize,
}

/// 组装全部组件；集成测试也从这里进（换后端 / 换 LLM 即可）
pub fn build_state(
    cfg: &AppConfig,
    backend: Arc<dyn QueryBackend>,
    llm: Option<Arc<dyn LlmClient>>,
    memory: Arc<dyn ChatStore>,
) -> Result<Arc<AppState>, CatalogError> {
    let catalog = Arc::new(QueryCatalog::builtin()?);
    let executor = Arc::new(QueryExecutor::new(catalog.clone(), backend.clone()));
    let cache = Arc::new(TtlCache::new(std::time::Duration::from_secs(
        cfg.cache.ttl_seconds,
    )));

    let classifier = IntentClassifier::new(
        llm.clone(),
        cfg.pipeline.clarify_best_guess_after_prompt,
    );
    let data_agent = DataAgent::new(
        executor,
        cache.clone(),
        llm.clone(),
        cfg.pipeline.use_llm_for_query_selection,
        cfg.pipeline.query_concurrency,
    );
    let presenter = PresentationBuilder::new(llm, cfg.pipeline.use_llm_for_narrative);
    let pipeline = Arc::new(Pipeline::new(
        classifier,
        data_agent,
        presenter,
        cfg.pipeline.max_retries,
        cfg.pipeline.request_deadline_seconds,
    ));

    Ok(Arc::new(AppState {
        pipeline,
        backend,
        catalog,
        cache,
        memory,
        max_retries: cfg.pipeline.max_retries,
        max_context_messages: cfg.memory.max_context_messages,
    }))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/stream", post(chat_stream))
        .route("/api/health", get(health))
        .route("/api/queries", get(queries))
        .route("/api/insights/run", post(insights_run))
        .route("/api/cache/invalidate", post(invalidate_cache))
        .with_state(state)
}

// ============== /v1/chat/stream ==============

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<impl axum::response::IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let question = req.question.trim().to_string();
    if question.is_empty() {
        // invalid_request: 400 sin abrir stream
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "question is required" })),
        ));
    }

    let trace_id = generate_trace_id();
    let thread_id = req
        .conversation_id
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("thread-{}", trace_id));

    // 用户消息先落库（不阻塞）
    append_detached(
        state.memory.clone(),
        thread_id.clone(),
        StoredMessage::new(
            Role::User,
            question.clone(),
            serde_json::json!({ "trace_id": trace_id, "user_id": req.user_id }),
        ),
    );

    // 会话上下文
    let history = state
        .memory
        .read(&thread_id, state.max_context_messages)
        .await
        .unwrap_or_default();
    let previous_was_clarification = history
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .map(|m| m.metadata.get("kind").and_then(|v| v.as_str()) == Some("clarification"))
        .unwrap_or(false);
    let chat_context = render_context(&history);

    let mut conv = ConversationState::new(
        question,
        thread_id.clone(),
        trace_id.clone(),
        state.max_retries,
    );
    conv.chat_context = chat_context;
    conv.previous_was_clarification = previous_was_clarification;

    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let emitter = StreamEmitter::new(tx, cancel.clone(), &trace_id);

    let pipeline = state.pipeline.clone();
    let memory = state.memory.clone();
    tokio::spawn(async move {
        let reason = pipeline.run(&mut conv, &emitter, &cancel).await;
        tracing::info!(
            trace_id = %conv.trace_id,
            steps = conv.agent_steps.len(),
            reason = ?reason,
            "chat stream finished"
        );

        // 助手回复落库（conclusion o respuesta directa）
        let decision_kind = conv.routing_decision.as_ref().map(|d| d.kind);
        let content = conv
            .dashboard_spec
            .as_ref()
            .and_then(|s| s.conclusion.clone())
            .or_else(|| {
                conv.routing_decision
                    .as_ref()
                    .and_then(|d| d.direct_answer.clone())
            });
        if let Some(content) = content {
            let kind = match decision_kind {
                Some(RouteKind::Clarification) => "clarification",
                Some(RouteKind::Conversational) => "conversational",
                _ => "insight",
            };
            append_detached(
                memory,
                conv.thread_id.clone(),
                StoredMessage::new(
                    Role::Assistant,
                    content,
                    serde_json::json!({ "trace_id": conv.trace_id, "kind": kind }),
                ),
            );
        }
    });

    // mpsc -> SSE 帧；通道关闭后补 [DONE] 终止行
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|ev| (Bytes::from(sse_frame(&ev)), rx))
    })
    .chain(futures_util::stream::once(async {
        Bytes::from(DONE_FRAME)
    }))
    .map(Ok::<_, std::convert::Infallible>);

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache, no-transform"),
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
            (
                HeaderName::from_static("x-vercel-ai-ui-message-stream"),
                "v1",
            ),
        ],
        Body::from_stream(stream),
    ))
}

// ============== /api/health ==============

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    database_status: &'static str,
    cache: CacheStats,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let db_ok = state.backend.ping().await;
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        database_status: if db_ok { "connected" } else { "disconnected" },
        cache: state.cache.stats(),
    })
}

// ============== /api/queries ==============

#[derive(Debug, Serialize)]
struct QueriesResponse {
    queries: BTreeMap<String, String>,
}

async fn queries(State(state): State<Arc<AppState>>) -> Json<QueriesResponse> {
    let queries = state
        .catalog
        .descriptions()
        .into_iter()
        .map(|(id, desc)| (id.to_string(), desc.to_string()))
        .collect();
    Json(QueriesResponse { queries })
}

// ============== /api/cache/invalidate ==============

/// 运维用的手动失效钩子；不做更细粒度的失效策略
async fn invalidate_cache(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.cache.clear();
    tracing::info!("result cache cleared by operator");
    Json(serde_json::json!({ "cleared": true }))
}

// ============== /api/insights/run ==============

#[derive(Debug, Deserialize)]
pub struct InsightRequest {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub date_from: Option<NaiveDate>,
    #[serde(default)]
    pub date_to: Option<NaiveDate>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InsightResponse {
    pub success: bool,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashboard_spec: Option<DashboardSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_payload: Option<DataPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: f64,
}

async fn insights_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InsightRequest>,
) -> Result<Json<InsightResponse>, (StatusCode, Json<serde_json::Value>)> {
    let question = req.question.trim().to_string();
    if question.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "question is required" })),
        ));
    }

    let trace_id = generate_trace_id();
    let thread_id = req
        .conversation_id
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("thread-{}", trace_id));

    let mut conv =
        ConversationState::new(question, thread_id, trace_id.clone(), state.max_retries);
    conv.date_from = req.date_from;
    conv.date_to = req.date_to;

    // variante sin stream: los eventos se descartan
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
    let cancel = CancellationToken::new();
    let emitter = StreamEmitter::new(tx, cancel.clone(), &trace_id);

    let started = Instant::now();
    let reason = state.pipeline.run(&mut conv, &emitter, &cancel).await;

    Ok(Json(InsightResponse {
        success: matches!(reason, crate::stream::FinishReason::Complete),
        trace_id,
        dashboard_spec: conv.dashboard_spec,
        data_payload: conv.data_payload,
        error: conv.error,
        execution_time_ms: started.elapsed().as_secs_f64() * 1000.0,
    }))
}
