//! 集成测试共用装配：demo 后端 + 可选 mock LLM + 事件收集

#![allow(dead_code)]

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use faro::config::AppConfig;
use faro::executor::DemoBackend;
use faro::llm::LlmClient;
use faro::memory::InMemoryChatStore;
use faro::pipeline::ConversationState;
use faro::server::{build_state, AppState};
use faro::stream::{FinishReason, StreamEmitter, StreamEvent};

pub struct RunResult {
    pub events: Vec<StreamEvent>,
    pub reason: FinishReason,
    pub state: ConversationState,
}

pub fn make_state(
    backend: DemoBackend,
    llm: Option<Arc<dyn LlmClient>>,
    cfg: AppConfig,
) -> Arc<AppState> {
    build_state(
        &cfg,
        Arc::new(backend),
        llm,
        Arc::new(InMemoryChatStore::new()),
    )
    .expect("builtin catalog loads")
}

pub fn default_state() -> Arc<AppState> {
    make_state(DemoBackend::new(), None, AppConfig::default())
}

/// 跑一个问题并收集全部事件（管线结束后 drain 通道）
pub async fn run_question(state: &AppState, question: &str) -> RunResult {
    run_question_with_cancel(state, question, CancellationToken::new()).await
}

pub async fn run_question_with_cancel(
    state: &AppState,
    question: &str,
    cancel: CancellationToken,
) -> RunResult {
    let trace_id = "abc12345";
    let mut conv = ConversationState::new(question, "t-test", trace_id, state.max_retries);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let emitter = StreamEmitter::new(tx, cancel.clone(), trace_id);
    let reason = state.pipeline.run(&mut conv, &emitter, &cancel).await;
    drop(emitter);

    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }

    RunResult {
        events,
        reason,
        state: conv,
    }
}

impl RunResult {
    pub fn count<F: Fn(&StreamEvent) -> bool>(&self, pred: F) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }

    pub fn position<F: Fn(&StreamEvent) -> bool>(&self, pred: F) -> Option<usize> {
        self.events.iter().position(pred)
    }

    pub fn agent_steps(&self) -> Vec<&faro::stream::AgentStepData> {
        self.events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::AgentStep { data } => Some(data),
                _ => None,
            })
            .collect()
    }

    pub fn dashboard(&self) -> Option<&faro::dashboard::DashboardSpec> {
        self.events.iter().find_map(|e| match e {
            StreamEvent::Dashboard { data } => Some(data),
            _ => None,
        })
    }

    pub fn payload(&self) -> Option<&faro::payload::DataPayload> {
        self.events.iter().find_map(|e| match e {
            StreamEvent::Payload { data } => Some(data),
            _ => None,
        })
    }

    pub fn full_text(&self) -> String {
        self.events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextDelta { delta, .. } => Some(delta.as_str()),
                _ => None,
            })
            .collect()
    }
}
