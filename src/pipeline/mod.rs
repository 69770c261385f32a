//! 管线编排器：classify -> fetch_data -> (reflect <->) -> present -> end
//!
//! 状态机按阶段推进；每个阶段边界检查取消与截止时间。阶段内错误写进
//! 状态由迁移表决定去向，永远不会让流没有 finish 就断掉。reflect 是
//! 内联步骤：记录上次错误，丢弃失败的查询 id，并把日期范围放宽一天。

pub mod state;

use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use state::{AgentStep, ConversationState, StepStatus};

use crate::agents::{narrative, BuildInput, DataAgent, FetchRequest, PresentationBuilder};
use crate::dates::{describe_period, extract_date_range};
use crate::error::EngineError;
use crate::intent::{ClassifyInput, IntentClassifier, RouteKind};
use crate::stream::{FinishReason, StreamEmitter};

/// 状态机的阶段
enum Stage {
    Classify,
    FetchData,
    Reflect,
    Present,
    End(FinishReason),
}

/// 请求管线：持有全部阶段组件，本身无请求态
pub struct Pipeline {
    classifier: IntentClassifier,
    data_agent: DataAgent,
    presenter: PresentationBuilder,
    max_retries: u32,
    deadline: Duration,
}

impl Pipeline {
    pub fn new(
        classifier: IntentClassifier,
        data_agent: DataAgent,
        presenter: PresentationBuilder,
        max_retries: u32,
        deadline_seconds: u64,
    ) -> Self {
        Self {
            classifier,
            data_agent,
            presenter,
            max_retries,
            deadline: Duration::from_secs(deadline_seconds),
        }
    }

    /// 跑完一个请求：协议帧（除 [DONE] 终止行）全部由这里发出。
    /// 返回的 FinishReason 与流上的 finish 事件一致。
    pub async fn run(
        &self,
        state: &mut ConversationState,
        emitter: &StreamEmitter,
        cancel: &CancellationToken,
    ) -> FinishReason {
        emitter.start();
        emitter.trace(&state.trace_id, &state.thread_id);
        emitter.text_start();

        let today = Utc::now().date_naive();
        if let Some((from, to)) = extract_date_range(&state.question, today) {
            state.date_from = Some(from);
            state.date_to = Some(to);
            let label = describe_period(Some((from, to)));
            state.push_step("date_extraction", StepStatus::Progress, Some(label.clone()));
            emitter.step(
                "date_extraction",
                StepStatus::Progress,
                Some(format!("Periodo detectado: {}", label)),
                Some(serde_json::json!({
                    "date_from": from.format("%Y-%m-%d").to_string(),
                    "date_to": to.format("%Y-%m-%d").to_string(),
                })),
            );
        }

        let reason = self.run_stages(state, emitter, cancel).await;
        emitter.text_end();
        emitter.finish(reason);
        reason
    }

    async fn run_stages(
        &self,
        state: &mut ConversationState,
        emitter: &StreamEmitter,
        cancel: &CancellationToken,
    ) -> FinishReason {
        let today = Utc::now().date_naive();
        let deadline = Instant::now() + self.deadline;
        let mut stage = Stage::Classify;
        let mut fetch_retries = 0u32;
        let mut present_retries = 0u32;
        let mut reduced = false;

        loop {
            if cancel.is_cancelled() {
                state.error = Some("cancelled".to_string());
                return FinishReason::Cancelled;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return self.deadline_exceeded(state, emitter);
            };
            if remaining.is_zero() {
                return self.deadline_exceeded(state, emitter);
            }

            stage = match stage {
                Stage::End(reason) => return reason,

                // ============== classify ==============
                Stage::Classify => {
                    let input = ClassifyInput {
                        question: &state.question,
                        chat_context: &state.chat_context,
                        previous_was_clarification: state.previous_was_clarification,
                    };
                    let decision =
                        match tokio::time::timeout(remaining, self.classifier.classify(&input))
                            .await
                        {
                            Ok(d) => d,
                            Err(_) => return self.deadline_exceeded(state, emitter),
                        };

                    let summary = format!(
                        "{} / {}",
                        route_kind_str(decision.kind),
                        decision.domain.as_str()
                    );
                    state.push_step("classify", StepStatus::Done, Some(summary.clone()));
                    emitter.step(
                        "classify",
                        StepStatus::Done,
                        Some(summary),
                        Some(serde_json::json!({
                            "confidence": decision.confidence,
                            "rationale": decision.rationale,
                        })),
                    );

                    let kind = decision.kind;
                    let answer = decision.direct_answer.clone();
                    state.routing_decision = Some(decision);

                    match kind {
                        RouteKind::Conversational | RouteKind::Clarification => {
                            if let Some(text) = answer {
                                emitter.text_delta(&text);
                            }
                            Stage::End(FinishReason::Complete)
                        }
                        RouteKind::DataOnly | RouteKind::Dashboard => Stage::FetchData,
                    }
                }

                // ============== fetch_data ==============
                Stage::FetchData => {
                    state.push_step("fetch_data", StepStatus::Start, None);
                    emitter.step(
                        "fetch_data",
                        StepStatus::Start,
                        Some("Ejecutando consultas del catalogo".to_string()),
                        None,
                    );

                    let question = state.question.clone();
                    let chat_context = state.chat_context.clone();
                    let avoid = state.avoid_query_ids.clone();
                    let decision = state.routing_decision.clone().expect("classify ran first");
                    let req = FetchRequest {
                        question: &question,
                        date_from: state.effective_date_from(),
                        date_to: state.date_to,
                        chat_context: &chat_context,
                        decision: &decision,
                        avoid_query_ids: &avoid,
                        today,
                    };

                    let result =
                        match tokio::time::timeout(remaining, self.data_agent.fetch(&req, cancel))
                            .await
                        {
                            Ok(r) => r,
                            Err(_) => return self.deadline_exceeded(state, emitter),
                        };

                    match result {
                        Ok((payload, plan, reports)) => {
                            let mut failed_ids = Vec::new();
                            for report in &reports {
                                let step_name = format!("query:{}", report.query_id);
                                match &report.error {
                                    Some(err) => {
                                        failed_ids.push(report.query_id.clone());
                                        state.push_step(
                                            &step_name,
                                            StepStatus::Error,
                                            Some(err.clone()),
                                        );
                                        emitter.step(
                                            &step_name,
                                            StepStatus::Error,
                                            Some(err.clone()),
                                            None,
                                        );
                                    }
                                    None => {
                                        let msg = format!(
                                            "{} filas{}",
                                            report.rows,
                                            if report.from_cache { " (cache)" } else { "" }
                                        );
                                        state.push_step(
                                            &step_name,
                                            StepStatus::Progress,
                                            Some(msg.clone()),
                                        );
                                        emitter.step(
                                            &step_name,
                                            StepStatus::Progress,
                                            Some(msg),
                                            None,
                                        );
                                    }
                                }
                            }
                            state.avoid_query_ids = failed_ids;

                            let refs = payload.available_refs.len();
                            state.push_step(
                                "fetch_data",
                                StepStatus::Done,
                                Some(format!("{} refs", refs)),
                            );
                            emitter.step(
                                "fetch_data",
                                StepStatus::Done,
                                Some(format!("{} refs disponibles", refs)),
                                Some(serde_json::json!({
                                    "selection": plan.source,
                                    "query_ids": plan.query_ids,
                                })),
                            );

                            let dashboard = matches!(
                                state.routing_decision.as_ref().map(|d| d.kind),
                                Some(RouteKind::Dashboard)
                            );
                            if dashboard {
                                state.data_payload = Some(payload);
                                Stage::Present
                            } else {
                                // data_only: payload + conclusion textual, sin dashboard
                                let label = self.period_label(state);
                                let (_, conclusion) =
                                    narrative::build_deterministic(&payload, &label);
                                emitter.payload(&payload);
                                emitter.text_delta(&conclusion);
                                state.data_payload = Some(payload);
                                Stage::End(FinishReason::Complete)
                            }
                        }
                        Err(EngineError::Cancelled) => {
                            state.error = Some("cancelled".to_string());
                            Stage::End(FinishReason::Cancelled)
                        }
                        Err(e) => {
                            state.error = Some(e.to_string());
                            state.push_step("fetch_data", StepStatus::Error, Some(e.to_string()));
                            emitter.step(
                                "fetch_data",
                                StepStatus::Error,
                                Some(e.to_string()),
                                None,
                            );

                            if fetch_retries < self.max_retries {
                                fetch_retries += 1;
                                state.retry_count = fetch_retries;
                                Stage::Reflect
                            } else {
                                emitter.text_delta(
                                    "No pude obtener datos para tu consulta. Intenta de nuevo en unos minutos.",
                                );
                                Stage::End(FinishReason::Error)
                            }
                        }
                    }
                }

                // ============== reflect ==============
                Stage::Reflect => {
                    let detail = state.error.clone();
                    state.widen_days += 1;
                    state.push_step("reflect", StepStatus::Progress, detail.clone());
                    emitter.step(
                        "reflect",
                        StepStatus::Progress,
                        Some("Ajustando estrategia y reintentando".to_string()),
                        detail.map(|d| serde_json::json!({ "last_error": d })),
                    );
                    Stage::FetchData
                }

                // ============== present ==============
                Stage::Present => {
                    let question = state.question.clone();
                    let payload = state.data_payload.clone().expect("fetch ran first");
                    let label = self.period_label(state);
                    let input = BuildInput {
                        question: &question,
                        payload: &payload,
                        period_label: &label,
                        date_range: state.effective_date_from().zip(state.date_to),
                        reduced,
                    };

                    let built =
                        match tokio::time::timeout(remaining, self.presenter.build(&input)).await {
                            Ok(r) => r,
                            Err(_) => return self.deadline_exceeded(state, emitter),
                        };

                    match built {
                        Ok(spec) => {
                            state.push_step("present", StepStatus::Done, Some(spec.title.clone()));
                            emitter.step(
                                "present",
                                StepStatus::Done,
                                Some(spec.title.clone()),
                                None,
                            );
                            // data-dashboard SIEMPRE antes que data-payload
                            emitter.dashboard(&spec);
                            emitter.payload(&payload);
                            if let Some(conclusion) = &spec.conclusion {
                                emitter.text_delta(conclusion);
                            }
                            state.dashboard_spec = Some(spec);
                            Stage::End(FinishReason::Complete)
                        }
                        Err(e) => {
                            state.error = Some(e.to_string());
                            state.push_step("present", StepStatus::Error, Some(e.to_string()));
                            emitter.step("present", StepStatus::Error, Some(e.to_string()), None);

                            if present_retries < self.max_retries {
                                present_retries += 1;
                                state.retry_count = present_retries;
                                reduced = true;
                                Stage::Reflect
                            } else {
                                // resultado parcial: solo payload
                                let (_, conclusion) =
                                    narrative::build_deterministic(&payload, &label);
                                emitter.payload(&payload);
                                emitter.text_delta(&conclusion);
                                Stage::End(FinishReason::Complete)
                            }
                        }
                    }
                }
            };
        }
    }

    fn period_label(&self, state: &ConversationState) -> String {
        describe_period(state.effective_date_from().zip(state.date_to))
    }

    fn deadline_exceeded(
        &self,
        state: &mut ConversationState,
        emitter: &StreamEmitter,
    ) -> FinishReason {
        state.error = Some("request deadline exceeded".to_string());
        state.push_step("deadline", StepStatus::Error, None);
        emitter.step(
            "deadline",
            StepStatus::Error,
            Some("La consulta supero el tiempo limite".to_string()),
            None,
        );
        emitter.text_delta("La consulta supero el tiempo limite. Intenta con un rango mas chico.");
        FinishReason::Error
    }
}

fn route_kind_str(kind: RouteKind) -> &'static str {
    match kind {
        RouteKind::Conversational => "conversational",
        RouteKind::DataOnly => "data_only",
        RouteKind::Dashboard => "dashboard",
        RouteKind::Clarification => "clarification",
    }
}
