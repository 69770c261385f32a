//! 流式事件协议：AI SDK 数据流格式
//!
//! 与现有客户端的线约定，事件名与顺序都不能动：
//! `start` -> `text-start` -> (`data-*` | `text-delta`)* -> `text-end` ->
//! `finish`，终止行固定为 `data: [DONE]`。data-dashboard 必须先于
//! data-payload（客户端靠这个先建视图再绑数据）。
//!
//! 发送端只往 mpsc 写；对端掉线时发送失败，借此触发取消令牌，
//! 让在途阶段在下一个边界退出（取消传播）。

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dashboard::DashboardSpec;
use crate::payload::DataPayload;
use crate::pipeline::StepStatus;

/// 终止行（最后一帧）
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// finish 事件的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Complete,
    Error,
    Cancelled,
}

/// data-trace 的载荷
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceData {
    pub trace_id: String,
    pub request_id: String,
    pub ts: String,
}

/// data-agent_step 的载荷
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentStepData {
    pub step: String,
    pub status: StepStatus,
    pub ts: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<serde_json::Value>,
}

/// 线上事件；type 字段为协议约定的判别值
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "start")]
    Start {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    #[serde(rename = "text-start")]
    TextStart {
        #[serde(rename = "textId")]
        text_id: String,
    },
    #[serde(rename = "text-delta")]
    TextDelta {
        #[serde(rename = "textId")]
        text_id: String,
        delta: String,
    },
    #[serde(rename = "text-end")]
    TextEnd {
        #[serde(rename = "textId")]
        text_id: String,
    },
    #[serde(rename = "data-trace")]
    Trace { data: TraceData },
    #[serde(rename = "data-agent_step")]
    AgentStep { data: AgentStepData },
    #[serde(rename = "data-dashboard")]
    Dashboard { data: DashboardSpec },
    #[serde(rename = "data-payload")]
    Payload { data: DataPayload },
    #[serde(rename = "finish")]
    Finish {
        #[serde(rename = "finishReason")]
        finish_reason: FinishReason,
        #[serde(rename = "messageId")]
        message_id: String,
    },
}

/// 一个事件 -> 一帧 SSE 文本行
pub fn sse_frame(event: &StreamEvent) -> String {
    // 事件都是已知可序列化类型，失败只可能是编程错误
    format!(
        "data: {}\n\n",
        serde_json::to_string(event).expect("stream event serializes")
    )
}

/// 请求级发送端：保证 id 一致性，掉线时触发取消
pub struct StreamEmitter {
    tx: mpsc::UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
    message_id: String,
    text_id: String,
}

impl StreamEmitter {
    pub fn new(
        tx: mpsc::UnboundedSender<StreamEvent>,
        cancel: CancellationToken,
        trace_id: &str,
    ) -> Self {
        Self {
            tx,
            cancel,
            message_id: format!("msg-{}", trace_id),
            text_id: format!("text-{}", trace_id),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    fn send(&self, event: StreamEvent) {
        if self.tx.send(event).is_err() {
            // 接收端没了 = 客户端断开：取消在途工作
            self.cancel.cancel();
        }
    }

    pub fn start(&self) {
        self.send(StreamEvent::Start {
            message_id: self.message_id.clone(),
        });
    }

    pub fn trace(&self, trace_id: &str, request_id: &str) {
        self.send(StreamEvent::Trace {
            data: TraceData {
                trace_id: trace_id.to_string(),
                request_id: request_id.to_string(),
                ts: chrono::Utc::now().to_rfc3339(),
            },
        });
    }

    pub fn text_start(&self) {
        self.send(StreamEvent::TextStart {
            text_id: self.text_id.clone(),
        });
    }

    pub fn text_delta(&self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        self.send(StreamEvent::TextDelta {
            text_id: self.text_id.clone(),
            delta: delta.to_string(),
        });
    }

    pub fn text_end(&self) {
        self.send(StreamEvent::TextEnd {
            text_id: self.text_id.clone(),
        });
    }

    pub fn step(
        &self,
        step: &str,
        status: StepStatus,
        message: Option<String>,
        detail: Option<serde_json::Value>,
    ) {
        self.send(StreamEvent::AgentStep {
            data: AgentStepData {
                step: step.to_string(),
                status,
                ts: chrono::Utc::now().to_rfc3339(),
                message,
                detail,
            },
        });
    }

    pub fn dashboard(&self, spec: &DashboardSpec) {
        self.send(StreamEvent::Dashboard { data: spec.clone() });
    }

    pub fn payload(&self, payload: &DataPayload) {
        self.send(StreamEvent::Payload {
            data: payload.clone(),
        });
    }

    pub fn finish(&self, reason: FinishReason) {
        self.send(StreamEvent::Finish {
            finish_reason: reason,
            message_id: self.message_id.clone(),
        });
    }
}
