//! 会话状态：单个请求的全部工作记忆
//!
//! 一个普通记录体，按请求创建、贯穿各阶段、到终态后不再修改，
//! 绝不跨请求共享。阶段轨迹（agent_steps）随状态走，错误也记在这里，
//! 由状态机决定下一个迁移。

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::dashboard::DashboardSpec;
use crate::intent::RoutingDecision;
use crate::payload::DataPayload;

/// 阶段事件状态（线上 data-agent_step.status 的取值）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Start,
    Progress,
    Done,
    Error,
}

/// 一条阶段轨迹
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    pub stage: String,
    pub status: StepStatus,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<String>,
}

/// 请求级会话状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    // 输入
    pub question: String,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub chat_context: String,
    pub thread_id: String,
    pub trace_id: String,
    /// 上一轮助手消息是否为澄清追问
    pub previous_was_clarification: bool,

    // 中间产物
    pub routing_decision: Option<RoutingDecision>,
    pub data_payload: Option<DataPayload>,
    pub dashboard_spec: Option<DashboardSpec>,

    // 控制
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    /// reflect 的调整：下一轮避开的查询 id
    pub avoid_query_ids: Vec<String>,
    /// reflect 的调整：日期范围已放宽的天数
    pub widen_days: i64,
    pub agent_steps: Vec<AgentStep>,
}

impl ConversationState {
    pub fn new(
        question: impl Into<String>,
        thread_id: impl Into<String>,
        trace_id: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            question: question.into(),
            date_from: None,
            date_to: None,
            chat_context: String::new(),
            thread_id: thread_id.into(),
            trace_id: trace_id.into(),
            previous_was_clarification: false,
            routing_decision: None,
            data_payload: None,
            dashboard_spec: None,
            retry_count: 0,
            max_retries,
            error: None,
            avoid_query_ids: Vec::new(),
            widen_days: 0,
            agent_steps: Vec::new(),
        }
    }

    /// 记录一条阶段轨迹
    pub fn push_step(&mut self, stage: &str, status: StepStatus, detail: Option<String>) {
        debug_assert!(self.retry_count <= self.max_retries);
        self.agent_steps.push(AgentStep {
            stage: stage.to_string(),
            status,
            ts: Utc::now(),
            detail,
        });
    }

    /// reflect 后生效的日期范围（放宽 widen_days 天）
    pub fn effective_date_from(&self) -> Option<NaiveDate> {
        self.date_from
            .map(|d| d - chrono::Duration::days(self.widen_days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_defaults() {
        let state = ConversationState::new("como van las ventas", "t1", "abc12345", 3);
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.max_retries, 3);
        assert!(state.agent_steps.is_empty());
        assert!(state.error.is_none());
    }

    #[test]
    fn test_push_step_appends_ordered() {
        let mut state = ConversationState::new("q", "t", "tr", 3);
        state.push_step("classify", StepStatus::Done, None);
        state.push_step("fetch_data", StepStatus::Error, Some("timeout".into()));
        assert_eq!(state.agent_steps.len(), 2);
        assert_eq!(state.agent_steps[0].stage, "classify");
        assert_eq!(state.agent_steps[1].status, StepStatus::Error);
    }

    #[test]
    fn test_widened_date_range() {
        let mut state = ConversationState::new("q", "t", "tr", 3);
        state.date_from = NaiveDate::from_ymd_opt(2025, 11, 1);
        state.widen_days = 2;
        assert_eq!(
            state.effective_date_from(),
            NaiveDate::from_ymd_opt(2025, 10, 30)
        );
    }

    #[test]
    fn test_step_status_wire_values() {
        assert_eq!(
            serde_json::to_value(StepStatus::Progress).unwrap(),
            serde_json::json!("progress")
        );
        assert_eq!(
            serde_json::to_value(StepStatus::Error).unwrap(),
            serde_json::json!("error")
        );
    }
}
