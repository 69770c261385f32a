//! 会话记忆：按 thread_id 读写短期对话历史
//!
//! 写入不允许阻塞管线主路径：`append_detached` 在后台任务里落库，
//! 失败只记日志。后端二选一：Postgres（持久化）或进程内 HashMap（尽力而为）。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::RwLock;

use crate::error::EngineError;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    fn parse(s: &str) -> Role {
        match s {
            "assistant" => Role::Assistant,
            "system" => Role::System,
            _ => Role::User,
        }
    }
}

/// 单条消息（prompt 构造与持久化共用）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 已存储的消息：消息体 + 元数据 + 写入时间
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn new(role: Role, content: impl Into<String>, metadata: serde_json::Value) -> Self {
        Self {
            role,
            content: content.into(),
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// 会话记忆后端：append 持久化一条消息，read 取最近 N 条（按时间正序）
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn append(&self, thread_id: &str, msg: StoredMessage) -> Result<(), EngineError>;

    async fn read(&self, thread_id: &str, max_messages: usize)
        -> Result<Vec<StoredMessage>, EngineError>;
}

/// 后台写入：不等待结果，失败只 warn（记忆不可用时管线照常工作）
pub fn append_detached(store: Arc<dyn ChatStore>, thread_id: String, msg: StoredMessage) {
    tokio::spawn(async move {
        if let Err(e) = store.append(&thread_id, msg).await {
            tracing::warn!(thread_id = %thread_id, "chat memory write failed: {}", e);
        }
    });
}

/// 渲染最近对话为纯文本转录，供 prompt 注入
pub fn render_context(messages: &[StoredMessage]) -> String {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let label = match m.role {
                Role::User => "Usuario",
                _ => "Asistente",
            };
            format!("{}: {}", label, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// 进程内记忆：HashMap<thread_id, Vec<StoredMessage>>，重启即失
#[derive(Default)]
pub struct InMemoryChatStore {
    threads: RwLock<HashMap<String, Vec<StoredMessage>>>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn append(&self, thread_id: &str, msg: StoredMessage) -> Result<(), EngineError> {
        let mut threads = self.threads.write().await;
        threads.entry(thread_id.to_string()).or_default().push(msg);
        Ok(())
    }

    async fn read(
        &self,
        thread_id: &str,
        max_messages: usize,
    ) -> Result<Vec<StoredMessage>, EngineError> {
        let threads = self.threads.read().await;
        let msgs = threads.get(thread_id).cloned().unwrap_or_default();
        let start = msgs.len().saturating_sub(max_messages);
        Ok(msgs[start..].to_vec())
    }
}

/// Postgres 记忆：chat_messages 表，首次使用时建表
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    pub async fn new(pool: PgPool) -> Result<Self, EngineError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chat_messages (
                id BIGSERIAL PRIMARY KEY,
                thread_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| EngineError::Memory(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chat_messages_thread
                 ON chat_messages(thread_id, created_at)",
        )
        .execute(&pool)
        .await
        .map_err(|e| EngineError::Memory(e.to_string()))?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn append(&self, thread_id: &str, msg: StoredMessage) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO chat_messages (thread_id, role, content, metadata, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(thread_id)
        .bind(msg.role.as_str())
        .bind(&msg.content)
        .bind(&msg.metadata)
        .bind(msg.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Memory(e.to_string()))?;
        Ok(())
    }

    async fn read(
        &self,
        thread_id: &str,
        max_messages: usize,
    ) -> Result<Vec<StoredMessage>, EngineError> {
        let rows = sqlx::query(
            "SELECT role, content, metadata, created_at FROM chat_messages
             WHERE thread_id = $1
             ORDER BY created_at DESC
             LIMIT $2",
        )
        .bind(thread_id)
        .bind(max_messages as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Memory(e.to_string()))?;

        let mut msgs: Vec<StoredMessage> = rows
            .iter()
            .map(|row| StoredMessage {
                role: Role::parse(row.get::<String, _>("role").as_str()),
                content: row.get("content"),
                metadata: row.get("metadata"),
                created_at: row.get("created_at"),
            })
            .collect();
        msgs.reverse();
        Ok(msgs)
    }
}
