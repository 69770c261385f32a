//! Faro - 对话式分析引擎
//!
//! 自然语言问题 -> 安全 SQL 目录 -> 类型化数据包 -> 看板 + 叙事，
//! 全程经单条长连接 HTTP 响应流式推送。模块划分：
//! - **catalog**: 只读查询目录（引擎可执行 SQL 的唯一来源）
//! - **executor**: 参数规范化与目录模板的安全执行
//! - **cache**: (query_id, 规范化参数) 键入的 TTL 结果缓存
//! - **intent**: 关键词优先、LLM 兜底的意图分类
//! - **agents**: 数据代理（选择 + 执行 + 组装）与看板构建（结构 + 叙事）
//! - **pipeline**: 阶段状态机（classify -> fetch -> reflect -> present）
//! - **stream**: 流式事件协议（线约定，勿动事件名与顺序）
//! - **memory**: 按 thread 的会话记忆
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / 主备 / Mock）
//! - **server**: axum HTTP 入口

pub mod agents;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod dashboard;
pub mod dates;
pub mod error;
pub mod executor;
pub mod intent;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod payload;
pub mod pipeline;
pub mod server;
pub mod stream;
