//! 可观测性：tracing 初始化与请求级 trace id
//!
//! 每个请求分配一个短 trace id（uuid 前 8 位），写入日志 span 并通过
//! data-trace 事件回传给客户端，便于前后端对账。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();
}

/// 生成新的请求 trace id（短格式，uuid 前 8 位）
pub fn generate_trace_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}
