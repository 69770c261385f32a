//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `FARO__*` 覆盖（双下划线表示嵌套，
//! 如 `FARO__PIPELINE__MAX_RETRIES=5`）。历史上功能开关存在两套大小写混用的
//! 环境变量命名，这里统一收敛到单一前缀。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub memory: MemorySection,
}

/// [server] 段：监听端口
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// [database] 段：连接串与查询超时
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSection {
    /// 未设置时从 DATABASE_URL 环境变量读取
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// 单条目录查询超时（秒）
    #[serde(default = "default_query_timeout")]
    pub query_timeout_seconds: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_query_timeout() -> u64 {
    30
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            query_timeout_seconds: default_query_timeout(),
        }
    }
}

/// [llm] 段：主后端、可选 fallback 与超时
///
/// API Key 从环境变量读取（OPENAI_API_KEY / FARO_LLM_API_KEY），不进配置文件。
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 限流时切换到的备用模型（OpenAI 兼容端点）
    pub fallback_model: Option<String>,
    pub fallback_base_url: Option<String>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_timeout() -> u64 {
    60
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            fallback_model: None,
            fallback_base_url: None,
            timeout_seconds: default_llm_timeout(),
        }
    }
}

/// [pipeline] 段：重试、截止时间、并发与功能开关
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    /// 单阶段最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 整个请求的墙钟截止时间（秒），超时强制 finish(error)
    #[serde(default = "default_request_deadline")]
    pub request_deadline_seconds: u64,
    /// 目录查询并发上限（单次选择上限为 3，默认与之对齐）
    #[serde(default = "default_query_concurrency")]
    pub query_concurrency: usize,
    /// 歧义问题是否交给 LLM 选择查询
    #[serde(default)]
    pub use_llm_for_query_selection: bool,
    /// 叙事是否交给 LLM 生成（默认走确定性路径）
    #[serde(default)]
    pub use_llm_for_narrative: bool,
    /// 上一轮已经追问过澄清时，本轮按最佳猜测继续而不是再次追问
    #[serde(default = "default_clarify_best_guess")]
    pub clarify_best_guess_after_prompt: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_deadline() -> u64 {
    180
}

fn default_query_concurrency() -> usize {
    3
}

fn default_clarify_best_guess() -> bool {
    true
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            request_deadline_seconds: default_request_deadline(),
            query_concurrency: default_query_concurrency(),
            use_llm_for_query_selection: false,
            use_llm_for_narrative: false,
            clarify_best_guess_after_prompt: default_clarify_best_guess(),
        }
    }
}

/// [cache] 段：结果缓存 TTL
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
}

fn default_cache_ttl() -> u64 {
    900
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            ttl_seconds: default_cache_ttl(),
        }
    }
}

/// [memory] 段：会话记忆后端
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    /// postgres / memory
    #[serde(default = "default_memory_backend")]
    pub backend: String,
    /// 注入 prompt 的最近消息条数上限
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,
}

fn default_memory_backend() -> String {
    "memory".to_string()
}

fn default_max_context_messages() -> usize {
    10
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            max_context_messages: default_max_context_messages(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 FARO__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 FARO__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("FARO")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_app_config() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 8000);
        assert_eq!(cfg.pipeline.max_retries, 3);
        assert_eq!(cfg.pipeline.query_concurrency, 3);
        assert_eq!(cfg.cache.ttl_seconds, 900);
        assert!(!cfg.pipeline.use_llm_for_query_selection);
        assert!(!cfg.pipeline.use_llm_for_narrative);
    }

    #[test]
    fn test_timeout_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.pipeline.request_deadline_seconds, 180);
        assert_eq!(cfg.database.query_timeout_seconds, 30);
        assert_eq!(cfg.llm.timeout_seconds, 60);
    }
}
