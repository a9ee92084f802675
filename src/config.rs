//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TASKMATE__*` 覆盖（双下划线表示嵌套，如 `TASKMATE__RETRY__MAX_ATTEMPTS=5`）。
//! 配置在启动后不可变，是跨请求共享的唯一状态。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::AgentError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub server: ServerSection,
    pub storage: StorageSection,
    pub llm: LlmSection,
    pub retry: RetrySection,
    pub confirmation: ConfirmationSection,
    pub context: ContextSection,
    pub tools: ToolsSection,
    pub audit: AuditSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [server] 段：HTTP 监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

/// [storage] 段：SQLite 文件路径与连接池大小
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/taskmate.db")
}

fn default_max_connections() -> u32 {
    5
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock；未设置 API Key 时回退到 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次后端调用超时（秒），超时按瞬时错误重试
    #[serde(default = "default_request_timeout")]
    pub request: u64,
    /// 单个聊天请求内后端调用（含重试）的总超时（秒）
    #[serde(default = "default_total_timeout")]
    pub total: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
            total: default_total_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

fn default_total_timeout() -> u64 {
    150
}

/// [retry] 段：后端调用的重试策略
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 抖动比例 0.0–1.0
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_jitter_factor() -> f64 {
    0.2
}

/// [confirmation] 段：破坏性操作待确认的有效期
#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmationSection {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for ConfirmationSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    300
}

/// [context] 段：上下文重建的 token 预算
#[derive(Debug, Clone, Deserialize)]
pub struct ContextSection {
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    /// 合成摘要消息的最大字符数
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            summary_max_chars: default_summary_max_chars(),
        }
    }
}

fn default_max_context_tokens() -> usize {
    2000
}

fn default_summary_max_chars() -> usize {
    800
}

/// [tools] 段：哪些工具属于破坏性操作（需用户确认）
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_destructive_tools")]
    pub destructive: Vec<String>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            destructive: default_destructive_tools(),
        }
    }
}

fn default_destructive_tools() -> Vec<String> {
    vec!["delete_task".into()]
}

/// [audit] 段：审计查询分页与异常判定阈值
#[derive(Debug, Clone, Deserialize)]
pub struct AuditSection {
    #[serde(default = "default_audit_limit")]
    pub default_limit: u32,
    #[serde(default = "default_audit_max_limit")]
    pub max_limit: u32,
    /// attempted 状态停留超过该秒数即视为异常
    #[serde(default = "default_anomaly_after_secs")]
    pub anomaly_after_secs: u64,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            default_limit: default_audit_limit(),
            max_limit: default_audit_max_limit(),
            anomaly_after_secs: default_anomaly_after_secs(),
        }
    }
}

fn default_audit_limit() -> u32 {
    50
}

fn default_audit_max_limit() -> u32 {
    500
}

fn default_anomaly_after_secs() -> u64 {
    300
}

/// 从 config 目录加载配置，环境变量 TASKMATE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TASKMATE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, AgentError> {
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
        config::Environment::with_prefix("TASKMATE")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("tools.destructive"),
    );

    let c = builder.build()?;
    Ok(c.try_deserialize()?)
}
