//! 组件装配：从配置与数据库构建编排器及其依赖
//!
//! HTTP 服务与集成测试共用同一套装配逻辑；后端可替换（测试注入脚本化后端）。

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::{AgentOrchestrator, ConfirmationManager};
use crate::llm::{MockBackend, OpenAiBackend, ReasoningBackend, RetryExecutor, RetryPolicy, DEEPSEEK_BASE_URL};
use crate::memory::{ContextReconstructor, ConversationStore, Database, SqliteConversationStore};
use crate::tools::{AuditLedger, Dispatcher, SqliteTaskStore, TaskStore, ToolRegistry};

/// 根据配置与环境变量选择推理后端；没有可用的 API Key 时回退到 Mock
pub fn create_backend_from_config(cfg: &AppConfig, registry: &ToolRegistry) -> Arc<dyn ReasoningBackend> {
    let provider = cfg.llm.provider.to_lowercase();
    let schema = registry.to_schema_json();

    if provider == "mock" {
        tracing::info!("Using mock reasoning backend");
        return Arc::new(MockBackend);
    }

    let deepseek_key = std::env::var("DEEPSEEK_API_KEY").ok();
    let openai_key = std::env::var("OPENAI_API_KEY").ok();

    match (provider.as_str(), deepseek_key, openai_key) {
        ("deepseek", Some(key), _) | ("deepseek", None, Some(key)) => {
            let base = cfg.llm.base_url.as_deref().unwrap_or(DEEPSEEK_BASE_URL);
            tracing::info!("Using DeepSeek backend ({})", cfg.llm.model);
            Arc::new(OpenAiBackend::new(Some(base), &cfg.llm.model, &key, &schema))
        }
        (_, _, Some(key)) if provider != "deepseek" => {
            tracing::info!("Using OpenAI-compatible backend ({})", cfg.llm.model);
            Arc::new(OpenAiBackend::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                &key,
                &schema,
            ))
        }
        _ => {
            tracing::warn!("No API key set or provider unknown, using mock reasoning backend");
            Arc::new(MockBackend)
        }
    }
}

/// 构建好的组件；Clone 只复制句柄
#[derive(Clone)]
pub struct AppComponents {
    pub config: Arc<AppConfig>,
    pub orchestrator: Arc<AgentOrchestrator>,
}

impl AppComponents {
    pub fn dispatcher(&self) -> &Dispatcher {
        self.orchestrator.dispatcher()
    }
}

/// 组件构建器
pub struct AgentBuilder {
    config: AppConfig,
    db: Database,
    backend: Option<Arc<dyn ReasoningBackend>>,
    tasks: Option<Arc<dyn TaskStore>>,
}

impl AgentBuilder {
    pub fn new(config: AppConfig, db: Database) -> Self {
        Self {
            config,
            db,
            backend: None,
            tasks: None,
        }
    }

    /// 指定推理后端（默认按配置选择）
    pub fn with_backend(mut self, backend: Arc<dyn ReasoningBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// 指定任务存储（默认使用同一数据库的 SqliteTaskStore）
    pub fn with_task_store(mut self, tasks: Arc<dyn TaskStore>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn build_tool_registry(&self) -> ToolRegistry {
        ToolRegistry::with_task_tools().with_destructive(&self.config.tools.destructive)
    }

    pub fn build(self) -> AppComponents {
        let registry = Arc::new(self.build_tool_registry());
        let backend = self
            .backend
            .unwrap_or_else(|| create_backend_from_config(&self.config, &registry));
        let tasks: Arc<dyn TaskStore> = match self.tasks {
            Some(tasks) => tasks,
            None => Arc::new(SqliteTaskStore::new(self.db.clone())),
        };

        let ledger = AuditLedger::new(self.db.clone());
        let confirmations = ConfirmationManager::new(
            self.db.clone(),
            ledger.clone(),
            Duration::from_secs(self.config.confirmation.ttl_secs),
        );
        let dispatcher = Arc::new(Dispatcher::new(registry, tasks, confirmations, ledger));

        let conversations: Arc<dyn ConversationStore> =
            Arc::new(SqliteConversationStore::new(self.db.clone()));
        let reconstructor = ContextReconstructor::from_config(conversations.clone(), &self.config);
        let executor = RetryExecutor::new(backend, RetryPolicy::from_config(&self.config));

        let orchestrator = AgentOrchestrator::new(
            conversations,
            reconstructor,
            executor,
            dispatcher,
            Duration::from_secs(self.config.llm.timeouts.total),
        );

        AppComponents {
            config: Arc::new(self.config),
            orchestrator: Arc::new(orchestrator),
        }
    }
}
