//! 集成测试公共部分：临时数据库装配、记录调用的任务存储替身

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use taskmate::config::AppConfig;
use taskmate::llm::{Inference, ProposedToolCall, ReasoningBackend};
use taskmate::tools::{NewTask, Task, TaskFilter, TaskPatch, TaskStore, TaskStoreError};
use taskmate::{AgentBuilder, AppComponents, Database};

/// 任务存储的一次调用
#[derive(Debug, Clone, PartialEq)]
pub struct StoreCall {
    pub op: &'static str,
    pub user_id: String,
    pub task_id: Option<i64>,
}

/// 内存任务存储：每个用户独立编号，记录所有调用
#[derive(Default)]
pub struct FakeTaskStore {
    tasks: Mutex<HashMap<(String, i64), Task>>,
    next_id: Mutex<HashMap<String, i64>>,
    calls: Mutex<Vec<StoreCall>>,
}

impl FakeTaskStore {
    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_of(&self, op: &str) -> Vec<StoreCall> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    pub fn task(&self, user_id: &str, task_id: i64) -> Option<Task> {
        self.tasks
            .lock()
            .unwrap()
            .get(&(user_id.to_string(), task_id))
            .cloned()
    }

    fn record(&self, op: &'static str, user_id: &str, task_id: Option<i64>) {
        self.calls.lock().unwrap().push(StoreCall {
            op,
            user_id: user_id.to_string(),
            task_id,
        });
    }
}

#[async_trait]
impl TaskStore for FakeTaskStore {
    async fn create(&self, user_id: &str, task: NewTask) -> Result<Task, TaskStoreError> {
        self.record("create", user_id, None);
        let id = {
            let mut next = self.next_id.lock().unwrap();
            let id = next.entry(user_id.to_string()).or_insert(0);
            *id += 1;
            *id
        };
        let now = Utc::now();
        let task = Task {
            id,
            user_id: user_id.to_string(),
            title: task.title,
            description: task.description,
            completed: false,
            priority: task.priority,
            created_at: now,
            updated_at: now,
        };
        self.tasks
            .lock()
            .unwrap()
            .insert((user_id.to_string(), id), task.clone());
        Ok(task)
    }

    async fn update(&self, user_id: &str, task_id: i64, patch: TaskPatch) -> Result<Task, TaskStoreError> {
        self.record("update", user_id, Some(task_id));
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(&(user_id.to_string(), task_id))
            .ok_or(TaskStoreError::NotFound(task_id))?;
        if let Some(title) = patch.title {
            task.title = title;
        }
        if let Some(description) = patch.description {
            task.description = Some(description);
        }
        if let Some(priority) = patch.priority {
            task.priority = priority;
        }
        Ok(task.clone())
    }

    async fn delete(&self, user_id: &str, task_id: i64) -> Result<(), TaskStoreError> {
        self.record("delete", user_id, Some(task_id));
        self.tasks
            .lock()
            .unwrap()
            .remove(&(user_id.to_string(), task_id))
            .map(|_| ())
            .ok_or(TaskStoreError::NotFound(task_id))
    }

    async fn list(&self, user_id: &str, filter: TaskFilter) -> Result<Vec<Task>, TaskStoreError> {
        self.record("list", user_id, None);
        let tasks = self.tasks.lock().unwrap();
        let mut out: Vec<Task> = tasks
            .values()
            .filter(|t| t.user_id == user_id)
            .filter(|t| match filter {
                TaskFilter::All => true,
                TaskFilter::Pending => !t.completed,
                TaskFilter::Completed => t.completed,
            })
            .cloned()
            .collect();
        out.sort_by_key(|t| t.id);
        Ok(out)
    }

    async fn set_completed(&self, user_id: &str, task_id: i64, completed: bool) -> Result<Task, TaskStoreError> {
        self.record("set_completed", user_id, Some(task_id));
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(&(user_id.to_string(), task_id))
            .ok_or(TaskStoreError::NotFound(task_id))?;
        task.completed = completed;
        Ok(task.clone())
    }
}

/// 副作用永远不返回的任务存储（模拟执行途中崩溃）
#[derive(Default)]
pub struct HangingTaskStore;

#[async_trait]
impl TaskStore for HangingTaskStore {
    async fn create(&self, _user_id: &str, _task: NewTask) -> Result<Task, TaskStoreError> {
        std::future::pending().await
    }

    async fn update(&self, _user_id: &str, _task_id: i64, _patch: TaskPatch) -> Result<Task, TaskStoreError> {
        std::future::pending().await
    }

    async fn delete(&self, _user_id: &str, _task_id: i64) -> Result<(), TaskStoreError> {
        std::future::pending().await
    }

    async fn list(&self, _user_id: &str, _filter: TaskFilter) -> Result<Vec<Task>, TaskStoreError> {
        std::future::pending().await
    }

    async fn set_completed(&self, _user_id: &str, _task_id: i64, _completed: bool) -> Result<Task, TaskStoreError> {
        std::future::pending().await
    }
}

pub struct TestApp {
    pub _dir: tempfile::TempDir,
    pub db: Database,
    pub components: AppComponents,
}

/// 测试用配置：快速重试、mock 后端
pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.llm.provider = "mock".into();
    cfg.retry.base_delay_ms = 1;
    cfg.retry.max_delay_ms = 5;
    cfg
}

pub async fn setup(
    cfg: AppConfig,
    backend: Option<Arc<dyn ReasoningBackend>>,
    tasks: Arc<dyn TaskStore>,
) -> TestApp {
    let dir = tempfile::TempDir::new().unwrap();
    let db = Database::connect(dir.path().join("taskmate.db"), 4)
        .await
        .unwrap();
    let mut builder = AgentBuilder::new(cfg, db.clone()).with_task_store(tasks);
    if let Some(backend) = backend {
        builder = builder.with_backend(backend);
    }
    TestApp {
        _dir: dir,
        db,
        components: builder.build(),
    }
}

pub fn call(tool_name: &str, arguments: serde_json::Value) -> Inference {
    Inference::with_call(tool_name, ProposedToolCall::new(tool_name, arguments))
}

pub const SHORT: Duration = Duration::from_millis(100);
