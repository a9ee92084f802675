//! 任务存储协作者
//!
//! Dispatcher 只通过 TaskStore 产生副作用；每个方法都显式接收 user_id，
//! 该值由 Dispatcher 从请求上下文注入，推理后端无法提供或覆盖。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use thiserror::Error;

use crate::memory::sqlite::{from_millis, now_millis};
use crate::memory::Database;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}

/// list_tasks 的状态过滤
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TaskFilter {
    #[default]
    All,
    Pending,
    Completed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub completed: bool,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
}

/// 部分更新；None 表示不修改
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskStoreError {
    #[error("task {0} not found")]
    NotFound(i64),

    #[error("invalid task data: {0}")]
    Invalid(String),

    #[error("task storage failure: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for TaskStoreError {
    fn from(e: sqlx::Error) -> Self {
        TaskStoreError::Storage(e.to_string())
    }
}

/// 任务存储接口
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, user_id: &str, task: NewTask) -> Result<Task, TaskStoreError>;

    async fn update(&self, user_id: &str, task_id: i64, patch: TaskPatch) -> Result<Task, TaskStoreError>;

    async fn delete(&self, user_id: &str, task_id: i64) -> Result<(), TaskStoreError>;

    async fn list(&self, user_id: &str, filter: TaskFilter) -> Result<Vec<Task>, TaskStoreError>;

    async fn set_completed(&self, user_id: &str, task_id: i64, completed: bool) -> Result<Task, TaskStoreError>;
}

/// SQLite 任务存储：所有查询按 user_id 限定，他人任务一律视为不存在
#[derive(Clone, Debug)]
pub struct SqliteTaskStore {
    db: Database,
}

impl SqliteTaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn fetch(&self, user_id: &str, task_id: i64) -> Result<Task, TaskStoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, title, description, completed, priority, created_at, updated_at
             FROM tasks WHERE id = ? AND user_id = ?",
        )
        .bind(task_id)
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await?;

        row.as_ref()
            .map(row_to_task)
            .ok_or(TaskStoreError::NotFound(task_id))
    }
}

fn row_to_task(row: &SqliteRow) -> Task {
    let priority: String = row.get("priority");
    let completed: i64 = row.get("completed");
    Task {
        id: row.get("id"),
        user_id: row.get("user_id"),
        title: row.get("title"),
        description: row.get("description"),
        completed: completed != 0,
        priority: Priority::parse(&priority).unwrap_or_default(),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    }
}

fn check_title(title: &str) -> Result<(), TaskStoreError> {
    let len = title.trim().chars().count();
    if len == 0 || len > 200 {
        return Err(TaskStoreError::Invalid(
            "title must be 1-200 characters".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, user_id: &str, task: NewTask) -> Result<Task, TaskStoreError> {
        check_title(&task.title)?;
        let now = now_millis();

        let row = sqlx::query(
            "INSERT INTO tasks (user_id, title, description, completed, priority, created_at, updated_at)
             VALUES (?, ?, ?, 0, ?, ?, ?)
             RETURNING id, user_id, title, description, completed, priority, created_at, updated_at",
        )
        .bind(user_id)
        .bind(task.title.trim())
        .bind(&task.description)
        .bind(task.priority.as_str())
        .bind(now)
        .bind(now)
        .fetch_one(self.db.pool())
        .await?;

        Ok(row_to_task(&row))
    }

    async fn update(&self, user_id: &str, task_id: i64, patch: TaskPatch) -> Result<Task, TaskStoreError> {
        if let Some(title) = &patch.title {
            check_title(title)?;
        }

        let row = sqlx::query(
            "UPDATE tasks SET
                title = COALESCE(?, title),
                description = COALESCE(?, description),
                priority = COALESCE(?, priority),
                updated_at = ?
             WHERE id = ? AND user_id = ?
             RETURNING id, user_id, title, description, completed, priority, created_at, updated_at",
        )
        .bind(patch.title.as_deref().map(str::trim))
        .bind(&patch.description)
        .bind(patch.priority.map(|p| p.as_str()))
        .bind(now_millis())
        .bind(task_id)
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await?;

        row.as_ref()
            .map(row_to_task)
            .ok_or(TaskStoreError::NotFound(task_id))
    }

    async fn delete(&self, user_id: &str, task_id: i64) -> Result<(), TaskStoreError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ? AND user_id = ?")
            .bind(task_id)
            .bind(user_id)
            .execute(self.db.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(TaskStoreError::NotFound(task_id));
        }
        Ok(())
    }

    async fn list(&self, user_id: &str, filter: TaskFilter) -> Result<Vec<Task>, TaskStoreError> {
        let completed_clause = match filter {
            TaskFilter::All => "",
            TaskFilter::Pending => " AND completed = 0",
            TaskFilter::Completed => " AND completed = 1",
        };
        let sql = format!(
            "SELECT id, user_id, title, description, completed, priority, created_at, updated_at
             FROM tasks WHERE user_id = ?{} ORDER BY created_at DESC, id DESC",
            completed_clause
        );

        let rows = sqlx::query(&sql)
            .bind(user_id)
            .fetch_all(self.db.pool())
            .await?;

        Ok(rows.iter().map(row_to_task).collect())
    }

    async fn set_completed(&self, user_id: &str, task_id: i64, completed: bool) -> Result<Task, TaskStoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET completed = ?, updated_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(completed as i64)
        .bind(now_millis())
        .bind(task_id)
        .bind(user_id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(TaskStoreError::NotFound(task_id));
        }
        self.fetch(user_id, task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, SqliteTaskStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::connect(dir.path().join("tasks.db"), 2).await.unwrap();
        (dir, SqliteTaskStore::new(db))
    }

    fn new_task(title: &str) -> NewTask {
        NewTask {
            title: title.to_string(),
            description: None,
            priority: Priority::default(),
        }
    }

    #[tokio::test]
    async fn test_create_update_complete_delete() {
        let (_dir, store) = store().await;
        let task = store.create("u1", new_task("buy milk")).await.unwrap();
        assert_eq!(task.priority, Priority::Medium);
        assert!(!task.completed);

        let updated = store
            .update(
                "u1",
                task.id,
                TaskPatch {
                    title: Some("buy oat milk".into()),
                    priority: Some(Priority::High),
                    ..TaskPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "buy oat milk");
        assert_eq!(updated.priority, Priority::High);

        let done = store.set_completed("u1", task.id, true).await.unwrap();
        assert!(done.completed);
        assert_eq!(store.list("u1", TaskFilter::Completed).await.unwrap().len(), 1);
        assert!(store.list("u1", TaskFilter::Pending).await.unwrap().is_empty());

        store.delete("u1", task.id).await.unwrap();
        assert_eq!(
            store.delete("u1", task.id).await,
            Err(TaskStoreError::NotFound(task.id))
        );
    }

    #[tokio::test]
    async fn test_other_users_tasks_are_invisible() {
        let (_dir, store) = store().await;
        let task = store.create("u1", new_task("private")).await.unwrap();

        assert!(store.list("u2", TaskFilter::All).await.unwrap().is_empty());
        assert_eq!(
            store.delete("u2", task.id).await,
            Err(TaskStoreError::NotFound(task.id))
        );
        assert!(matches!(
            store.set_completed("u2", task.id, true).await,
            Err(TaskStoreError::NotFound(_))
        ));
        assert_eq!(store.list("u1", TaskFilter::All).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_title_length_is_checked() {
        let (_dir, store) = store().await;
        assert!(matches!(
            store.create("u1", new_task("   ")).await,
            Err(TaskStoreError::Invalid(_))
        ));
        assert!(matches!(
            store.create("u1", new_task(&"x".repeat(201))).await,
            Err(TaskStoreError::Invalid(_))
        ));
    }
}
