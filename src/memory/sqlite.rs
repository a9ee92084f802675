//! SQLite 持久化（sqlx 异步连接池）
//!
//! 所有跨请求状态都在这里：会话、消息、审计记录、待确认、任务。
//! 启动时幂等建表；时间戳一律存 UTC 毫秒。

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::core::AgentError;
use crate::memory::{Conversation, Message, NewMessage, Role};

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// 共享连接池；Clone 只复制句柄
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// 打开（必要时创建）数据库文件并建表
    pub async fn connect(path: impl AsRef<Path>, max_connections: u32) -> Result<Self, sqlx::Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init_tables().await?;
        tracing::info!("Database ready at {}", path.display());
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id)",
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT,
                created_at INTEGER NOT NULL,
                UNIQUE (conversation_id, seq),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id)
            )",
            "CREATE TABLE IF NOT EXISTS tool_call_records (
                id TEXT PRIMARY KEY,
                conversation_id TEXT,
                user_id TEXT NOT NULL,
                trace_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                arguments TEXT NOT NULL,
                status TEXT NOT NULL,
                result TEXT,
                error_code TEXT,
                error_message TEXT,
                requested_at INTEGER NOT NULL,
                resolved_at INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_tool_calls_requested ON tool_call_records(requested_at)",
            "CREATE INDEX IF NOT EXISTS idx_tool_calls_status ON tool_call_records(status)",
            "CREATE TABLE IF NOT EXISTS pending_confirmations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                conversation_id TEXT,
                tool_name TEXT NOT NULL,
                arguments TEXT NOT NULL,
                args_hash TEXT NOT NULL,
                audit_record_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                resolved_at INTEGER
            )",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_confirmations_one_pending
                ON pending_confirmations(user_id, tool_name, args_hash)
                WHERE status = 'pending'",
            "CREATE INDEX IF NOT EXISTS idx_confirmations_user ON pending_confirmations(user_id, status)",
            "CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                completed INTEGER NOT NULL DEFAULT 0,
                priority TEXT NOT NULL DEFAULT 'medium',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id)",
        ];

        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }
}

/// 会话/消息存储接口（ContextReconstructor 与编排器只经由它读写）
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, user_id: &str) -> Result<Conversation, AgentError>;

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, AgentError>;

    /// 追加消息：seq 与单调时间戳在同一条语句内原子分配
    async fn append_message(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> Result<Message, AgentError>;

    /// 按 (timestamp, seq) 全序加载
    async fn load_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AgentError>;
}

/// 基于 Database 的 ConversationStore
#[derive(Clone, Debug)]
pub struct SqliteConversationStore {
    db: Database,
}

impl SqliteConversationStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn row_to_conversation(row: &SqliteRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        user_id: row.get("user_id"),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    }
}

fn row_to_message(row: &SqliteRow) -> Result<Message, AgentError> {
    let role_str: String = row.get("role");
    let role = Role::parse(&role_str)
        .ok_or_else(|| AgentError::Validation(format!("unknown stored role: {}", role_str)))?;
    let metadata: Option<String> = row.get("metadata");

    Ok(Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        role,
        content: row.get("content"),
        timestamp: from_millis(row.get("created_at")),
        seq: row.get("seq"),
        metadata: metadata.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn create_conversation(&self, user_id: &str) -> Result<Conversation, AgentError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_millis();

        sqlx::query(
            "INSERT INTO conversations (id, user_id, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        tracing::info!(conversation_id = %id, user_id, "Conversation created");
        Ok(Conversation {
            id,
            user_id: user_id.to_string(),
            created_at: from_millis(now),
            updated_at: from_millis(now),
        })
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, AgentError> {
        let row = sqlx::query(
            "SELECT id, user_id, created_at, updated_at FROM conversations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.as_ref().map(row_to_conversation))
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> Result<Message, AgentError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_millis();
        let metadata = message
            .metadata
            .as_ref()
            .map(|m| m.to_string());

        // seq = 当前最大值 + 1；时间戳不早于会话内最后一条，保证 (timestamp, seq) 与追加顺序一致
        let row = sqlx::query(
            "INSERT INTO messages (id, conversation_id, seq, role, content, metadata, created_at)
             VALUES (
                ?1, ?2,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?2),
                ?3, ?4, ?5,
                MAX(?6, (SELECT COALESCE(MAX(created_at), 0) FROM messages WHERE conversation_id = ?2))
             )
             RETURNING seq, created_at",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(&metadata)
        .bind(now)
        .fetch_one(self.db.pool())
        .await?;

        let seq: i64 = row.get("seq");
        let created_at: i64 = row.get("created_at");

        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(created_at)
            .bind(conversation_id)
            .execute(self.db.pool())
            .await?;

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            role: message.role,
            content: message.content,
            timestamp: from_millis(created_at),
            seq,
            metadata: message.metadata,
        })
    }

    async fn load_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AgentError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, seq, role, content, metadata, created_at
             FROM messages WHERE conversation_id = ?
             ORDER BY created_at ASC, seq ASC",
        )
        .bind(conversation_id)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(row_to_message).collect()
    }
}
