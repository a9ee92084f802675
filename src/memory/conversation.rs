//! 对话模型：持久化的会话/消息，以及每次请求重建出的上下文
//!
//! Message 的全序由 (timestamp, seq) 决定；seq 由存储按会话原子分配，
//! 同一毫秒内的写入也能区分先后。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 消息角色（持久化层只存 user / assistant）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// 会话：归属单个用户，首条消息时惰性创建
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 已持久化的单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// 会话内插入序号，从 1 开始严格递增
    pub seq: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// 待写入的消息
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// 上下文中的消息角色；Summary 为合成的摘要消息
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextRole {
    User,
    Assistant,
    Summary,
}

impl From<Role> for ContextRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => ContextRole::User,
            Role::Assistant => ContextRole::Assistant,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: ContextRole,
    pub content: String,
    /// 对应存储中的 seq；摘要消息为 None
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
}

impl From<&Message> for ContextMessage {
    fn from(m: &Message) -> Self {
        Self {
            role: m.role.into(),
            content: m.content.clone(),
            seq: Some(m.seq),
        }
    }
}

/// 重建出的对话上下文，仅在单次请求内存活
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub conversation_id: String,
    pub user_id: String,
    pub messages: Vec<ContextMessage>,
    /// 被折叠进摘要的旧消息条数
    pub summarized_count: usize,
    /// 存储中的消息总数
    pub total_messages: usize,
}

impl ConversationContext {
    /// 新会话的空上下文
    pub fn empty(conversation_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    /// 追加刚持久化的消息（入站用户消息在重建之后写入）
    pub fn push(&mut self, message: &Message) {
        self.messages.push(ContextMessage::from(message));
        self.total_messages += 1;
    }

    pub fn has_summary(&self) -> bool {
        self.messages
            .first()
            .is_some_and(|m| m.role == ContextRole::Summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_roundtrip_str() {
        assert_eq!(Role::parse(Role::User.as_str()), Some(Role::User));
        assert_eq!(Role::parse("assistant"), Some(Role::Assistant));
        assert_eq!(Role::parse("system"), None);
    }

    #[test]
    fn test_context_push() {
        let mut ctx = ConversationContext::empty("c1", "u1");
        let msg = Message {
            id: "m1".into(),
            conversation_id: "c1".into(),
            role: Role::User,
            content: "hi".into(),
            timestamp: Utc::now(),
            seq: 1,
            metadata: None,
        };
        ctx.push(&msg);
        assert_eq!(ctx.total_messages, 1);
        assert_eq!(ctx.messages[0].role, ContextRole::User);
        assert_eq!(ctx.messages[0].seq, Some(1));
        assert!(!ctx.has_summary());
    }
}
