//! 记忆层：持久化的会话与消息、token 估算、每次请求的上下文重建

pub mod conversation;
pub mod reconstructor;
pub mod sqlite;
pub mod token_budget;

pub use conversation::{
    ContextMessage, ContextRole, Conversation, ConversationContext, Message, NewMessage, Role,
};
pub use reconstructor::ContextReconstructor;
pub use sqlite::{ConversationStore, Database, SqliteConversationStore};
pub use token_budget::TokenEstimator;
