//! 请求上下文：在每次组件调用中显式传递 user_id / conversation_id / trace_id，
//! 替代任何全局或进程内的会话状态。

use uuid::Uuid;

/// 单次请求的上下文；user_id 来自上游身份校验，绝不取自后端提议的参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub trace_id: String,
}

impl RequestContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: None,
            trace_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }
}
