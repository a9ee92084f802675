//! 推理后端抽象
//!
//! 后端被视为不透明函数：ConversationContext -> intent + 提议的工具调用。
//! 所有实现（OpenAI 兼容 / Mock）实现 ReasoningBackend，并按 BackendError 的分类报告失败。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::ConversationContext;

/// 后端提议的一次工具调用（形状未经校验，需经 ToolRegistry 校验后才可执行）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedToolCall {
    #[serde(alias = "tool", alias = "name")]
    pub tool_name: String,
    #[serde(default, alias = "args")]
    pub arguments: serde_json::Value,
}

impl ProposedToolCall {
    pub fn new(tool_name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// 一次完整的推理结果：要么完整返回，要么报错，不存在部分结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inference {
    pub intent: String,
    /// 可选的自然语言回复，作为助手回复的开头
    #[serde(default)]
    pub reply: Option<String>,
    #[serde(default, alias = "tool_calls")]
    pub proposed_tool_calls: Vec<ProposedToolCall>,
}

impl Inference {
    pub fn reply_only(intent: impl Into<String>, reply: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            reply: Some(reply.into()),
            proposed_tool_calls: Vec::new(),
        }
    }

    pub fn with_call(intent: impl Into<String>, call: ProposedToolCall) -> Self {
        Self {
            intent: intent.into(),
            reply: None,
            proposed_tool_calls: vec![call],
        }
    }
}

/// 后端错误：瞬时错误可重试，永久错误立即上抛
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("backend call timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("backend server error: {0}")]
    Server(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("backend authentication failed: {0}")]
    Authentication(String),

    #[error("content policy rejection: {0}")]
    ContentPolicy(String),

    #[error("malformed backend response: {0}")]
    MalformedResponse(String),
}

impl BackendError {
    /// 瞬时错误：超时、连接中断、限流、5xx
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout
                | BackendError::Connection(_)
                | BackendError::RateLimited(_)
                | BackendError::Server(_)
        )
    }

    /// 按错误信息分类（供只返回字符串错误的 provider 使用）
    ///
    /// 顺序有意义：内容策略与鉴权先于通用的 "invalid" 判断；无法识别的错误按服务端错误（可重试）处理。
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        let msg = message.to_string();

        if lower.contains("content_policy")
            || lower.contains("content policy")
            || lower.contains("content_filter")
            || lower.contains("safety")
        {
            BackendError::ContentPolicy(msg)
        } else if lower.contains("401")
            || lower.contains("unauthorized")
            || lower.contains("invalid api key")
            || lower.contains("incorrect api key")
            || lower.contains("authentication")
        {
            BackendError::Authentication(msg)
        } else if lower.contains("429")
            || lower.contains("rate limit")
            || lower.contains("rate_limit")
            || lower.contains("too many requests")
        {
            BackendError::RateLimited(msg)
        } else if lower.contains("timeout") || lower.contains("timed out") {
            BackendError::Timeout
        } else if lower.contains("connection")
            || lower.contains("reset by peer")
            || lower.contains("broken pipe")
            || lower.contains("dns")
        {
            BackendError::Connection(msg)
        } else if lower.contains("400")
            || lower.contains("bad request")
            || lower.contains("invalid")
            || lower.contains("malformed")
        {
            BackendError::MalformedRequest(msg)
        } else {
            BackendError::Server(msg)
        }
    }
}

/// 推理后端 trait
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// 根据重建的上下文给出意图与提议的工具调用
    async fn infer(&self, context: &ConversationContext) -> Result<Inference, BackendError>;

    /// 后端名称（日志用）
    fn name(&self) -> &str {
        "backend"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_transient() {
        assert_eq!(BackendError::classify("request timed out"), BackendError::Timeout);
        assert!(BackendError::classify("HTTP 429 Too Many Requests").is_transient());
        assert!(BackendError::classify("connection reset by peer").is_transient());
        assert!(BackendError::classify("502 Bad Gateway upstream").is_transient());
    }

    #[test]
    fn test_classify_permanent() {
        let err = BackendError::classify("Incorrect API key provided");
        assert!(matches!(err, BackendError::Authentication(_)));
        assert!(!err.is_transient());

        let err = BackendError::classify("400 invalid request: messages must not be empty");
        assert!(matches!(err, BackendError::MalformedRequest(_)));

        let err = BackendError::classify("rejected by content_filter");
        assert!(matches!(err, BackendError::ContentPolicy(_)));
    }

    #[test]
    fn test_unrecognised_errors_are_retried() {
        assert!(BackendError::classify("something odd happened").is_transient());
    }

    #[test]
    fn test_inference_accepts_aliases() {
        let raw = r#"{"intent": "delete", "tool_calls": [{"tool": "delete_task", "args": {"task_id": 7}}]}"#;
        let inference: Inference = serde_json::from_str(raw).unwrap();
        assert_eq!(inference.proposed_tool_calls.len(), 1);
        assert_eq!(inference.proposed_tool_calls[0].tool_name, "delete_task");
        assert_eq!(inference.proposed_tool_calls[0].arguments["task_id"], 7);
        assert!(inference.reply.is_none());
    }
}
