//! Agent 错误类型与稳定错误码
//!
//! 请求级错误（上下文重建、后端调用）直接返回给调用方；工具级错误由 Dispatcher
//! 捕获进审计记录并转为 ToolOutcome，不会以错误形式到达请求边界。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::confirmation::ConfirmationStatus;
use crate::llm::BackendError;
use crate::tools::TaskStoreError;

/// 编排核心中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 瞬时错误重试耗尽：后端不可用
    #[error("reasoning backend unavailable after {attempts} attempt(s): {source}")]
    TransientBackend {
        attempts: u32,
        #[source]
        source: BackendError,
    },

    /// 永久错误：后端拒绝了输入，不重试
    #[error("reasoning backend rejected the request: {0}")]
    PermanentBackend(#[source] BackendError),

    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("confirmation {0} has expired")]
    ConfirmationExpired(String),

    #[error("confirmation {id} is already {status}")]
    AlreadyResolved {
        id: String,
        status: ConfirmationStatus,
    },

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// 审计记录已是终态，不允许再次写入
    #[error("audit record {0} is already resolved")]
    RecordFinalized(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("task store error: {0}")]
    TaskStore(#[from] TaskStoreError),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for AgentError {
    fn from(e: config::ConfigError) -> Self {
        AgentError::Config(e.to_string())
    }
}

impl AgentError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// 对外稳定的错误码
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::TransientBackend { .. } => "TRANSIENT_BACKEND_ERROR",
            AgentError::PermanentBackend(_) => "PERMANENT_BACKEND_ERROR",
            AgentError::RequestTimeout(_) => "REQUEST_TIMEOUT",
            AgentError::Cancelled => "CANCELLED",
            AgentError::Validation(_) => "VALIDATION_ERROR",
            AgentError::Authorization(_) => "AUTHORIZATION_ERROR",
            AgentError::Forbidden(_) => "FORBIDDEN",
            AgentError::ConfirmationExpired(_) => "CONFIRMATION_EXPIRED",
            AgentError::AlreadyResolved { .. } => "ALREADY_RESOLVED",
            AgentError::UnknownTool(_) => "UNKNOWN_TOOL",
            AgentError::RecordFinalized(_) => "RECORD_FINALIZED",
            AgentError::NotFound { .. } => "NOT_FOUND",
            AgentError::TaskStore(TaskStoreError::NotFound(_)) => "NOT_FOUND",
            AgentError::TaskStore(TaskStoreError::Invalid(_)) => "VALIDATION_ERROR",
            AgentError::TaskStore(TaskStoreError::Storage(_)) => "TASK_STORE_ERROR",
            AgentError::Storage(_) => "STORAGE_ERROR",
            AgentError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// HTTP 状态码映射（gateway 使用）
    pub fn http_status(&self) -> u16 {
        match self {
            AgentError::Validation(_) | AgentError::UnknownTool(_) => 400,
            AgentError::TaskStore(TaskStoreError::Invalid(_)) => 400,
            AgentError::Authorization(_) | AgentError::Forbidden(_) => 403,
            AgentError::NotFound { .. } | AgentError::TaskStore(TaskStoreError::NotFound(_)) => 404,
            AgentError::AlreadyResolved { .. } | AgentError::RecordFinalized(_) => 409,
            AgentError::ConfirmationExpired(_) => 410,
            AgentError::PermanentBackend(_) => 422,
            AgentError::Cancelled => 499,
            AgentError::TransientBackend { .. } => 503,
            AgentError::RequestTimeout(_) => 504,
            AgentError::TaskStore(TaskStoreError::Storage(_))
            | AgentError::Storage(_)
            | AgentError::Config(_) => 500,
        }
    }

    /// 区分「后端不可用」与「后端拒绝输入」
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(
            self,
            AgentError::TransientBackend { .. } | AgentError::RequestTimeout(_)
        )
    }
}

/// 结构化错误体：稳定错误码 + 可读信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&AgentError> for ErrorBody {
    fn from(err: &AgentError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_errors_are_distinguishable() {
        let unavailable = AgentError::TransientBackend {
            attempts: 3,
            source: BackendError::Timeout,
        };
        let rejected = AgentError::PermanentBackend(BackendError::ContentPolicy("nope".into()));
        assert!(unavailable.is_backend_unavailable());
        assert!(!rejected.is_backend_unavailable());
        assert_eq!(unavailable.code(), "TRANSIENT_BACKEND_ERROR");
        assert_eq!(rejected.code(), "PERMANENT_BACKEND_ERROR");
    }

    #[test]
    fn test_task_store_errors_map_to_codes() {
        let err = AgentError::from(TaskStoreError::NotFound(7));
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(err.http_status(), 404);

        let err = AgentError::from(TaskStoreError::Storage("disk full".into()));
        assert_eq!(err.code(), "TASK_STORE_ERROR");
        assert_eq!(err.http_status(), 500);
    }

    #[test]
    fn test_error_body_from_error() {
        let err = AgentError::AlreadyResolved {
            id: "c1".into(),
            status: ConfirmationStatus::Confirmed,
        };
        let body = ErrorBody::from(&err);
        assert_eq!(body.code, "ALREADY_RESOLVED");
        assert_eq!(body.message, "confirmation c1 is already confirmed");
    }
}
