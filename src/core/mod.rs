//! 核心编排层：错误分类、请求上下文、待确认状态机、主控编排与组件装配

pub mod builder;
pub mod confirmation;
pub mod error;
pub mod orchestrator;
pub mod request;

pub use builder::{create_backend_from_config, AgentBuilder, AppComponents};
pub use confirmation::{
    ConfirmationManager, ConfirmationStatus, CreatedConfirmation, PendingConfirmation,
};
pub use error::{AgentError, ErrorBody};
pub use orchestrator::{AgentOrchestrator, ChatResponse, MAX_MESSAGE_CHARS};
pub use request::RequestContext;
