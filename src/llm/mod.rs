//! 推理后端层：后端抽象与错误分类、重试执行器、实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod retry;
pub mod traits;

pub use mock::{MockBackend, ScriptedBackend};
pub use openai::{parse_inference, OpenAiBackend, DEEPSEEK_BASE_URL};
pub use retry::{RetryExecutor, RetryPolicy};
pub use traits::{BackendError, Inference, ProposedToolCall, ReasoningBackend};
