//! Taskmate - 无状态 Agent 编排核心
//!
//! 把一条自然语言请求转成零个或多个经过校验、可审计的任务操作；
//! 请求之间不在进程内保留任何会话状态。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、请求上下文、待确认状态机、主控编排、组件装配
//! - **gateway**: HTTP 接口（axum）
//! - **llm**: 推理后端抽象、重试执行器、OpenAI 兼容 / Mock 实现
//! - **memory**: 会话与消息持久化、上下文重建
//! - **observability**: 日志初始化
//! - **tools**: 工具目录、参数校验、分发、审计账本、任务存储

pub mod config;
pub mod core;
pub mod gateway;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;

pub use crate::core::{AgentBuilder, AgentError, AgentOrchestrator, AppComponents};
pub use crate::memory::Database;
