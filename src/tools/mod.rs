//! 工具层：任务工具目录与参数校验、分发、审计账本、任务存储协作者

pub mod audit;
pub mod dispatcher;
pub mod registry;
pub mod schema;
pub mod task_store;

pub use audit::{AuditFilter, AuditLedger, Resolution, ToolCallRecord, ToolCallStatus, UsageStats};
pub use dispatcher::{Dispatched, Dispatcher, OutcomeStatus, ToolOutcome, RESOLUTION_UNRECORDED};
pub use registry::{TaskOperation, ToolRegistry, ToolSpec};
pub use schema::{arguments_hash, canonical_json, sanitize_arguments, TaskCommand};
pub use task_store::{
    NewTask, Priority, SqliteTaskStore, Task, TaskFilter, TaskPatch, TaskStore, TaskStoreError,
};
