//! 工具调用分发
//!
//! 对每个后端提议的调用：先写 attempted 审计记录，再剥离 user_id、按注册表校验；
//! 安全工具立即经 TaskStore 执行，破坏性工具交给 ConfirmationManager 挂起，
//! 确认成功后才执行同样的调用并写终态。
//! 传给 TaskStore 的 user_id 只来自 RequestContext。

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::confirmation::{ConfirmationManager, PendingConfirmation};
use crate::core::{AgentError, ErrorBody, RequestContext};
use crate::tools::schema::{sanitize_arguments, TaskCommand};
use crate::tools::task_store::{NewTask, TaskPatch, TaskStore, TaskStoreError};
use crate::tools::{AuditLedger, Resolution, ToolRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    Rejected,
    RequiresConfirmation,
    /// 审计终态未能写入：调用可能已执行，以审计记录为准
    Unresolved,
}

/// 审计终态写入失败时 outcome 的错误码
pub const RESOLUTION_UNRECORDED: &str = "RESOLUTION_UNRECORDED";

/// 单个工具调用的结构化结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub tool_name: String,
    pub status: OutcomeStatus,
    /// 审计记录写入失败时为空
    pub audit_record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_id: Option<String>,
}

impl ToolOutcome {
    fn new(tool_name: &str, status: OutcomeStatus, audit_record_id: Option<String>) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            status,
            audit_record_id,
            result: None,
            error: None,
            confirmation_id: None,
        }
    }

    /// 连 attempted 审计记录都没能写入时的失败结果
    pub fn unrecorded(tool_name: &str, err: &AgentError) -> Self {
        Self {
            error: Some(ErrorBody::from(err)),
            ..Self::new(tool_name, OutcomeStatus::Failed, None)
        }
    }

    /// 面向用户的一行摘要
    pub fn summary(&self) -> String {
        match self.status {
            OutcomeStatus::Succeeded => self.success_summary(),
            OutcomeStatus::RequiresConfirmation => format!(
                "{} needs your confirmation (confirmation id {}).",
                self.tool_name,
                self.confirmation_id.as_deref().unwrap_or("?")
            ),
            OutcomeStatus::Unresolved => {
                let mut line = match &self.error {
                    Some(e) => format!("{} [{}]: {}", self.tool_name, e.code, e.message),
                    None => format!("{} result is unknown", self.tool_name),
                };
                if let Some(id) = &self.audit_record_id {
                    let _ = write!(line, " (check audit record {} before retrying)", id);
                }
                line
            }
            OutcomeStatus::Failed | OutcomeStatus::Rejected => {
                let verb = if self.status == OutcomeStatus::Failed {
                    "failed"
                } else {
                    "was rejected"
                };
                let mut line = match &self.error {
                    Some(e) => format!("{} {} [{}]: {}", self.tool_name, verb, e.code, e.message),
                    None => format!("{} {}", self.tool_name, verb),
                };
                if let Some(id) = &self.audit_record_id {
                    let _ = write!(line, " (audit record {})", id);
                }
                line
            }
        }
    }

    fn success_summary(&self) -> String {
        let result = self.result.as_ref().unwrap_or(&Value::Null);
        let task_id = result["id"].as_i64().unwrap_or_default();
        match self.tool_name.as_str() {
            "add_task" => format!(
                "Added task #{}: {}",
                task_id,
                result["title"].as_str().unwrap_or_default()
            ),
            "update_task" => format!("Updated task #{}.", task_id),
            "complete_task" => {
                if result["completed"].as_bool().unwrap_or(true) {
                    format!("Marked task #{} as completed.", task_id)
                } else {
                    format!("Marked task #{} as not completed.", task_id)
                }
            }
            "delete_task" => format!(
                "Deleted task #{}.",
                result["deleted"].as_i64().unwrap_or_default()
            ),
            "list_tasks" => {
                let tasks = result["tasks"].as_array().cloned().unwrap_or_default();
                if tasks.is_empty() {
                    return "You have no matching tasks.".to_string();
                }
                let mut out = format!("Found {} task(s):", tasks.len());
                for t in &tasks {
                    let mark = if t["completed"].as_bool().unwrap_or(false) {
                        "x"
                    } else {
                        " "
                    };
                    let _ = write!(
                        out,
                        "\n[{}] #{} {}",
                        mark,
                        t["id"].as_i64().unwrap_or_default(),
                        t["title"].as_str().unwrap_or_default()
                    );
                }
                out
            }
            other => format!("{} succeeded.", other),
        }
    }
}

/// dispatch 的结果：结构化 outcome，以及（若被挂起）对应的待确认记录
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub outcome: ToolOutcome,
    pub pending: Option<PendingConfirmation>,
}

pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    tasks: Arc<dyn TaskStore>,
    confirmations: ConfirmationManager,
    ledger: AuditLedger,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        tasks: Arc<dyn TaskStore>,
        confirmations: ConfirmationManager,
        ledger: AuditLedger,
    ) -> Self {
        Self {
            registry,
            tasks,
            confirmations,
            ledger,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn confirmations(&self) -> &ConfirmationManager {
        &self.confirmations
    }

    pub fn ledger(&self) -> &AuditLedger {
        &self.ledger
    }

    /// 分发一个提议的调用；工具级错误进入 outcome，只有 attempted 记录写入失败才返回 Err。
    /// attempted 之后的任何失败都带着 audit_record_id 返回 outcome
    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        tool_name: &str,
        arguments: &Value,
    ) -> Result<Dispatched, AgentError> {
        let start = Instant::now();
        let audit_id = self.ledger.record_attempt(ctx, tool_name, arguments).await?;

        let validated = sanitize_arguments(arguments).and_then(|clean| {
            self.registry
                .validate(tool_name, &clean)
                .map(|(spec, command)| (spec.destructive, clean, command))
        });

        let (destructive, clean, command) = match validated {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(trace_id = %ctx.trace_id, "Rejected {} call: {}", tool_name, e);
                let outcome = self
                    .finish(failed(tool_name, ErrorBody::from(&e), audit_id))
                    .await;
                log_dispatch(ctx, &outcome, start);
                return Ok(Dispatched {
                    outcome,
                    pending: None,
                });
            }
        };

        if destructive {
            let parked = match self
                .confirmations
                .create(ctx, tool_name, &clean, &audit_id)
                .await
            {
                Ok(parked) => parked,
                Err(e) => {
                    tracing::error!(trace_id = %ctx.trace_id, "Could not park {} call: {}", tool_name, e);
                    let outcome = self
                        .finish(failed(tool_name, ErrorBody::from(&e), audit_id))
                        .await;
                    log_dispatch(ctx, &outcome, start);
                    return Ok(Dispatched {
                        outcome,
                        pending: None,
                    });
                }
            };

            let mut outcome = ToolOutcome {
                confirmation_id: Some(parked.confirmation.id.clone()),
                ..ToolOutcome::new(tool_name, OutcomeStatus::RequiresConfirmation, Some(audit_id.clone()))
            };
            if !parked.created {
                let duplicate = ErrorBody::new(
                    "DUPLICATE_CONFIRMATION",
                    format!(
                        "identical request already awaiting confirmation {}",
                        parked.confirmation.id
                    ),
                );
                if let Err(e) = self
                    .ledger
                    .record_resolution(&audit_id, Resolution::Rejected(duplicate))
                    .await
                {
                    outcome = unresolved(outcome, "was a duplicate of a pending confirmation", &e);
                }
            }
            log_dispatch(ctx, &outcome, start);
            return Ok(Dispatched {
                outcome,
                pending: Some(parked.confirmation),
            });
        }

        let outcome = self
            .execute_and_resolve(&ctx.user_id, &command, audit_id)
            .await;
        log_dispatch(ctx, &outcome, start);
        Ok(Dispatched {
            outcome,
            pending: None,
        })
    }

    /// 确认挂起的调用并执行；确认失败（过期、越权、已处理）直接返回错误
    pub async fn confirm(&self, ctx: &RequestContext, confirmation_id: &str) -> Result<ToolOutcome, AgentError> {
        let start = Instant::now();
        let confirmed = self
            .confirmations
            .confirm(confirmation_id, &ctx.user_id)
            .await?;

        let mut outcome = match TaskCommand::parse(&confirmed.tool_name, &confirmed.arguments) {
            Ok(command) => {
                self.execute_and_resolve(&ctx.user_id, &command, confirmed.audit_record_id.clone())
                    .await
            }
            Err(e) => {
                self.finish(failed(
                    &confirmed.tool_name,
                    ErrorBody::from(&e),
                    confirmed.audit_record_id.clone(),
                ))
                .await
            }
        };
        outcome.confirmation_id = Some(confirmed.id);
        log_dispatch(ctx, &outcome, start);
        Ok(outcome)
    }

    pub async fn reject(&self, ctx: &RequestContext, confirmation_id: &str) -> Result<PendingConfirmation, AgentError> {
        self.confirmations
            .reject(confirmation_id, &ctx.user_id)
            .await
    }

    async fn execute_and_resolve(&self, user_id: &str, command: &TaskCommand, audit_id: String) -> ToolOutcome {
        let tool_name = command.tool_name();
        let outcome = match self.execute(user_id, command).await {
            Ok(result) => ToolOutcome {
                result: Some(result),
                ..ToolOutcome::new(tool_name, OutcomeStatus::Succeeded, Some(audit_id))
            },
            Err(e) => failed(tool_name, ErrorBody::from(&AgentError::from(e)), audit_id),
        };
        self.finish(outcome).await
    }

    /// 按 outcome 写审计终态；写入失败时 outcome 转为 Unresolved，保留 audit_record_id 与已知结果
    async fn finish(&self, outcome: ToolOutcome) -> ToolOutcome {
        let Some(audit_id) = outcome.audit_record_id.clone() else {
            return outcome;
        };
        let (resolution, what) = match (outcome.status, &outcome.error) {
            (OutcomeStatus::Succeeded, _) => (
                Resolution::Succeeded(outcome.result.clone().unwrap_or(Value::Null)),
                "ran".to_string(),
            ),
            (OutcomeStatus::Rejected, Some(e)) => (Resolution::Rejected(e.clone()), format!("was rejected ({})", e.code)),
            (_, Some(e)) => (Resolution::Failed(e.clone()), format!("failed ({})", e.code)),
            (_, None) => return outcome,
        };

        match self.ledger.record_resolution(&audit_id, resolution).await {
            Ok(()) => outcome,
            Err(e) => unresolved(outcome, &what, &e),
        }
    }

    /// 唯一产生副作用的地方；user_id 由调用方注入
    async fn execute(&self, user_id: &str, command: &TaskCommand) -> Result<Value, TaskStoreError> {
        match command {
            TaskCommand::Add(args) => {
                let task = self
                    .tasks
                    .create(
                        user_id,
                        NewTask {
                            title: args.title.clone(),
                            description: args.description.clone(),
                            priority: args.priority.unwrap_or_default(),
                        },
                    )
                    .await?;
                Ok(json!(task))
            }
            TaskCommand::List(args) => {
                let tasks = self
                    .tasks
                    .list(user_id, args.status.unwrap_or_default())
                    .await?;
                Ok(json!({ "count": tasks.len(), "tasks": tasks }))
            }
            TaskCommand::Update(args) => {
                let task = self
                    .tasks
                    .update(
                        user_id,
                        args.task_id,
                        TaskPatch {
                            title: args.title.clone(),
                            description: args.description.clone(),
                            priority: args.priority,
                        },
                    )
                    .await?;
                Ok(json!(task))
            }
            TaskCommand::Complete(args) => {
                let task = self
                    .tasks
                    .set_completed(user_id, args.task_id, args.completed.unwrap_or(true))
                    .await?;
                Ok(json!(task))
            }
            TaskCommand::Delete(args) => {
                self.tasks.delete(user_id, args.task_id).await?;
                Ok(json!({ "deleted": args.task_id }))
            }
        }
    }
}

fn failed(tool_name: &str, error: ErrorBody, audit_id: String) -> ToolOutcome {
    ToolOutcome {
        error: Some(error),
        ..ToolOutcome::new(tool_name, OutcomeStatus::Failed, Some(audit_id))
    }
}

fn unresolved(outcome: ToolOutcome, what: &str, err: &AgentError) -> ToolOutcome {
    tracing::error!(
        audit_record_id = outcome.audit_record_id.as_deref().unwrap_or_default(),
        "{} {} but its audit resolution was not recorded: {}",
        outcome.tool_name,
        what,
        err
    );
    ToolOutcome {
        status: OutcomeStatus::Unresolved,
        error: Some(ErrorBody::new(
            RESOLUTION_UNRECORDED,
            format!("call {} but the audit record could not be finalized: {}", what, err),
        )),
        ..outcome
    }
}

fn log_dispatch(ctx: &RequestContext, outcome: &ToolOutcome, start: Instant) {
    let audit = json!({
        "event": "tool_audit",
        "tool": outcome.tool_name,
        "status": outcome.status,
        "duration_ms": start.elapsed().as_millis() as u64,
        "audit_record_id": outcome.audit_record_id,
        "confirmation_id": outcome.confirmation_id,
        "trace_id": ctx.trace_id,
    });
    tracing::info!(audit = %audit, "tool");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summaries() {
        let mut outcome = ToolOutcome::new("add_task", OutcomeStatus::Succeeded, Some("a1".into()));
        outcome.result = Some(json!({"id": 4, "title": "milk"}));
        assert_eq!(outcome.summary(), "Added task #4: milk");

        let outcome = ToolOutcome {
            confirmation_id: Some("c9".into()),
            ..ToolOutcome::new("delete_task", OutcomeStatus::RequiresConfirmation, Some("a2".into()))
        };
        assert!(outcome.summary().contains("c9"));

        let outcome = ToolOutcome {
            error: Some(ErrorBody::new("NOT_FOUND", "task 3 not found")),
            ..ToolOutcome::new("complete_task", OutcomeStatus::Failed, Some("a3".into()))
        };
        assert_eq!(
            outcome.summary(),
            "complete_task failed [NOT_FOUND]: task 3 not found (audit record a3)"
        );

        let outcome = ToolOutcome {
            error: Some(ErrorBody::new(RESOLUTION_UNRECORDED, "call ran but the audit record could not be finalized")),
            ..ToolOutcome::new("add_task", OutcomeStatus::Unresolved, Some("a4".into()))
        };
        let line = outcome.summary();
        assert!(line.starts_with("add_task [RESOLUTION_UNRECORDED]"));
        assert!(line.ends_with("(check audit record a4 before retrying)"));
        assert_eq!(serde_json::to_value(outcome.status).unwrap(), "unresolved");

        let mut outcome = ToolOutcome::new("list_tasks", OutcomeStatus::Succeeded, None);
        outcome.result = Some(json!({"count": 1, "tasks": [{"id": 1, "title": "a", "completed": true}]}));
        assert_eq!(outcome.summary(), "Found 1 task(s):\n[x] #1 a");
    }
}
