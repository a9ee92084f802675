//! 破坏性操作的待确认状态机
//!
//! `pending -> confirmed | rejected | expired`，所有转换单向且终态不可变。
//! 状态转换用数据库层面的 compare-and-set（`UPDATE .. WHERE status = 'pending'`）完成，
//! 并发确认只有一个赢家。过期在读取时惰性判定，没有后台定时器。
//!
//! 挂起的调用在挂起时已写入 attempted 审计记录：拒绝与过期由这里写终态，
//! 确认后的执行与终态由 Dispatcher 负责。

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::core::{AgentError, ErrorBody, RequestContext};
use crate::memory::sqlite::{from_millis, now_millis};
use crate::memory::Database;
use crate::tools::schema::arguments_hash;
use crate::tools::{AuditLedger, Resolution};

/// 确认状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    Pending,
    Confirmed,
    Rejected,
    Expired,
}

impl ConfirmationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationStatus::Pending => "pending",
            ConfirmationStatus::Confirmed => "confirmed",
            ConfirmationStatus::Rejected => "rejected",
            ConfirmationStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ConfirmationStatus::Pending),
            "confirmed" => Some(ConfirmationStatus::Confirmed),
            "rejected" => Some(ConfirmationStatus::Rejected),
            "expired" => Some(ConfirmationStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConfirmationStatus::Pending)
    }
}

impl fmt::Display for ConfirmationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub id: String,
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub tool_name: String,
    pub arguments: Value,
    #[serde(skip)]
    pub args_hash: String,
    /// 挂起时写入的 attempted 审计记录
    pub audit_record_id: String,
    pub status: ConfirmationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// create 的结果；created 为 false 表示命中了已存在的待确认记录
#[derive(Debug, Clone)]
pub struct CreatedConfirmation {
    pub confirmation: PendingConfirmation,
    pub created: bool,
}

const SELECT_CONFIRMATION: &str = "SELECT id, user_id, conversation_id, tool_name, arguments, args_hash,
        audit_record_id, status, created_at, expires_at, resolved_at
     FROM pending_confirmations";

fn row_to_confirmation(row: &SqliteRow) -> PendingConfirmation {
    let arguments: String = row.get("arguments");
    let status: String = row.get("status");
    let resolved_at: Option<i64> = row.get("resolved_at");
    let id: String = row.get("id");

    let status = ConfirmationStatus::parse(&status).unwrap_or_else(|| {
        tracing::warn!(confirmation_id = %id, "Unknown confirmation status '{}', reading as expired", status);
        ConfirmationStatus::Expired
    });

    PendingConfirmation {
        id,
        user_id: row.get("user_id"),
        conversation_id: row.get("conversation_id"),
        tool_name: row.get("tool_name"),
        arguments: serde_json::from_str(&arguments).unwrap_or(Value::Null),
        args_hash: row.get("args_hash"),
        audit_record_id: row.get("audit_record_id"),
        status,
        created_at: from_millis(row.get("created_at")),
        expires_at: from_millis(row.get("expires_at")),
        resolved_at: resolved_at.map(from_millis),
    }
}

#[derive(Clone, Debug)]
pub struct ConfirmationManager {
    db: Database,
    ledger: AuditLedger,
    ttl: Duration,
}

impl ConfirmationManager {
    pub fn new(db: Database, ledger: AuditLedger, ttl: Duration) -> Self {
        Self { db, ledger, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 挂起一个破坏性调用；相同 (user_id, tool_name, 参数哈希) 的未决记录直接返回
    pub async fn create(
        &self,
        ctx: &RequestContext,
        tool_name: &str,
        arguments: &Value,
        audit_record_id: &str,
    ) -> Result<CreatedConfirmation, AgentError> {
        let args_hash = arguments_hash(&ctx.user_id, tool_name, arguments);

        // 插入与查询之间，已有记录可能恰好被确认/拒绝，此时重试一次插入
        for _ in 0..3 {
            self.expire_matching(&ctx.user_id, tool_name, &args_hash).await?;

            let id = uuid::Uuid::new_v4().to_string();
            let now = now_millis();
            let expires_at = now + self.ttl.as_millis() as i64;

            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO pending_confirmations
                    (id, user_id, conversation_id, tool_name, arguments, args_hash,
                     audit_record_id, status, created_at, expires_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)",
            )
            .bind(&id)
            .bind(&ctx.user_id)
            .bind(&ctx.conversation_id)
            .bind(tool_name)
            .bind(arguments.to_string())
            .bind(&args_hash)
            .bind(audit_record_id)
            .bind(now)
            .bind(expires_at)
            .execute(self.db.pool())
            .await?;

            if inserted.rows_affected() == 1 {
                tracing::info!(
                    confirmation_id = %id,
                    user_id = %ctx.user_id,
                    trace_id = %ctx.trace_id,
                    "Parked {} pending confirmation",
                    tool_name
                );
                let confirmation = self
                    .get(&id)
                    .await?
                    .ok_or_else(|| AgentError::not_found("confirmation", &id))?;
                return Ok(CreatedConfirmation {
                    confirmation,
                    created: true,
                });
            }

            let sql = format!(
                "{} WHERE user_id = ? AND tool_name = ? AND args_hash = ? AND status = 'pending'",
                SELECT_CONFIRMATION
            );
            let existing = sqlx::query(&sql)
                .bind(&ctx.user_id)
                .bind(tool_name)
                .bind(&args_hash)
                .fetch_optional(self.db.pool())
                .await?;

            if let Some(row) = existing {
                let confirmation = row_to_confirmation(&row);
                tracing::info!(
                    confirmation_id = %confirmation.id,
                    trace_id = %ctx.trace_id,
                    "Duplicate {} request resolved to existing confirmation",
                    tool_name
                );
                return Ok(CreatedConfirmation {
                    confirmation,
                    created: false,
                });
            }
        }

        Err(AgentError::Storage(sqlx::Error::Protocol(format!(
            "could not park {} for user {}",
            tool_name, ctx.user_id
        ))))
    }

    /// pending -> confirmed
    pub async fn confirm(&self, id: &str, user_id: &str) -> Result<PendingConfirmation, AgentError> {
        self.transition(id, user_id, ConfirmationStatus::Confirmed).await
    }

    /// pending -> rejected，同时把挂起的审计记录写为 rejected
    pub async fn reject(&self, id: &str, user_id: &str) -> Result<PendingConfirmation, AgentError> {
        let rejected = self
            .transition(id, user_id, ConfirmationStatus::Rejected)
            .await?;
        self.resolve_parked(
            &rejected.audit_record_id,
            ErrorBody::new("CONFIRMATION_REJECTED", format!("confirmation {} rejected by user", id)),
        )
        .await?;
        Ok(rejected)
    }

    async fn transition(
        &self,
        id: &str,
        user_id: &str,
        target: ConfirmationStatus,
    ) -> Result<PendingConfirmation, AgentError> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| AgentError::not_found("confirmation", id))?;

        if current.user_id != user_id {
            tracing::warn!(
                confirmation_id = id,
                owner = %current.user_id,
                caller = user_id,
                "Refused {} on confirmation owned by another user",
                target
            );
            self.audit_forbidden(&current, user_id, target).await?;
            return Err(AgentError::Forbidden(format!(
                "confirmation {} belongs to another user",
                id
            )));
        }

        let now = now_millis();
        let updated = sqlx::query(
            "UPDATE pending_confirmations SET status = ?, resolved_at = ?
             WHERE id = ? AND status = 'pending' AND expires_at > ?",
        )
        .bind(target.as_str())
        .bind(now)
        .bind(id)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        if updated.rows_affected() == 1 {
            tracing::info!(confirmation_id = id, "Confirmation {}", target);
            return Ok(PendingConfirmation {
                status: target,
                resolved_at: Some(from_millis(now)),
                ..current
            });
        }

        // CAS 失败：要么已是终态，要么已过期但尚未翻转
        let latest = self
            .get(id)
            .await?
            .ok_or_else(|| AgentError::not_found("confirmation", id))?;
        match latest.status {
            ConfirmationStatus::Pending => {
                self.expire_one(id).await?;
                Err(AgentError::ConfirmationExpired(id.to_string()))
            }
            ConfirmationStatus::Expired => Err(AgentError::ConfirmationExpired(id.to_string())),
            status => Err(AgentError::AlreadyResolved {
                id: id.to_string(),
                status,
            }),
        }
    }

    /// 把单条已过期的 pending 翻转为 expired；已被他人翻转时什么也不做
    async fn expire_one(&self, id: &str) -> Result<(), AgentError> {
        let now = now_millis();
        let row = sqlx::query(
            "UPDATE pending_confirmations SET status = 'expired', resolved_at = ?
             WHERE id = ? AND status = 'pending' AND expires_at <= ?
             RETURNING id, audit_record_id",
        )
        .bind(now)
        .bind(id)
        .bind(now)
        .fetch_optional(self.db.pool())
        .await?;

        if let Some(row) = row {
            self.after_expiry(&[row]).await?;
        }
        Ok(())
    }

    async fn expire_matching(&self, user_id: &str, tool_name: &str, args_hash: &str) -> Result<(), AgentError> {
        let now = now_millis();
        let rows = sqlx::query(
            "UPDATE pending_confirmations SET status = 'expired', resolved_at = ?
             WHERE user_id = ? AND tool_name = ? AND args_hash = ?
               AND status = 'pending' AND expires_at <= ?
             RETURNING id, audit_record_id",
        )
        .bind(now)
        .bind(user_id)
        .bind(tool_name)
        .bind(args_hash)
        .bind(now)
        .fetch_all(self.db.pool())
        .await?;

        self.after_expiry(&rows).await
    }

    /// 把所有已过期的 pending 翻转为 expired，返回翻转条数；不触碰其他终态记录
    pub async fn sweep_expired(&self) -> Result<usize, AgentError> {
        let now = now_millis();
        let rows = sqlx::query(
            "UPDATE pending_confirmations SET status = 'expired', resolved_at = ?
             WHERE status = 'pending' AND expires_at <= ?
             RETURNING id, audit_record_id",
        )
        .bind(now)
        .bind(now)
        .fetch_all(self.db.pool())
        .await?;

        self.after_expiry(&rows).await?;
        if !rows.is_empty() {
            tracing::info!("Swept {} expired confirmation(s)", rows.len());
        }
        Ok(rows.len())
    }

    async fn after_expiry(&self, rows: &[SqliteRow]) -> Result<(), AgentError> {
        for row in rows {
            let id: String = row.get("id");
            let audit_record_id: String = row.get("audit_record_id");
            tracing::warn!(confirmation_id = %id, "Confirmation expired");
            self.resolve_parked(
                &audit_record_id,
                ErrorBody::new("CONFIRMATION_EXPIRED", format!("confirmation {} has expired", id)),
            )
            .await?;
        }
        Ok(())
    }

    async fn resolve_parked(&self, audit_record_id: &str, error: ErrorBody) -> Result<(), AgentError> {
        match self
            .ledger
            .record_resolution(audit_record_id, Resolution::Rejected(error))
            .await
        {
            Ok(()) | Err(AgentError::RecordFinalized(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// 越权操作单独记一条 rejected 审计，不影响原记录
    async fn audit_forbidden(
        &self,
        confirmation: &PendingConfirmation,
        caller: &str,
        target: ConfirmationStatus,
    ) -> Result<(), AgentError> {
        let ctx = RequestContext::new(caller);
        let action = if target == ConfirmationStatus::Confirmed {
            "confirm"
        } else {
            "reject"
        };
        let args = serde_json::json!({
            "confirmation_id": confirmation.id,
            "action": action,
        });
        let record_id = self
            .ledger
            .record_attempt(&ctx, &confirmation.tool_name, &args)
            .await?;
        self.ledger
            .record_resolution(
                &record_id,
                Resolution::Rejected(ErrorBody::new(
                    "FORBIDDEN",
                    format!("user {} may not {} confirmation {}", caller, action, confirmation.id),
                )),
            )
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<PendingConfirmation>, AgentError> {
        let sql = format!("{} WHERE id = ?", SELECT_CONFIRMATION);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.as_ref().map(row_to_confirmation))
    }

    /// 用户仍可确认的记录（先做一次惰性清扫）
    pub async fn list_pending(&self, user_id: &str) -> Result<Vec<PendingConfirmation>, AgentError> {
        self.sweep_expired().await?;

        let sql = format!(
            "{} WHERE user_id = ? AND status = 'pending' ORDER BY created_at DESC, rowid DESC",
            SELECT_CONFIRMATION
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows.iter().map(row_to_confirmation).collect())
    }
}
