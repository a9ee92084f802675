//! 审计账本
//!
//! 每次工具调用先写 attempted 记录（早于任何副作用），副作用落定后写入终态，且只写一次。
//! 进程在两次写入之间崩溃会留下永久的 attempted 记录：账本只把它暴露为异常，
//! 从不自动重试。

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};

use crate::core::{AgentError, ErrorBody, RequestContext};
use crate::memory::sqlite::{from_millis, now_millis};
use crate::memory::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Attempted,
    Succeeded,
    Failed,
    Rejected,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallStatus::Attempted => "attempted",
            ToolCallStatus::Succeeded => "succeeded",
            ToolCallStatus::Failed => "failed",
            ToolCallStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "attempted" => Some(ToolCallStatus::Attempted),
            "succeeded" => Some(ToolCallStatus::Succeeded),
            "failed" => Some(ToolCallStatus::Failed),
            "rejected" => Some(ToolCallStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ToolCallStatus::Attempted)
    }
}

impl fmt::Display for ToolCallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 审计单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub conversation_id: Option<String>,
    pub user_id: String,
    pub trace_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub status: ToolCallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// 被挂起等待确认的调用所关联的确认 id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_id: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// 终态写入内容
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Succeeded(Value),
    Failed(ErrorBody),
    Rejected(ErrorBody),
}

impl Resolution {
    pub fn status(&self) -> ToolCallStatus {
        match self {
            Resolution::Succeeded(_) => ToolCallStatus::Succeeded,
            Resolution::Failed(_) => ToolCallStatus::Failed,
            Resolution::Rejected(_) => ToolCallStatus::Rejected,
        }
    }
}

/// 查询过滤条件；全部为空即不过滤
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub tool_name: Option<String>,
    pub status: Option<ToolCallStatus>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
}

/// 某用户在时间范围内的工具调用统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageStats {
    pub user_id: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub error_calls: u64,
    pub rejected_calls: u64,
    /// 仍停留在 attempted（含等待确认）的调用
    pub pending_calls: u64,
    pub tool_usage_breakdown: BTreeMap<String, u64>,
    /// attempted 到终态的平均耗时；经过确认的调用不计入（含用户等待时间）
    pub average_execution_time_ms: Option<f64>,
    pub success_rate: f64,
}

#[derive(Clone, Debug)]
pub struct AuditLedger {
    db: Database,
}

const SELECT_RECORDS: &str = "SELECT r.id, r.conversation_id, r.user_id, r.trace_id, r.tool_name,
        r.arguments, r.status, r.result, r.error_code, r.error_message,
        r.requested_at, r.resolved_at, c.id AS confirmation_id
     FROM tool_call_records r
     LEFT JOIN pending_confirmations c ON c.audit_record_id = r.id";

fn row_to_record(row: &SqliteRow) -> ToolCallRecord {
    let arguments: String = row.get("arguments");
    let status: String = row.get("status");
    let result: Option<String> = row.get("result");
    let error_code: Option<String> = row.get("error_code");
    let error_message: Option<String> = row.get("error_message");
    let resolved_at: Option<i64> = row.get("resolved_at");
    let id: String = row.get("id");

    let status = ToolCallStatus::parse(&status).unwrap_or_else(|| {
        tracing::warn!(record_id = %id, "Unknown tool call status '{}', reading as attempted", status);
        ToolCallStatus::Attempted
    });

    ToolCallRecord {
        id,
        conversation_id: row.get("conversation_id"),
        user_id: row.get("user_id"),
        trace_id: row.get("trace_id"),
        tool_name: row.get("tool_name"),
        arguments: serde_json::from_str(&arguments).unwrap_or(Value::Null),
        status,
        result: result.and_then(|s| serde_json::from_str(&s).ok()),
        error: error_code.map(|code| ErrorBody::new(code, error_message.unwrap_or_default())),
        confirmation_id: row.get("confirmation_id"),
        requested_at: from_millis(row.get("requested_at")),
        resolved_at: resolved_at.map(from_millis),
    }
}

impl AuditLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// 写入 attempted 记录，返回记录 id；必须在副作用之前调用
    pub async fn record_attempt(
        &self,
        ctx: &RequestContext,
        tool_name: &str,
        arguments: &Value,
    ) -> Result<String, AgentError> {
        let id = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO tool_call_records
                (id, conversation_id, user_id, trace_id, tool_name, arguments, status, requested_at)
             VALUES (?, ?, ?, ?, ?, ?, 'attempted', ?)",
        )
        .bind(&id)
        .bind(&ctx.conversation_id)
        .bind(&ctx.user_id)
        .bind(&ctx.trace_id)
        .bind(tool_name)
        .bind(arguments.to_string())
        .bind(now_millis())
        .execute(self.db.pool())
        .await?;

        Ok(id)
    }

    /// 写入终态；记录已是终态时返回 RecordFinalized
    pub async fn record_resolution(&self, id: &str, resolution: Resolution) -> Result<(), AgentError> {
        let (result, error) = match &resolution {
            Resolution::Succeeded(v) => (Some(v.to_string()), None),
            Resolution::Failed(e) | Resolution::Rejected(e) => (None, Some(e)),
        };

        let updated = sqlx::query(
            "UPDATE tool_call_records
             SET status = ?, result = ?, error_code = ?, error_message = ?, resolved_at = ?
             WHERE id = ? AND status = 'attempted'",
        )
        .bind(resolution.status().as_str())
        .bind(result)
        .bind(error.map(|e| e.code.as_str()))
        .bind(error.map(|e| e.message.as_str()))
        .bind(now_millis())
        .bind(id)
        .execute(self.db.pool())
        .await?;

        if updated.rows_affected() == 0 {
            return match self.get(id).await? {
                Some(_) => Err(AgentError::RecordFinalized(id.to_string())),
                None => Err(AgentError::not_found("audit record", id)),
            };
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<ToolCallRecord>, AgentError> {
        let sql = format!("{} WHERE r.id = ?", SELECT_RECORDS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.as_ref().map(row_to_record))
    }

    /// 按过滤条件分页查询，最新的在前
    pub async fn query(
        &self,
        filter: &AuditFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ToolCallRecord>, AgentError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_RECORDS);
        qb.push(" WHERE 1 = 1");

        if let Some(tool_name) = &filter.tool_name {
            qb.push(" AND r.tool_name = ").push_bind(tool_name.clone());
        }
        if let Some(status) = filter.status {
            qb.push(" AND r.status = ").push_bind(status.as_str());
        }
        if let Some(start) = filter.start {
            qb.push(" AND r.requested_at >= ").push_bind(start.timestamp_millis());
        }
        if let Some(end) = filter.end {
            qb.push(" AND r.requested_at <= ").push_bind(end.timestamp_millis());
        }
        if let Some(user_id) = &filter.user_id {
            qb.push(" AND r.user_id = ").push_bind(user_id.clone());
        }
        if let Some(conversation_id) = &filter.conversation_id {
            qb.push(" AND r.conversation_id = ").push_bind(conversation_id.clone());
        }

        qb.push(" ORDER BY r.requested_at DESC, r.rowid DESC LIMIT ")
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(i64::from(offset));

        let rows = qb.build().fetch_all(self.db.pool()).await?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    /// 按用户与 requested_at 范围聚合统计
    pub async fn usage_stats(
        &self,
        user_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<UsageStats, AgentError> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(AgentError::Validation(format!(
                    "start {} is after end {}",
                    start.to_rfc3339(),
                    end.to_rfc3339()
                )));
            }
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN r.status = 'succeeded' THEN 1 ELSE 0 END), 0) AS succeeded,
                COALESCE(SUM(CASE WHEN r.status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                COALESCE(SUM(CASE WHEN r.status = 'rejected' THEN 1 ELSE 0 END), 0) AS rejected,
                COALESCE(SUM(CASE WHEN r.status = 'attempted' THEN 1 ELSE 0 END), 0) AS attempted,
                AVG(CASE WHEN r.resolved_at IS NOT NULL AND NOT EXISTS (
                        SELECT 1 FROM pending_confirmations p WHERE p.audit_record_id = r.id
                    ) THEN r.resolved_at - r.requested_at END) AS avg_ms
             FROM tool_call_records r",
        );
        push_user_range(&mut qb, user_id, start, end);
        let totals = qb.build().fetch_one(self.db.pool()).await?;

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT r.tool_name, COUNT(*) AS calls FROM tool_call_records r");
        push_user_range(&mut qb, user_id, start, end);
        qb.push(" GROUP BY r.tool_name");
        let per_tool = qb.build().fetch_all(self.db.pool()).await?;

        let count = |column: &str| totals.get::<i64, _>(column).max(0) as u64;
        let total_calls = count("total");
        let successful_calls = count("succeeded");
        let success_rate = if total_calls == 0 {
            0.0
        } else {
            successful_calls as f64 / total_calls as f64
        };

        Ok(UsageStats {
            user_id: user_id.to_string(),
            start,
            end,
            total_calls,
            successful_calls,
            error_calls: count("failed"),
            rejected_calls: count("rejected"),
            pending_calls: count("attempted"),
            tool_usage_breakdown: per_tool
                .iter()
                .map(|row| (row.get("tool_name"), row.get::<i64, _>("calls").max(0) as u64))
                .collect(),
            average_execution_time_ms: totals.get("avg_ms"),
            success_rate,
        })
    }

    /// 停留在 attempted 超过 older_than 的记录（挂在未过期待确认后面的除外）
    pub async fn anomalies(&self, older_than: Duration) -> Result<Vec<ToolCallRecord>, AgentError> {
        let cutoff = now_millis() - older_than.as_millis() as i64;
        let sql = format!(
            "{} WHERE r.status = 'attempted' AND r.requested_at <= ?
               AND NOT EXISTS (
                 SELECT 1 FROM pending_confirmations p
                 WHERE p.audit_record_id = r.id AND p.status = 'pending' AND p.expires_at > ?
               )
             ORDER BY r.requested_at ASC",
            SELECT_RECORDS
        );

        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .bind(now_millis())
            .fetch_all(self.db.pool())
            .await?;

        let records: Vec<ToolCallRecord> = rows.iter().map(row_to_record).collect();
        if !records.is_empty() {
            tracing::warn!("{} tool call(s) stuck in attempted state", records.len());
        }
        Ok(records)
    }
}

fn push_user_range(
    qb: &mut QueryBuilder<'_, Sqlite>,
    user_id: &str,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) {
    qb.push(" WHERE r.user_id = ").push_bind(user_id.to_string());
    if let Some(start) = start {
        qb.push(" AND r.requested_at >= ").push_bind(start.timestamp_millis());
    }
    if let Some(end) = end {
        qb.push(" AND r.requested_at <= ").push_bind(end.timestamp_millis());
    }
}
