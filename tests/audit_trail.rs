//! 审计账本集成测试：先记后做、崩溃遗留的异常记录、查询过滤

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{call, setup, test_config, FakeTaskStore, HangingTaskStore, SHORT};
use taskmate::core::RequestContext;
use taskmate::llm::ScriptedBackend;
use taskmate::tools::{AuditFilter, OutcomeStatus, ToolCallStatus};

#[tokio::test]
async fn test_interrupted_side_effect_leaves_attempted_record() {
    let app = setup(test_config(), None, Arc::new(HangingTaskStore)).await;
    let dispatcher = app.components.dispatcher();
    let ctx = RequestContext::new("u1").with_conversation("c1");

    let interrupted = tokio::time::timeout(
        SHORT,
        dispatcher.dispatch(&ctx, "add_task", &json!({ "title": "never lands" })),
    )
    .await;
    assert!(interrupted.is_err());

    let records = dispatcher
        .ledger()
        .query(&AuditFilter::default(), 10, 0)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ToolCallStatus::Attempted);
    assert_eq!(records[0].tool_name, "add_task");
    assert_eq!(records[0].trace_id, ctx.trace_id);
    assert!(records[0].resolved_at.is_none());

    let anomalies = dispatcher.ledger().anomalies(Duration::ZERO).await.unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].id, records[0].id);

    // 阈值未到时不算异常
    let anomalies = dispatcher
        .ledger()
        .anomalies(Duration::from_secs(3600))
        .await
        .unwrap();
    assert!(anomalies.is_empty());
}

#[tokio::test]
async fn test_parked_call_is_not_an_anomaly_until_abandoned() {
    let mut cfg = test_config();
    cfg.confirmation.ttl_secs = 0;
    let app = setup(cfg, None, Arc::new(FakeTaskStore::default())).await;
    let dispatcher = app.components.dispatcher();
    let ctx = RequestContext::new("u1");

    let dispatched = dispatcher
        .dispatch(&ctx, "delete_task", &json!({ "task_id": 1 }))
        .await
        .unwrap();
    let audit_id = dispatched.outcome.audit_record_id.clone().unwrap();

    // 已过期但尚未清扫：记录仍是 attempted，且不再受保护
    let anomalies = dispatcher.ledger().anomalies(Duration::ZERO).await.unwrap();
    assert_eq!(anomalies.len(), 1);

    // 清扫后记录被终结为 rejected
    dispatcher.confirmations().sweep_expired().await.unwrap();
    let record = dispatcher.ledger().get(&audit_id).await.unwrap().unwrap();
    assert_eq!(record.status, ToolCallStatus::Rejected);
    assert!(dispatcher
        .ledger()
        .anomalies(Duration::ZERO)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_live_parked_call_is_excluded_from_anomalies() {
    let app = setup(test_config(), None, Arc::new(FakeTaskStore::default())).await;
    let dispatcher = app.components.dispatcher();

    let dispatched = dispatcher
        .dispatch(&RequestContext::new("u1"), "delete_task", &json!({ "task_id": 1 }))
        .await
        .unwrap();
    assert_eq!(dispatched.outcome.status, OutcomeStatus::RequiresConfirmation);

    let record = dispatcher
        .ledger()
        .get(dispatched.outcome.audit_record_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ToolCallStatus::Attempted);
    assert_eq!(
        record.confirmation_id.as_deref(),
        dispatched.outcome.confirmation_id.as_deref()
    );
    assert!(dispatcher
        .ledger()
        .anomalies(Duration::ZERO)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_every_proposed_call_is_audited_with_filters() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Ok(call("add_task", json!({ "title": "one" }))),
        Ok(call("add_task", json!({ "title": "two" }))),
        Ok(call("add_task", json!({ "nope": true }))),
        Ok(call("list_tasks", json!({}))),
    ]));
    let app = setup(test_config(), Some(backend), Arc::new(FakeTaskStore::default())).await;
    let orchestrator = &app.components.orchestrator;

    let first = orchestrator.handle("u1", None, "one").await.unwrap();
    let conv = first.conversation_id.clone();
    orchestrator.handle("u1", Some(&conv), "two").await.unwrap();
    orchestrator.handle("u1", Some(&conv), "bad").await.unwrap();
    orchestrator.handle("u2", None, "list").await.unwrap();

    let ledger = app.components.dispatcher().ledger();
    let all = ledger.query(&AuditFilter::default(), 100, 0).await.unwrap();
    assert_eq!(all.len(), 4);
    // 最新的在前
    assert_eq!(all[0].tool_name, "list_tasks");
    assert!(all.iter().all(|r| r.status.is_terminal()));

    let adds = ledger
        .query(
            &AuditFilter {
                tool_name: Some("add_task".into()),
                ..Default::default()
            },
            100,
            0,
        )
        .await
        .unwrap();
    assert_eq!(adds.len(), 3);

    let failed = ledger
        .query(
            &AuditFilter {
                tool_name: Some("add_task".into()),
                status: Some(ToolCallStatus::Failed),
                ..Default::default()
            },
            100,
            0,
        )
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].arguments, json!({ "nope": true }));
    assert_eq!(failed[0].error.as_ref().unwrap().code, "VALIDATION_ERROR");

    let in_conv = ledger
        .query(
            &AuditFilter {
                conversation_id: Some(conv.clone()),
                ..Default::default()
            },
            100,
            0,
        )
        .await
        .unwrap();
    assert_eq!(in_conv.len(), 3);
    assert!(in_conv.iter().all(|r| r.user_id == "u1"));

    let page = ledger.query(&AuditFilter::default(), 2, 2).await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].id, all[2].id);

    let future = ledger
        .query(
            &AuditFilter {
                start: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
                ..Default::default()
            },
            100,
            0,
        )
        .await
        .unwrap();
    assert!(future.is_empty());
}

#[tokio::test]
async fn test_forged_user_id_is_recorded_as_sent() {
    let backend = Arc::new(ScriptedBackend::new(vec![Ok(call(
        "add_task",
        json!({ "title": "x", "user_id": "mallory" }),
    ))]));
    let app = setup(test_config(), Some(backend), Arc::new(FakeTaskStore::default())).await;
    app.components
        .orchestrator
        .handle("alice", None, "add x")
        .await
        .unwrap();

    let records = app
        .components
        .dispatcher()
        .ledger()
        .query(&AuditFilter::default(), 10, 0)
        .await
        .unwrap();
    assert_eq!(records[0].user_id, "alice");
    assert_eq!(records[0].status, ToolCallStatus::Succeeded);
    assert_eq!(records[0].arguments["user_id"], "mallory");
}

/// 让 tool_call_records 只能插入不能更新：终态写入必然失败
async fn freeze_ledger(app: &common::TestApp) {
    sqlx::query(
        "CREATE TRIGGER freeze_ledger BEFORE UPDATE ON tool_call_records
         BEGIN SELECT RAISE(ABORT, 'ledger is frozen'); END",
    )
    .execute(app.db.pool())
    .await
    .unwrap();
}

#[tokio::test]
async fn test_unrecorded_resolution_keeps_audit_id_and_result() {
    let tasks = Arc::new(FakeTaskStore::default());
    let backend = Arc::new(ScriptedBackend::new(vec![Ok(call(
        "add_task",
        json!({ "title": "milk" }),
    ))]));
    let app = setup(test_config(), Some(backend), tasks.clone()).await;
    freeze_ledger(&app).await;

    let response = app
        .components
        .orchestrator
        .handle("u1", None, "add milk")
        .await
        .unwrap();

    let outcome = &response.tool_outcomes[0];
    assert_eq!(outcome.status, OutcomeStatus::Unresolved);
    assert_eq!(outcome.error.as_ref().unwrap().code, "RESOLUTION_UNRECORDED");
    assert_eq!(outcome.result.as_ref().unwrap()["title"], "milk");
    assert_eq!(tasks.calls_of("create").len(), 1);

    let audit_id = outcome.audit_record_id.clone().unwrap();
    let record = app
        .components
        .dispatcher()
        .ledger()
        .get(&audit_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ToolCallStatus::Attempted);
    assert!(response.response_text.contains(&audit_id));
    assert!(!response.response_text.contains("add_task failed"));
}

#[tokio::test]
async fn test_confirmed_call_with_unrecorded_resolution_is_unresolved() {
    let tasks = Arc::new(FakeTaskStore::default());
    let app = setup(test_config(), None, tasks.clone()).await;
    let dispatcher = app.components.dispatcher();
    let ctx = RequestContext::new("u1");

    let parked = dispatcher
        .dispatch(&ctx, "delete_task", &json!({ "task_id": 3 }))
        .await
        .unwrap();
    let pending = parked.pending.unwrap();
    freeze_ledger(&app).await;

    let outcome = dispatcher.confirm(&ctx, &pending.id).await.unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Unresolved);
    assert_eq!(outcome.audit_record_id.as_deref(), Some(pending.audit_record_id.as_str()));
    assert_eq!(outcome.confirmation_id.as_deref(), Some(pending.id.as_str()));
    assert_eq!(tasks.calls_of("delete").len(), 1);
}

#[tokio::test]
async fn test_failed_parking_is_resolved_with_audit_id() {
    let app = setup(test_config(), None, Arc::new(FakeTaskStore::default())).await;
    sqlx::query(
        "CREATE TRIGGER refuse_parking BEFORE INSERT ON pending_confirmations
         BEGIN SELECT RAISE(ABORT, 'parking refused'); END",
    )
    .execute(app.db.pool())
    .await
    .unwrap();
    let dispatcher = app.components.dispatcher();

    let dispatched = dispatcher
        .dispatch(&RequestContext::new("u1"), "delete_task", &json!({ "task_id": 3 }))
        .await
        .unwrap();

    assert!(dispatched.pending.is_none());
    assert_eq!(dispatched.outcome.status, OutcomeStatus::Failed);
    let audit_id = dispatched.outcome.audit_record_id.clone().unwrap();
    let record = dispatcher.ledger().get(&audit_id).await.unwrap().unwrap();
    assert_eq!(record.status, ToolCallStatus::Failed);
    assert_eq!(
        record.error.map(|e| e.code),
        dispatched.outcome.error.map(|e| e.code)
    );
}
