//! OpenAI 兼容后端 + RetryExecutor：对本地假上游计数，验证 HTTP 请求次数只由重试策略决定

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Router;
use serde_json::json;

use taskmate::llm::{BackendError, OpenAiBackend, RetryExecutor, RetryPolicy};
use taskmate::memory::ConversationContext;
use taskmate::AgentError;

/// 启动一个总是返回固定状态码的上游，返回地址与命中计数
async fn spawn_upstream(status: StatusCode, body: serde_json::Value) -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new().fallback(move || {
        let counter = counter.clone();
        let body = body.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            (status, axum::Json(body)).into_response()
        }
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits)
}

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter_factor: 0.0,
        attempt_timeout: Duration::from_secs(4),
    }
}

fn backend(addr: SocketAddr) -> Arc<OpenAiBackend> {
    Arc::new(OpenAiBackend::new(
        Some(&format!("http://{addr}/v1")),
        "test-model",
        "sk-test",
        "[]",
    ))
}

#[tokio::test]
async fn test_server_errors_hit_upstream_once_per_attempt() {
    let (addr, hits) = spawn_upstream(
        StatusCode::SERVICE_UNAVAILABLE,
        json!({"error": {"message": "upstream overloaded"}}),
    )
    .await;
    let executor = RetryExecutor::new(backend(addr), policy(3));

    let started = Instant::now();
    let err = executor
        .call(&ConversationContext::empty("conv-1", "u1"))
        .await
        .unwrap_err();

    match err {
        AgentError::TransientBackend { attempts, source } => {
            assert_eq!(attempts, 3);
            assert!(matches!(source, BackendError::Server(_)), "got {source:?}");
        }
        other => panic!("Expected TransientBackend, got {other:?}"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_single_attempt_policy_sends_one_request() {
    let (addr, hits) = spawn_upstream(
        StatusCode::TOO_MANY_REQUESTS,
        json!({"error": {"message": "Rate limit reached", "type": "requests"}}),
    )
    .await;
    let executor = RetryExecutor::new(backend(addr), policy(1));

    let err = executor
        .call(&ConversationContext::empty("conv-1", "u1"))
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            AgentError::TransientBackend {
                attempts: 1,
                source: BackendError::RateLimited(_)
            }
        ),
        "got {err:?}"
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
