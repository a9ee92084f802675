//! Mock 推理后端（无需 API）
//!
//! MockBackend：按关键字把最后一条用户消息解析为任务工具调用，便于本地跑通完整流程。
//! ScriptedBackend：按脚本依次返回结果并记录调用次数与收到的上下文，供测试注入瞬时/永久错误。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{BackendError, Inference, ProposedToolCall, ReasoningBackend};
use crate::memory::{ContextRole, ConversationContext};

/// 关键字解析后端
#[derive(Debug, Default)]
pub struct MockBackend;

impl MockBackend {
    /// 解析单条用户输入；识别不了时原样回显
    pub fn interpret(input: &str) -> Inference {
        let text = input.trim();
        let lower = text.to_lowercase();
        let words: Vec<&str> = lower.split_whitespace().collect();

        if let Some(id) = task_id_after(&words, &["delete", "remove"]) {
            return Inference::with_call(
                "delete_task",
                ProposedToolCall::new("delete_task", json!({ "task_id": id })),
            );
        }
        if let Some(id) = task_id_after(&words, &["complete", "finish", "done"]) {
            return Inference::with_call(
                "complete_task",
                ProposedToolCall::new("complete_task", json!({ "task_id": id })),
            );
        }
        if let Some(id) = task_id_after(&words, &["rename"]) {
            if let Some(pos) = lower.find(" to ") {
                let title = text[pos + 4..].trim();
                return Inference::with_call(
                    "update_task",
                    ProposedToolCall::new(
                        "update_task",
                        json!({ "task_id": id, "title": title }),
                    ),
                );
            }
        }
        if matches!(words.first(), Some(&"add") | Some(&"create")) {
            let title = strip_task_prefix(text);
            if !title.is_empty() {
                return Inference::with_call(
                    "add_task",
                    ProposedToolCall::new("add_task", json!({ "title": title })),
                );
            }
        }
        if words.iter().any(|w| *w == "list" || *w == "show")
            && words.iter().any(|w| w.starts_with("task"))
        {
            let status = if words.contains(&"pending") {
                "pending"
            } else if words.contains(&"completed") {
                "completed"
            } else {
                "all"
            };
            return Inference::with_call(
                "list_tasks",
                ProposedToolCall::new("list_tasks", json!({ "status": status })),
            );
        }

        Inference::reply_only("chat", format!("Echo from Mock: {text}"))
    }
}

/// 在 verbs 之一后跟 "task <n>" 时返回 n
fn task_id_after(words: &[&str], verbs: &[&str]) -> Option<i64> {
    let verb_pos = words.iter().position(|w| verbs.contains(w))?;
    let rest = &words[verb_pos + 1..];
    let task_pos = rest.iter().position(|w| w.starts_with("task"))?;
    rest.get(task_pos + 1)
        .map(|w| w.trim_start_matches('#'))
        .and_then(|w| w.parse::<i64>().ok())
}

/// "add a task to buy milk" -> "buy milk"
fn strip_task_prefix(text: &str) -> String {
    let mut rest: Vec<&str> = text.split_whitespace().skip(1).collect();
    for filler in ["a", "new", "task", "tasks", "to"] {
        if rest
            .first()
            .is_some_and(|w| w.eq_ignore_ascii_case(filler))
        {
            rest.remove(0);
        }
    }
    rest.join(" ")
}

#[async_trait]
impl ReasoningBackend for MockBackend {
    async fn infer(&self, context: &ConversationContext) -> Result<Inference, BackendError> {
        let last_user = context
            .messages
            .iter()
            .rev()
            .find(|m| m.role == ContextRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(Self::interpret(last_user))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// 脚本化后端：依次弹出预设结果，脚本用尽后返回空回复
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<Inference, BackendError>>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<ConversationContext>>,
    delay: Option<Duration>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Result<Inference, BackendError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    /// 每次调用前先等待 delay（用于超时与取消测试）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, result: Result<Inference, BackendError>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次调用收到的上下文（按调用顺序）
    pub fn seen_contexts(&self) -> Vec<ConversationContext> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ReasoningBackend for ScriptedBackend {
    async fn infer(&self, context: &ConversationContext) -> Result<Inference, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(context.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        next.unwrap_or_else(|| Ok(Inference::reply_only("chat", "ok")))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
