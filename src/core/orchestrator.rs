//! 主控编排：单个请求的完整处理流程
//!
//! 解析/创建会话 -> 重建上下文 -> 持久化用户消息 -> 调用后端（带重试与总超时）
//! -> 逐个分发工具调用 -> 持久化助手消息 -> 返回。
//! 编排器不持有任何跨请求的可变状态，所有状态都在存储中。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::confirmation::PendingConfirmation;
use crate::core::{AgentError, RequestContext};
use crate::llm::RetryExecutor;
use crate::memory::{ContextReconstructor, ConversationContext, ConversationStore, Message, NewMessage};
use crate::tools::{Dispatcher, ToolOutcome};

/// 单条用户消息的最大字符数
pub const MAX_MESSAGE_CHARS: usize = 10_000;

/// handle 的返回
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub conversation_id: String,
    /// 助手消息 id
    pub message_id: String,
    pub intent: String,
    pub response_text: String,
    pub tool_outcomes: Vec<ToolOutcome>,
    pub pending_confirmations: Vec<PendingConfirmation>,
    pub trace_id: String,
}

pub struct AgentOrchestrator {
    conversations: Arc<dyn ConversationStore>,
    reconstructor: ContextReconstructor,
    executor: RetryExecutor,
    dispatcher: Arc<Dispatcher>,
    /// 单个请求内后端调用（含重试）的总时限
    total_timeout: Duration,
}

impl AgentOrchestrator {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        reconstructor: ContextReconstructor,
        executor: RetryExecutor,
        dispatcher: Arc<Dispatcher>,
        total_timeout: Duration,
    ) -> Self {
        Self {
            conversations,
            reconstructor,
            executor,
            dispatcher,
            total_timeout,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub async fn handle(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        message: &str,
    ) -> Result<ChatResponse, AgentError> {
        self.handle_with_cancel(user_id, conversation_id, message, &CancellationToken::new())
            .await
    }

    /// 处理一条入站消息；cancel 只中止在途的后端调用
    pub async fn handle_with_cancel(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, AgentError> {
        validate_message(user_id, message)?;

        let mut context = match conversation_id {
            Some(id) => self.reconstructor.reconstruct(id, user_id).await?,
            None => {
                let conversation = self.conversations.create_conversation(user_id).await?;
                ConversationContext::empty(conversation.id, user_id)
            }
        };
        let conversation_id = context.conversation_id.clone();
        let ctx = RequestContext::new(user_id).with_conversation(&conversation_id);

        tracing::info!(
            trace_id = %ctx.trace_id,
            conversation_id = %conversation_id,
            "Handling message ({} prior messages, {} summarized)",
            context.total_messages,
            context.summarized_count
        );

        let inbound = self
            .conversations
            .append_message(&conversation_id, NewMessage::user(message))
            .await?;
        context.push(&inbound);

        let inference = match tokio::time::timeout(
            self.total_timeout,
            self.executor.call_with_cancel(&context, cancel),
        )
        .await
        {
            Ok(Ok(inference)) => inference,
            Ok(Err(e)) => {
                tracing::warn!(trace_id = %ctx.trace_id, "Backend call failed: {}", e);
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(
                    trace_id = %ctx.trace_id,
                    "Backend call exceeded request timeout {:?}",
                    self.total_timeout
                );
                return Err(AgentError::RequestTimeout(self.total_timeout));
            }
        };

        let mut tool_outcomes = Vec::with_capacity(inference.proposed_tool_calls.len());
        let mut pending_confirmations = Vec::new();
        for call in &inference.proposed_tool_calls {
            match self
                .dispatcher
                .dispatch(&ctx, &call.tool_name, &call.arguments)
                .await
            {
                Ok(dispatched) => {
                    tool_outcomes.push(dispatched.outcome);
                    if let Some(pending) = dispatched.pending {
                        if !pending_confirmations
                            .iter()
                            .any(|p: &PendingConfirmation| p.id == pending.id)
                        {
                            pending_confirmations.push(pending);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(
                        trace_id = %ctx.trace_id,
                        "Dispatch of {} could not be recorded: {}",
                        call.tool_name,
                        e
                    );
                    tool_outcomes.push(ToolOutcome::unrecorded(&call.tool_name, &e));
                }
            }
        }

        let response_text = compose_response(inference.reply.as_deref(), &tool_outcomes);
        let metadata = serde_json::json!({
            "intent": inference.intent,
            "trace_id": ctx.trace_id,
            "tool_outcomes": tool_outcomes,
            "pending_confirmation_ids": pending_confirmations
                .iter()
                .map(|p| p.id.as_str())
                .collect::<Vec<_>>(),
        });

        let outbound = self
            .conversations
            .append_message(
                &conversation_id,
                NewMessage::assistant(&response_text).with_metadata(metadata),
            )
            .await?;

        Ok(ChatResponse {
            conversation_id,
            message_id: outbound.id,
            intent: inference.intent,
            response_text,
            tool_outcomes,
            pending_confirmations,
            trace_id: ctx.trace_id,
        })
    }

    /// 会话的已存储消息（校验归属）
    pub async fn history(&self, conversation_id: &str, user_id: &str) -> Result<Vec<Message>, AgentError> {
        let conversation = self
            .conversations
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| AgentError::not_found("conversation", conversation_id))?;
        if conversation.user_id != user_id {
            return Err(AgentError::Authorization(format!(
                "conversation {} does not belong to user {}",
                conversation_id, user_id
            )));
        }
        self.conversations.load_messages(conversation_id).await
    }
}

fn validate_message(user_id: &str, message: &str) -> Result<(), AgentError> {
    if user_id.trim().is_empty() {
        return Err(AgentError::Validation("user_id must not be empty".to_string()));
    }
    if message.trim().is_empty() {
        return Err(AgentError::Validation("message must not be empty".to_string()));
    }
    let chars = message.chars().count();
    if chars > MAX_MESSAGE_CHARS {
        return Err(AgentError::Validation(format!(
            "message is {} characters, limit is {}",
            chars, MAX_MESSAGE_CHARS
        )));
    }
    Ok(())
}

/// 后端回复在前，每个工具结果一行
fn compose_response(reply: Option<&str>, outcomes: &[ToolOutcome]) -> String {
    let mut lines: Vec<String> = Vec::with_capacity(outcomes.len() + 1);
    if let Some(reply) = reply.map(str::trim).filter(|r| !r.is_empty()) {
        lines.push(reply.to_string());
    }
    lines.extend(outcomes.iter().map(ToolOutcome::summary));
    if lines.is_empty() {
        "I'm not sure how to help with that.".to_string()
    } else {
        lines.join("\n")
    }
}
