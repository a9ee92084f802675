//! 上下文重建
//!
//! 每次请求都从存储读取完整消息历史，不做任何进程内缓存。
//! 超出 token 预算时，最旧的一段消息被折叠为一条确定性的摘要消息；
//! 对同一份存储数据重复调用，输出逐字节一致。

use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::AgentError;
use crate::memory::{
    ContextMessage, ContextRole, ConversationContext, ConversationStore, Message, TokenEstimator,
};

/// 摘要中每条旧消息保留的字符数
const SUMMARY_LINE_CHARS: usize = 80;

#[derive(Clone)]
pub struct ContextReconstructor {
    store: Arc<dyn ConversationStore>,
    max_context_tokens: usize,
    summary_max_chars: usize,
}

impl ContextReconstructor {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        max_context_tokens: usize,
        summary_max_chars: usize,
    ) -> Self {
        Self {
            store,
            max_context_tokens,
            summary_max_chars,
        }
    }

    pub fn from_config(store: Arc<dyn ConversationStore>, cfg: &AppConfig) -> Self {
        Self::new(
            store,
            cfg.context.max_context_tokens,
            cfg.context.summary_max_chars,
        )
    }

    /// 重建会话上下文；会话不存在返回 NotFound，归属不符返回 Authorization
    pub async fn reconstruct(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<ConversationContext, AgentError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| AgentError::not_found("conversation", conversation_id))?;

        if conversation.user_id != user_id {
            tracing::warn!(
                conversation_id,
                user_id,
                "Conversation ownership mismatch"
            );
            return Err(AgentError::Authorization(format!(
                "conversation {} does not belong to user {}",
                conversation_id, user_id
            )));
        }

        let messages = self.store.load_messages(conversation_id).await?;
        Ok(self.fit_to_budget(conversation_id, user_id, &messages))
    }

    /// 纯函数部分：按预算保留最新消息，其余折叠为摘要
    pub fn fit_to_budget(
        &self,
        conversation_id: &str,
        user_id: &str,
        messages: &[Message],
    ) -> ConversationContext {
        let total = TokenEstimator::estimate_all(messages.iter().map(|m| m.content.as_str()));

        let split = if total <= self.max_context_tokens {
            0
        } else {
            self.split_point(messages)
        };

        let (older, recent) = messages.split_at(split);
        let mut context_messages = Vec::with_capacity(recent.len() + 1);
        if !older.is_empty() {
            context_messages.push(ContextMessage {
                role: ContextRole::Summary,
                content: self.summarize(older),
                seq: None,
            });
        }
        context_messages.extend(recent.iter().map(ContextMessage::from));

        ConversationContext {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            messages: context_messages,
            summarized_count: older.len(),
            total_messages: messages.len(),
        }
    }

    /// 从最新往前累加，直到放不下（预算已扣除摘要预留）；最新一条总是保留
    fn split_point(&self, messages: &[Message]) -> usize {
        let summary_reserve = self.summary_max_chars / 4;
        let budget = self.max_context_tokens.saturating_sub(summary_reserve);

        let mut used = 0;
        let mut split = messages.len();
        for (i, m) in messages.iter().enumerate().rev() {
            let cost = TokenEstimator::estimate(&m.content);
            if used + cost > budget && split < messages.len() {
                break;
            }
            used += cost;
            split = i;
        }
        split
    }

    fn summarize(&self, older: &[Message]) -> String {
        let mut summary = format!("[summary of {} earlier messages]", older.len());
        for m in older {
            let line: String = m.content.chars().take(SUMMARY_LINE_CHARS).collect();
            summary.push('\n');
            summary.push_str(m.role.as_str());
            summary.push_str(": ");
            summary.push_str(line.trim());
        }
        truncate_chars(&summary, self.summary_max_chars)
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
