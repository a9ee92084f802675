//! OpenAI 兼容推理后端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url；DeepSeek、OpenAI、自建代理等）。
//! system prompt 注入工具 schema，要求模型只输出一个 JSON 对象；
//! parse_inference 从回复中提取 JSON（```json 块或裸 JSON），无法解析即为永久错误。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;

use crate::llm::{BackendError, Inference, ReasoningBackend};
use crate::memory::{ContextRole, ConversationContext};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";

/// OpenAI 兼容后端：持有 Client、model 名与拼好的 system prompt
pub struct OpenAiBackend {
    client: Client<OpenAIConfig>,
    model: String,
    system_prompt: String,
}

impl OpenAiBackend {
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str, tool_schema_json: &str) -> Self {
        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        // 单次 infer 只发一次 HTTP 请求；重试次数与退避只由 RetryExecutor 决定
        let no_retry = ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(Duration::ZERO))
            .build();

        Self {
            client: Client::with_config(config).with_backoff(no_retry),
            model: model.to_string(),
            system_prompt: build_system_prompt(tool_schema_json),
        }
    }

    fn to_openai_messages(
        &self,
        context: &ConversationContext,
    ) -> Result<Vec<ChatCompletionRequestMessage>, BackendError> {
        let bad = |e: async_openai::error::OpenAIError| BackendError::MalformedRequest(e.to_string());

        let mut out = Vec::with_capacity(context.messages.len() + 1);
        out.push(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(self.system_prompt.clone())
                .build()
                .map_err(bad)?,
        ));

        for m in &context.messages {
            let msg = match m.role {
                ContextRole::Summary => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(bad)?,
                ),
                ContextRole::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(bad)?,
                ),
                ContextRole::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(bad)?,
                ),
            };
            out.push(msg);
        }
        Ok(out)
    }
}

#[async_trait]
impl ReasoningBackend for OpenAiBackend {
    async fn infer(&self, context: &ConversationContext) -> Result<Inference, BackendError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(context)?)
            .build()
            .map_err(|e| BackendError::MalformedRequest(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| BackendError::classify(&e.to_string()))?;

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        parse_inference(&content)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

fn build_system_prompt(tool_schema_json: &str) -> String {
    format!(
        "You are a todo assistant. You manage the user's tasks only through the tools below.\n\
         Never include a user_id in tool arguments; the server supplies it.\n\
         Reply with exactly one JSON object and nothing else:\n\
         {{\"intent\": \"<short intent>\", \"reply\": \"<message for the user>\", \
         \"tool_calls\": [{{\"tool_name\": \"<tool>\", \"arguments\": {{...}}}}]}}\n\
         Use an empty tool_calls list when no tool is needed.\n\n\
         Available tools:\n{tool_schema_json}"
    )
}

/// 解析模型输出：提取 JSON 块并反序列化为 Inference；纯文本视为无工具调用的回复
pub fn parse_inference(output: &str) -> Result<Inference, BackendError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(BackendError::MalformedResponse("empty completion".to_string()));
    }

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            &trimmed[start..=end]
        } else {
            trimmed
        }
    } else {
        return Ok(Inference::reply_only("chat", trimmed));
    };

    serde_json::from_str::<Inference>(json_str)
        .map_err(|e| BackendError::MalformedResponse(format!("{}: {}", e, json_str)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_json() {
        let out = "Sure.\n```json\n{\"intent\": \"add\", \"reply\": \"Added.\", \"tool_calls\": [{\"tool_name\": \"add_task\", \"arguments\": {\"title\": \"milk\"}}]}\n```";
        let inference = parse_inference(out).unwrap();
        assert_eq!(inference.intent, "add");
        assert_eq!(inference.proposed_tool_calls[0].tool_name, "add_task");
    }

    #[test]
    fn test_parse_bare_json_without_calls() {
        let inference = parse_inference(r#"{"intent": "greet", "reply": "Hello!"}"#).unwrap();
        assert!(inference.proposed_tool_calls.is_empty());
        assert_eq!(inference.reply.as_deref(), Some("Hello!"));
    }

    #[test]
    fn test_plain_text_is_a_reply() {
        let inference = parse_inference("Hi, how can I help?").unwrap();
        assert_eq!(inference.intent, "chat");
        assert!(inference.proposed_tool_calls.is_empty());
    }

    #[test]
    fn test_broken_json_is_permanent() {
        let err = parse_inference(r#"{"intent": "add", "tool_calls": [}"#).unwrap_err();
        assert!(matches!(err, BackendError::MalformedResponse(_)));
        assert!(!err.is_transient());
        assert!(parse_inference("   ").is_err());
    }

    #[test]
    fn test_system_prompt_lists_tools() {
        let prompt = build_system_prompt("[{\"name\": \"delete_task\"}]");
        assert!(prompt.contains("delete_task"));
        assert!(prompt.contains("tool_calls"));
    }
}
