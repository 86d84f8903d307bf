use async_trait::async_trait;
use serde::{
    de::{self, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::provider::{LLMProvider, LLMProviderAPIKeys};

/// Reasoning-capable models bracket their preamble with these markers so the
/// downstream stream parser sees a single token protocol no matter which
/// provider produced the tokens.
pub const START_THINKING_TOKEN: &str = "<think>";
pub const END_THINKING_TOKEN: &str = "</think>";

#[derive(Debug, Clone, PartialEq, Hash, Eq)]
pub enum LLMType {
    Gpt4o,
    Gpt4oMini,
    O3Mini,
    ClaudeOpus,
    ClaudeSonnet,
    ClaudeHaiku,
    DeepSeekR1,
    Custom(String),
}

impl Serialize for LLMType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            LLMType::Custom(s) => serializer.serialize_str(s),
            _ => serializer.serialize_str(&format!("{:?}", self)),
        }
    }
}

impl<'de> Deserialize<'de> for LLMType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct LLMTypeVisitor;

        impl<'de> Visitor<'de> for LLMTypeVisitor {
            type Value = LLMType;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a string representing an LLMType")
            }

            fn visit_str<E>(self, value: &str) -> Result<LLMType, E>
            where
                E: de::Error,
            {
                match value {
                    "Gpt4o" => Ok(LLMType::Gpt4o),
                    "Gpt4oMini" => Ok(LLMType::Gpt4oMini),
                    "O3Mini" => Ok(LLMType::O3Mini),
                    "ClaudeOpus" => Ok(LLMType::ClaudeOpus),
                    "ClaudeSonnet" => Ok(LLMType::ClaudeSonnet),
                    "ClaudeHaiku" => Ok(LLMType::ClaudeHaiku),
                    "DeepSeekR1" => Ok(LLMType::DeepSeekR1),
                    _ => Ok(LLMType::Custom(value.to_string())),
                }
            }
        }

        deserializer.deserialize_string(LLMTypeVisitor)
    }
}

impl LLMType {
    pub fn is_openai(&self) -> bool {
        matches!(
            self,
            LLMType::Gpt4o | LLMType::Gpt4oMini | LLMType::O3Mini
        )
    }

    pub fn is_anthropic(&self) -> bool {
        matches!(
            self,
            LLMType::ClaudeOpus | LLMType::ClaudeSonnet | LLMType::ClaudeHaiku
        )
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, LLMType::Custom(_))
    }

    /// Models which emit a `<think>` preamble before their final answer.
    pub fn is_reasoning_model(&self) -> bool {
        matches!(self, LLMType::O3Mini | LLMType::DeepSeekR1)
    }

    pub fn provider(&self) -> LLMProvider {
        if self.is_anthropic() {
            LLMProvider::Anthropic
        } else if self.is_openai() {
            LLMProvider::OpenAI
        } else {
            LLMProvider::OpenAICompatible
        }
    }
}

impl fmt::Display for LLMType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LLMType::Custom(s) => write!(f, "{}", s),
            _ => write!(f, "{:?}", self),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub enum LLMClientRole {
    System,
    User,
    Assistant,
}

impl LLMClientRole {
    pub fn is_system(&self) -> bool {
        matches!(self, LLMClientRole::System)
    }

    pub fn is_user(&self) -> bool {
        matches!(self, LLMClientRole::User)
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, LLMClientRole::Assistant)
    }

    pub fn to_string(&self) -> String {
        match self {
            LLMClientRole::System => "system".to_owned(),
            LLMClientRole::User => "user".to_owned(),
            LLMClientRole::Assistant => "assistant".to_owned(),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct LLMClientMessage {
    role: LLMClientRole,
    message: String,
}

impl LLMClientMessage {
    pub fn new(role: LLMClientRole, message: String) -> Self {
        Self { role, message }
    }

    pub fn system(message: String) -> Self {
        Self::new(LLMClientRole::System, message)
    }

    pub fn user(message: String) -> Self {
        Self::new(LLMClientRole::User, message)
    }

    pub fn assistant(message: String) -> Self {
        Self::new(LLMClientRole::Assistant, message)
    }

    pub fn role(&self) -> &LLMClientRole {
        &self.role
    }

    pub fn content(&self) -> &str {
        &self.message
    }

    pub fn concat_message(&mut self, message: &str) {
        self.message = self.message.to_owned() + "\n" + message;
    }
}

#[derive(Clone, Debug)]
pub struct LLMClientCompletionRequest {
    model: LLMType,
    messages: Vec<LLMClientMessage>,
    temperature: f32,
    frequency_penalty: Option<f32>,
    stop_words: Option<Vec<String>>,
    max_tokens: Option<usize>,
    thinking: bool,
}

impl LLMClientCompletionRequest {
    pub fn new(
        model: LLMType,
        messages: Vec<LLMClientMessage>,
        temperature: f32,
        frequency_penalty: Option<f32>,
    ) -> Self {
        Self {
            model,
            messages,
            temperature,
            frequency_penalty,
            stop_words: None,
            max_tokens: None,
            thinking: false,
        }
    }

    pub fn from_messages(messages: Vec<LLMClientMessage>, model: LLMType) -> Self {
        Self::new(model, messages, 0.0, None)
    }

    /// Anthropic needs strictly alternating user and assistant turns, so
    /// adjacent messages with the same role are compressed into one.
    pub fn fix_message_structure(mut self) -> Self {
        if self.model().is_anthropic() {
            let messages = std::mem::take(&mut self.messages);
            let mut final_messages: Vec<LLMClientMessage> = vec![];
            for message in messages {
                match final_messages.last_mut() {
                    Some(last) if last.role() == message.role() => {
                        last.concat_message(message.content());
                    }
                    _ => final_messages.push(message),
                }
            }
            self.messages = final_messages;
        }
        self
    }

    pub fn set_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn set_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn set_stop_words(mut self, stop_words: Vec<String>) -> Self {
        self.stop_words = Some(stop_words);
        self
    }

    pub fn set_thinking(mut self, thinking: bool) -> Self {
        self.thinking = thinking;
        self
    }

    pub fn model(&self) -> &LLMType {
        &self.model
    }

    pub fn messages(&self) -> &[LLMClientMessage] {
        self.messages.as_slice()
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn frequency_penalty(&self) -> Option<f32> {
        self.frequency_penalty
    }

    pub fn stop_words(&self) -> Option<&[String]> {
        self.stop_words.as_deref()
    }

    pub fn get_max_tokens(&self) -> Option<usize> {
        self.max_tokens
    }

    pub fn thinking(&self) -> bool {
        self.thinking
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct LLMClientUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl LLMClientUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn merge(&mut self, other: &LLMClientUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone)]
pub struct LLMClientCompletionResponse {
    answer_up_until_now: String,
    delta: Option<String>,
    model: String,
    usage: Option<LLMClientUsage>,
}

impl LLMClientCompletionResponse {
    pub fn new(answer_up_until_now: String, delta: Option<String>, model: String) -> Self {
        Self {
            answer_up_until_now,
            delta,
            model,
            usage: None,
        }
    }

    pub fn set_usage(mut self, usage: LLMClientUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn get_answer_up_until_now(self) -> String {
        self.answer_up_until_now
    }

    pub fn answer_up_until_now(&self) -> &str {
        &self.answer_up_until_now
    }

    pub fn delta(&self) -> Option<&str> {
        self.delta.as_deref()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn usage(&self) -> Option<&LLMClientUsage> {
        self.usage.as_ref()
    }
}

#[derive(Error, Debug)]
pub enum LLMClientError {
    #[error("Failed to get response from LLM")]
    FailedToGetResponse,

    #[error("Reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("serde failed: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("send error over channel")]
    SendError(#[from] tokio::sync::mpsc::error::SendError<LLMClientCompletionResponse>),

    #[error("unsupported model")]
    UnSupportedModel,

    #[error("wrong api key type for provider")]
    WrongAPIKeyType,

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    #[error("invalid api key")]
    InvalidAPIKey,

    #[error("input context too long for model")]
    ContextLengthExceeded,

    #[error("provider returned {0}: {1}")]
    UpstreamError(u16, String),
}

impl LLMClientError {
    /// Maps a non-success HTTP status from a provider into the classified
    /// error kinds the orchestrator knows how to surface.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => LLMClientError::InvalidAPIKey,
            429 => LLMClientError::RateLimitExceeded,
            413 => LLMClientError::ContextLengthExceeded,
            _ => LLMClientError::UpstreamError(status, body),
        }
    }
}

#[async_trait]
pub trait LLMClient {
    fn client(&self) -> &LLMProvider;

    async fn stream_completion(
        &self,
        api_key: LLMProviderAPIKeys,
        request: LLMClientCompletionRequest,
        sender: UnboundedSender<LLMClientCompletionResponse>,
    ) -> Result<LLMClientCompletionResponse, LLMClientError>;

    async fn completion(
        &self,
        api_key: LLMProviderAPIKeys,
        request: LLMClientCompletionRequest,
    ) -> Result<String, LLMClientError>;
}

#[cfg(test)]
mod tests {
    use super::{LLMClientCompletionRequest, LLMClientMessage, LLMType};

    #[test]
    fn test_llm_type_custom_round_trip() {
        let llm_type = LLMType::Custom("mistral-large".to_owned());
        let serialized = serde_json::to_string(&llm_type).expect("to work");
        assert_eq!(serialized, "\"mistral-large\"");
        let parsed: LLMType = serde_json::from_str(&serialized).expect("to work");
        assert_eq!(parsed, llm_type);
    }

    #[test]
    fn test_fix_message_structure_compresses_adjacent_roles() {
        let request = LLMClientCompletionRequest::from_messages(
            vec![
                LLMClientMessage::user("first".to_owned()),
                LLMClientMessage::user("second".to_owned()),
                LLMClientMessage::assistant("reply".to_owned()),
            ],
            LLMType::ClaudeSonnet,
        )
        .fix_message_structure();
        assert_eq!(request.messages().len(), 2);
        assert_eq!(request.messages()[0].content(), "first\nsecond");
    }
}
