use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::provider::{LLMProvider, LLMProviderAPIKeys};

use super::types::{
    LLMClient, LLMClientCompletionRequest, LLMClientCompletionResponse, LLMClientError,
    LLMClientUsage, LLMType, END_THINKING_TOKEN, START_THINKING_TOKEN,
};

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct AnthropicMessage {
    role: String,
    content: String,
}

impl AnthropicMessage {
    pub fn new(role: String, content: String) -> Self {
        Self { role, content }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageData },
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        #[allow(unused)]
        index: u32,
        content_block: ContentBlock,
    },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta {
        #[allow(unused)]
        index: u32,
        delta: ContentBlockDelta,
    },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop {
        #[allow(unused)]
        index: u32,
    },
    #[serde(rename = "message_delta")]
    MessageDelta {
        #[allow(unused)]
        delta: MessageDeltaData,
        usage: Usage,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
}

#[derive(Debug, Deserialize)]
struct MessageData {
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_block_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlockDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaData {
    #[allow(unused)]
    stop_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(serde::Serialize, Debug, Clone)]
struct ThinkingConfig {
    #[serde(rename = "type")]
    thinking_type: String,
    budget_tokens: usize,
}

#[derive(serde::Serialize, Debug, Clone)]
struct AnthropicRequest {
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    temperature: f32,
    stream: bool,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ThinkingConfig>,
    model: String,
}

const DEFAULT_MAX_TOKENS: usize = 8192;
const THINKING_BUDGET_TOKENS: usize = 4096;

impl AnthropicRequest {
    fn from_client_completion_request(
        completion_request: LLMClientCompletionRequest,
        model_str: String,
    ) -> Self {
        let temperature = completion_request.temperature();
        let max_tokens = completion_request
            .get_max_tokens()
            .unwrap_or(DEFAULT_MAX_TOKENS);
        let thinking = completion_request.thinking().then(|| ThinkingConfig {
            thinking_type: "enabled".to_owned(),
            budget_tokens: THINKING_BUDGET_TOKENS,
        });
        let messages = completion_request.messages();
        let system_message = messages
            .iter()
            .find(|message| message.role().is_system())
            .map(|message| message.content().to_owned());

        let normal_conversation = messages
            .iter()
            .filter(|message| message.role().is_user() || message.role().is_assistant())
            .map(|message| {
                AnthropicMessage::new(message.role().to_string(), message.content().to_owned())
            })
            .collect::<Vec<_>>();
        AnthropicRequest {
            system: system_message,
            messages: normal_conversation,
            temperature,
            stream: true,
            max_tokens,
            thinking,
            model: model_str,
        }
    }
}

pub struct AnthropicClient {
    client: reqwest::Client,
    base_url: String,
    chat_endpoint: String,
}

impl AnthropicClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.anthropic.com".to_owned(),
            chat_endpoint: "/v1/messages".to_owned(),
        }
    }

    pub fn chat_endpoint(&self) -> String {
        format!("{}{}", &self.base_url, &self.chat_endpoint)
    }

    fn generate_api_key(&self, api_key: LLMProviderAPIKeys) -> Result<String, LLMClientError> {
        match api_key {
            LLMProviderAPIKeys::Anthropic(api_key) => Ok(api_key.api_key),
            _ => Err(LLMClientError::WrongAPIKeyType),
        }
    }

    fn get_model_string(&self, llm_type: &LLMType) -> Result<String, LLMClientError> {
        match llm_type {
            LLMType::ClaudeOpus => Ok("claude-3-opus-20240229".to_owned()),
            LLMType::ClaudeSonnet => Ok("claude-3-7-sonnet-20250219".to_owned()),
            LLMType::ClaudeHaiku => Ok("claude-3-5-haiku-20241022".to_owned()),
            LLMType::Custom(model) => Ok(model.to_owned()),
            _ => Err(LLMClientError::UnSupportedModel),
        }
    }
}

#[async_trait]
impl LLMClient for AnthropicClient {
    fn client(&self) -> &LLMProvider {
        &LLMProvider::Anthropic
    }

    async fn completion(
        &self,
        api_key: LLMProviderAPIKeys,
        request: LLMClientCompletionRequest,
    ) -> Result<String, LLMClientError> {
        let (sender, _receiver) = tokio::sync::mpsc::unbounded_channel();
        let response = self.stream_completion(api_key, request, sender).await?;
        Ok(response.get_answer_up_until_now())
    }

    async fn stream_completion(
        &self,
        api_key: LLMProviderAPIKeys,
        request: LLMClientCompletionRequest,
        sender: UnboundedSender<LLMClientCompletionResponse>,
    ) -> Result<LLMClientCompletionResponse, LLMClientError> {
        let endpoint = self.chat_endpoint();
        let model_str = self.get_model_string(request.model())?;
        let anthropic_request =
            AnthropicRequest::from_client_completion_request(request, model_str.to_owned());

        let response = self
            .client
            .post(endpoint)
            .header("x-api-key".to_owned(), self.generate_api_key(api_key)?)
            .header("anthropic-version".to_owned(), "2023-06-01".to_owned())
            .header("content-type".to_owned(), "application/json".to_owned())
            .json(&anthropic_request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LLMClientError::from_status(status.as_u16(), body));
        }

        let mut event_source = response.bytes_stream().eventsource();

        let mut buffered_answer = String::new();
        let mut usage = LLMClientUsage::default();
        // thinking blocks are re-bracketed into the single token protocol so
        // the consumer never has to know which provider produced the stream
        let mut in_thinking_block = false;

        while let Some(event) = event_source.next().await {
            let event = match event {
                Ok(event) => event,
                Err(error) => {
                    tracing::error!(?error, "anthropic stream errored");
                    break;
                }
            };
            let parsed_event = serde_json::from_str::<AnthropicEvent>(&event.data);
            match parsed_event {
                Ok(AnthropicEvent::MessageStart { message }) => {
                    usage.merge(&LLMClientUsage::new(
                        message.usage.input_tokens,
                        message.usage.output_tokens,
                    ));
                }
                Ok(AnthropicEvent::ContentBlockStart { content_block, .. }) => {
                    if content_block.content_block_type == "thinking" && !in_thinking_block {
                        in_thinking_block = true;
                        buffered_answer.push_str(START_THINKING_TOKEN);
                        sender.send(LLMClientCompletionResponse::new(
                            buffered_answer.to_owned(),
                            Some(START_THINKING_TOKEN.to_owned()),
                            model_str.to_owned(),
                        ))?;
                    }
                }
                Ok(AnthropicEvent::ContentBlockDelta { delta, .. }) => {
                    let text = match delta {
                        ContentBlockDelta::TextDelta { text } => {
                            if in_thinking_block {
                                in_thinking_block = false;
                                buffered_answer.push_str(END_THINKING_TOKEN);
                                sender.send(LLMClientCompletionResponse::new(
                                    buffered_answer.to_owned(),
                                    Some(END_THINKING_TOKEN.to_owned()),
                                    model_str.to_owned(),
                                ))?;
                            }
                            Some(text)
                        }
                        ContentBlockDelta::ThinkingDelta { thinking } => Some(thinking),
                        ContentBlockDelta::Unknown => None,
                    };
                    if let Some(text) = text {
                        buffered_answer.push_str(&text);
                        sender.send(LLMClientCompletionResponse::new(
                            buffered_answer.to_owned(),
                            Some(text),
                            model_str.to_owned(),
                        ))?;
                    }
                }
                Ok(AnthropicEvent::MessageDelta { usage: delta, .. }) => {
                    usage.merge(&LLMClientUsage::new(
                        delta.input_tokens,
                        delta.output_tokens,
                    ));
                }
                Ok(AnthropicEvent::MessageStop) => break,
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(?error, "failed to parse anthropic event");
                }
            }
        }

        Ok(
            LLMClientCompletionResponse::new(buffered_answer, None, model_str)
                .set_usage(usage),
        )
    }
}
