//! Client for the OpenAI chat completions API and for any endpoint which
//! speaks the same wire format. The provider key decides the base url, so
//! self-hosted gateways work through the same path.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::provider::{LLMProvider, LLMProviderAPIKeys};

use super::types::{
    LLMClient, LLMClientCompletionRequest, LLMClientCompletionResponse, LLMClientError,
    LLMClientUsage, LLMType,
};

#[derive(serde::Serialize, Debug, Clone)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(serde::Serialize, Debug, Clone)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(serde::Serialize, Debug, Clone)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    stream: bool,
    stream_options: StreamOptions,
}

impl OpenAIRequest {
    fn from_client_completion_request(
        completion_request: &LLMClientCompletionRequest,
        model_str: String,
    ) -> Self {
        OpenAIRequest {
            model: model_str,
            messages: completion_request
                .messages()
                .iter()
                .map(|message| OpenAIMessage {
                    role: message.role().to_string(),
                    content: message.content().to_owned(),
                })
                .collect(),
            temperature: completion_request.temperature(),
            frequency_penalty: completion_request.frequency_penalty(),
            max_tokens: completion_request.get_max_tokens(),
            stop: completion_request.stop_words().map(|words| words.to_vec()),
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<StreamUsage>,
}

pub struct OpenAIClient {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAIClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.openai.com/v1".to_owned(),
        }
    }

    fn completion_endpoint(&self, base_url: &str) -> String {
        format!("{}/chat/completions", base_url)
    }

    fn api_key_and_base(
        &self,
        api_key: LLMProviderAPIKeys,
    ) -> Result<(String, String), LLMClientError> {
        match api_key {
            LLMProviderAPIKeys::OpenAI(provider) => {
                Ok((provider.api_key, self.base_url.to_owned()))
            }
            LLMProviderAPIKeys::OpenAICompatible(provider) => {
                Ok((provider.api_key, provider.api_base))
            }
            _ => Err(LLMClientError::WrongAPIKeyType),
        }
    }

    fn get_model_string(&self, llm_type: &LLMType) -> Result<String, LLMClientError> {
        match llm_type {
            LLMType::Gpt4o => Ok("gpt-4o".to_owned()),
            LLMType::Gpt4oMini => Ok("gpt-4o-mini".to_owned()),
            LLMType::O3Mini => Ok("o3-mini".to_owned()),
            LLMType::DeepSeekR1 => Ok("deepseek-reasoner".to_owned()),
            LLMType::Custom(model) => Ok(model.to_owned()),
            _ => Err(LLMClientError::UnSupportedModel),
        }
    }
}

#[async_trait]
impl LLMClient for OpenAIClient {
    fn client(&self) -> &LLMProvider {
        &LLMProvider::OpenAI
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
        let model_str = self.get_model_string(request.model())?;
        let (api_key, base_url) = self.api_key_and_base(api_key)?;
        let openai_request =
            OpenAIRequest::from_client_completion_request(&request, model_str.to_owned());

        let response = self
            .client
            .post(self.completion_endpoint(&base_url))
            .bearer_auth(api_key)
            .json(&openai_request)
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

        while let Some(event) = event_source.next().await {
            let event = match event {
                Ok(event) => event,
                Err(error) => {
                    tracing::error!(?error, "openai stream errored");
                    break;
                }
            };
            if event.data == "[DONE]" {
                break;
            }
            let chunk = match serde_json::from_str::<StreamChunk>(&event.data) {
                Ok(chunk) => chunk,
                Err(error) => {
                    tracing::warn!(?error, "failed to parse openai chunk");
                    continue;
                }
            };
            if let Some(chunk_usage) = chunk.usage {
                usage = LLMClientUsage::new(chunk_usage.prompt_tokens, chunk_usage.completion_tokens);
            }
            if let Some(content) = chunk
                .choices
                .first()
                .and_then(|choice| choice.delta.content.as_ref())
            {
                buffered_answer.push_str(content);
                sender.send(LLMClientCompletionResponse::new(
                    buffered_answer.to_owned(),
                    Some(content.to_owned()),
                    model_str.to_owned(),
                ))?;
            }
        }

        Ok(
            LLMClientCompletionResponse::new(buffered_answer, None, model_str)
                .set_usage(usage),
        )
    }
}
