//! The llm client broker routes a completion request to the right provider
//! client, so callers only ever deal in `LLMClientCompletionRequest` and the
//! provider keys they were configured with.

use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;

use crate::{
    clients::{
        anthropic::AnthropicClient,
        openai::OpenAIClient,
        types::{
            LLMClient, LLMClientCompletionRequest, LLMClientCompletionResponse, LLMClientError,
        },
    },
    provider::{LLMProvider, LLMProviderAPIKeys},
};

pub struct LLMBroker {
    providers: HashMap<LLMProvider, Box<dyn LLMClient + Send + Sync>>,
}

impl LLMBroker {
    pub fn new() -> Self {
        let broker = Self {
            providers: HashMap::new(),
        };
        broker
            .add_provider(LLMProvider::OpenAI, Box::new(OpenAIClient::new()))
            .add_provider(LLMProvider::OpenAICompatible, Box::new(OpenAIClient::new()))
            .add_provider(LLMProvider::Anthropic, Box::new(AnthropicClient::new()))
    }

    pub fn add_provider(
        mut self,
        provider: LLMProvider,
        client: Box<dyn LLMClient + Send + Sync>,
    ) -> Self {
        self.providers.insert(provider, client);
        self
    }

    fn get_provider_client(
        &self,
        provider: &LLMProvider,
    ) -> Result<&(dyn LLMClient + Send + Sync), LLMClientError> {
        self.providers
            .get(provider)
            .map(|client| client.as_ref())
            .ok_or(LLMClientError::UnSupportedModel)
    }

    pub async fn stream_completion(
        &self,
        api_key: LLMProviderAPIKeys,
        request: LLMClientCompletionRequest,
        sender: UnboundedSender<LLMClientCompletionResponse>,
    ) -> Result<LLMClientCompletionResponse, LLMClientError> {
        let provider = api_key.provider();
        let client = self.get_provider_client(&provider)?;
        client.stream_completion(api_key, request, sender).await
    }

    pub async fn completion(
        &self,
        api_key: LLMProviderAPIKeys,
        request: LLMClientCompletionRequest,
    ) -> Result<String, LLMClientError> {
        let provider = api_key.provider();
        let client = self.get_provider_client(&provider)?;
        client.completion(api_key, request).await
    }
}
