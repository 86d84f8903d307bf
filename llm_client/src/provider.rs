//! Provider selection for the LLM clients. Keys are kept separate from the
//! provider tag so a single broker can hold credentials for several backends
//! at once.

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, Hash, PartialEq, Eq)]
pub enum LLMProvider {
    OpenAI,
    Anthropic,
    OpenAICompatible,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub enum LLMProviderAPIKeys {
    OpenAI(OpenAIProvider),
    Anthropic(AnthropicAPIKey),
    OpenAICompatible(OpenAICompatibleAPIKey),
}

impl LLMProviderAPIKeys {
    pub fn provider(&self) -> LLMProvider {
        match self {
            LLMProviderAPIKeys::OpenAI(_) => LLMProvider::OpenAI,
            LLMProviderAPIKeys::Anthropic(_) => LLMProvider::Anthropic,
            LLMProviderAPIKeys::OpenAICompatible(_) => LLMProvider::OpenAICompatible,
        }
    }

    // Gets the relevant key from the llm provider
    pub fn key(&self, llm_provider: &LLMProvider) -> Option<Self> {
        if &self.provider() == llm_provider {
            Some(self.clone())
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct OpenAIProvider {
    pub api_key: String,
}

impl OpenAIProvider {
    pub fn new(api_key: String) -> Self {
        Self { api_key }
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct AnthropicAPIKey {
    pub api_key: String,
}

impl AnthropicAPIKey {
    pub fn new(api_key: String) -> Self {
        Self { api_key }
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct OpenAICompatibleAPIKey {
    pub api_key: String,
    pub api_base: String,
}

impl OpenAICompatibleAPIKey {
    pub fn new(api_key: String, api_base: String) -> Self {
        Self { api_key, api_base }
    }
}
