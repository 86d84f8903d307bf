// This is where we will define the core application and all the related
// things on how to startup the application

use std::sync::Arc;

use llm_client::broker::LLMBroker;
use llm_client::clients::types::{LLMClientError, LLMType};
use llm_client::provider::{
    AnthropicAPIKey, LLMProviderAPIKeys, OpenAICompatibleAPIKey, OpenAIProvider,
};
use once_cell::sync::OnceCell;
use tracing::warn;

use crate::chat::db::{init_sqlite, SqlDb};
use crate::chat::registry::StreamRegistry;
use crate::search::client::SearchClient;

use super::{config::configuration::Configuration, logging::tracing::tracing_subscribe};

static LOGGER_INSTALLED: OnceCell<bool> = OnceCell::new();

#[derive(Clone)]
pub struct Application {
    pub config: Arc<Configuration>,
    pub sql: SqlDb,
    pub search: Arc<SearchClient>,
    pub llm_broker: Arc<LLMBroker>,
    pub stream_registry: Arc<StreamRegistry>,
}

impl Application {
    pub async fn initialize(config: Configuration) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        tokio::fs::create_dir_all(config.attachment_dir()).await?;
        let sql = init_sqlite(&config.database_path()).await?;
        let search = Arc::new(SearchClient::new(config.search_backend_url.to_owned()));
        Ok(Self {
            config: Arc::new(config),
            sql,
            search,
            llm_broker: Arc::new(LLMBroker::new()),
            stream_registry: Arc::new(StreamRegistry::new()),
        })
    }

    pub fn install_logging(config: &Configuration) {
        if let Some(true) = LOGGER_INSTALLED.get() {
            return;
        }

        if !tracing_subscribe(config) {
            warn!("Failed to install tracing_subscriber. There's probably one already...");
        };

        if color_eyre::install().is_err() {
            warn!("Failed to install color-eyre. Oh well...");
        };

        LOGGER_INSTALLED.set(true).unwrap();
    }

    /// Picks the credentials matching the provider a model belongs to.
    pub fn llm_api_key(&self, llm_type: &LLMType) -> Result<LLMProviderAPIKeys, LLMClientError> {
        if llm_type.is_anthropic() {
            return self
                .config
                .anthropic_api_key
                .as_ref()
                .map(|key| LLMProviderAPIKeys::Anthropic(AnthropicAPIKey::new(key.to_owned())))
                .ok_or(LLMClientError::InvalidAPIKey);
        }
        if llm_type.is_custom() {
            if let Some(gateway) = self.config.llm_gateway_url.as_ref() {
                let api_key = self.config.openai_api_key.to_owned().unwrap_or_default();
                return Ok(LLMProviderAPIKeys::OpenAICompatible(
                    OpenAICompatibleAPIKey::new(api_key, gateway.to_owned()),
                ));
            }
        }
        self.config
            .openai_api_key
            .as_ref()
            .map(|key| LLMProviderAPIKeys::OpenAI(OpenAIProvider::new(key.to_owned())))
            .ok_or(LLMClientError::InvalidAPIKey)
    }
}
