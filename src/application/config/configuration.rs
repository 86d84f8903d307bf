use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Configuration {
    #[clap(short, long, default_value_os_t = default_data_dir())]
    #[serde(default = "default_data_dir")]
    /// Directory to store all persistent state
    pub data_dir: PathBuf,

    #[clap(long, default_value_t = default_host())]
    #[serde(default = "default_host")]
    /// Bind the webserver to `<host>`
    pub host: String,

    #[clap(long, default_value_t = default_port())]
    #[serde(default = "default_port")]
    /// Bind the webserver to `<port>`
    pub port: u16,

    #[clap(long, default_value_t = default_search_backend_url())]
    #[serde(default = "default_search_backend_url")]
    /// Base url of the hybrid search backend
    pub search_backend_url: String,

    #[clap(long, env = "OPENAI_API_KEY")]
    #[serde(default)]
    pub openai_api_key: Option<String>,

    #[clap(long, env = "ANTHROPIC_API_KEY")]
    #[serde(default)]
    pub anthropic_api_key: Option<String>,

    #[clap(long, env = "LLM_GATEWAY_URL")]
    #[serde(default)]
    /// Optional OpenAI-compatible gateway, used for custom model ids
    pub llm_gateway_url: Option<String>,

    #[clap(long, default_value_t = default_timezone())]
    #[serde(default = "default_timezone")]
    /// Fallback timezone reported to the router when a request carries none
    pub default_timezone: String,
}

impl Configuration {
    /// Directory where logs are written to
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("chats.db")
    }

    /// Attachment blobs live on disk next to the database.
    pub fn attachment_dir(&self) -> PathBuf {
        self.data_dir.join("attachments")
    }
}

fn default_data_dir() -> PathBuf {
    match directories::ProjectDirs::from("io", "conductor", "conductor") {
        Some(dirs) => dirs.data_dir().to_owned(),
        None => "conductor_data".into(),
    }
}

fn default_port() -> u16 {
    41414
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_search_backend_url() -> String {
    "http://127.0.0.1:8080".to_owned()
}

fn default_timezone() -> String {
    "UTC".to_owned()
}
