//! Process configuration loaded from the environment.

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub object_store_root: String,
    pub llm_provider: String,
    pub llm_text_model: String,
    pub llm_vision_model: String,
    pub embedding_model: String,
    pub default_currency: String,
    pub config_pepper: String,
    pub worker_count: usize,
    pub ack_poll_interval_secs: u64,
    pub llm_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./orderflow.db".to_string());

        let object_store_root =
            std::env::var("OBJECT_STORE_ROOT").unwrap_or_else(|_| "./objectstore".to_string());

        let llm_provider = std::env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());

        let llm_text_model =
            std::env::var("LLM_TEXT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let llm_vision_model =
            std::env::var("LLM_VISION_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());

        let embedding_model = std::env::var("EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());

        let default_currency =
            std::env::var("DEFAULT_CURRENCY").unwrap_or_else(|_| "EUR".to_string());

        let config_pepper =
            std::env::var("CONFIG_PEPPER").unwrap_or_else(|_| "orderflow-dev-pepper".to_string());

        let worker_count = std::env::var("WORKER_COUNT")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .unwrap_or(4);

        let ack_poll_interval_secs = std::env::var("ACK_POLL_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        let llm_timeout_secs = std::env::var("LLM_TIMEOUT_SECS")
            .unwrap_or_else(|_| "40".to_string())
            .parse()
            .unwrap_or(40);

        Ok(Self {
            database_path,
            object_store_root,
            llm_provider,
            llm_text_model,
            llm_vision_model,
            embedding_model,
            default_currency,
            config_pepper,
            worker_count,
            ack_poll_interval_secs,
            llm_timeout_secs,
        })
    }
}
