//! Environment-sourced configuration, loaded once at process start via
//! `dotenvy::dotenv().ok()` then `std::env::var`.

use broker_common::{BrokerError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub redis_db: u8,
    pub challenge_dir: String,
    pub infra_container_name: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Reads all known environment variables. `API_KEY` is required; every
    /// other variable has a documented default.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("API_KEY")
            .map_err(|_| BrokerError::Config("API_KEY is required".to_string()))?;

        let redis_port: u16 = env_or("REDIS_PORT", "6379")
            .parse()
            .map_err(|_| BrokerError::Config("REDIS_PORT must be a valid port number".to_string()))?;

        let redis_db: u8 = env_or("REDIS_DB", "0")
            .parse()
            .map_err(|_| BrokerError::Config("REDIS_DB must be a small integer".to_string()))?;

        Ok(Self {
            api_key,
            redis_host: env_or("REDIS_HOST", "127.0.0.1"),
            redis_port,
            redis_password: std::env::var("REDIS_PASSWORD").ok(),
            redis_db,
            challenge_dir: env_or("CHALLENGE_DIR", "challenges"),
            infra_container_name: env_or("INFRA_CONTAINER_NAME", "cadvisor"),
        })
    }

    pub fn redis_url(&self) -> String {
        match &self.redis_password {
            Some(password) => format!(
                "redis://:{password}@{}:{}/{}",
                self.redis_host, self.redis_port, self.redis_db
            ),
            None => format!("redis://{}:{}/{}", self.redis_host, self.redis_port, self.redis_db),
        }
    }
}
