use anyhow::{Context, Result};
use std::net::SocketAddr;

const DEFAULT_DATABASE_URL: &str = "sqlite://flai.sqlite?mode=rwc";
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_SSE_BUFFER: usize = 32;

/// Process settings, read from the environment (and `.env` when present).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    /// Capacity of the per-request channel between the aggregator and the SSE body.
    pub sse_buffer: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            log::debug!("Loaded environment from {}", path.display());
        }

        let database_url =
            std::env::var("FLAI_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        let bind_addr = std::env::var("FLAI_BIND_ADDR")
            .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .context("FLAI_BIND_ADDR is not a valid socket address")?;
        let sse_buffer = match std::env::var("FLAI_SSE_BUFFER") {
            Ok(raw) => raw.parse().context("FLAI_SSE_BUFFER is not a number")?,
            Err(_) => DEFAULT_SSE_BUFFER,
        };

        Ok(Self {
            database_url,
            bind_addr,
            sse_buffer: sse_buffer.max(1),
        })
    }
}

// --- API Key Retrieval ---

/// Resolves the api key stored on a provider row.
///
/// `env:NAME` reads the environment variable `NAME`; anything else is taken as
/// the literal key.
pub fn resolve_api_key(provider_name: &str, stored: &str) -> Result<String> {
    match stored.strip_prefix("env:") {
        Some(env_var_name) => {
            log::debug!("Retrieving API key from environment variable: {}", env_var_name);
            std::env::var(env_var_name).context(format!(
                "Failed to get API key for provider '{}' from environment variable '{}'",
                provider_name, env_var_name
            ))
        }
        None if stored.is_empty() => Err(anyhow::anyhow!(
            "API key not set for provider '{}'",
            provider_name
        )),
        None => Ok(stored.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_keys_pass_through() {
        assert_eq!(resolve_api_key("p", "sk-123").unwrap(), "sk-123");
    }

    #[test]
    fn env_references_are_resolved() {
        std::env::set_var("FLAI_TEST_PROVIDER_KEY", "from-env");
        assert_eq!(
            resolve_api_key("p", "env:FLAI_TEST_PROVIDER_KEY").unwrap(),
            "from-env"
        );
        assert!(resolve_api_key("p", "env:FLAI_TEST_MISSING_KEY_VAR").is_err());
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(resolve_api_key("p", "").is_err());
    }
}
