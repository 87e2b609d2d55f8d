pub mod config;
pub mod eval;
pub mod generate;
pub mod score;
pub mod validate;

use anyhow::Context;
use scirecipe_core::collaborator::ChatClient;
use scirecipe_core::config::CollaboratorConfig;
use std::time::Duration;

/// Build a chat client for `model` on the configured endpoint. The API key
/// comes from the environment variable named in the config, if set.
pub fn chat_client(cfg: &CollaboratorConfig, model: &str) -> anyhow::Result<ChatClient> {
    let api_key = std::env::var(&cfg.api_key_env)
        .ok()
        .filter(|k| !k.trim().is_empty());
    if api_key.is_none() {
        tracing::warn!(var = %cfg.api_key_env, "no API key set; sending unauthenticated requests");
    }
    ChatClient::new(
        cfg.base_url.clone(),
        model,
        api_key,
        Duration::from_secs(cfg.timeout_seconds),
    )
    .context("failed to build collaborator client")
}

