//! LLM endpoint configuration (the `llm:` section of `toolchat.yaml`).

use serde::Deserialize;

/// Settings for the OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// Base URL up to and including the API version, e.g. `https://api.openai.com/v1`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Sent as a bearer token when non-empty. Defaults to `$OPENAI_API_KEY`.
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Prepended to every request as a system message.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: default_api_key(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            system_prompt: None,
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_api_key() -> String {
    std::env::var("OPENAI_API_KEY").unwrap_or_default()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_request_timeout_secs() -> u64 {
    120
}
