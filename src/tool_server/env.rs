//! Env schema templating.
//!
//! An image's env schema maps each container env key either to a template
//! (`$provider.*` / `$user.*`) resolved from stored OAuth state, or to a
//! literal that only documents the key: such keys must be supplied by the
//! caller at launch.

use std::collections::BTreeMap;

use super::errors::ToolServerError;
use crate::store::{ImageRecord, OAuthProvider};

pub const PROVIDER_CLIENT_ID: &str = "$provider.oauth_client_id";
pub const PROVIDER_CLIENT_SECRET: &str = "$provider.oauth_client_secret";
pub const USER_REFRESH_TOKEN: &str = "$user.oauth_refresh_token";

/// Keys whose template is fixed for every image that declares them.
pub const RESERVED_KEYS: &[(&str, &str)] = &[
    ("CLIENT_ID", PROVIDER_CLIENT_ID),
    ("CLIENT_SECRET", PROVIDER_CLIENT_SECRET),
    ("REFRESH_TOKEN", USER_REFRESH_TOKEN),
];

/// OAuth state available when resolving an image's env.
#[derive(Debug, Default, Clone, Copy)]
pub struct OAuthContext<'a> {
    pub provider: Option<&'a OAuthProvider>,
    pub refresh_token: Option<&'a str>,
}

/// Resolve an image's env schema against OAuth state and caller values.
pub fn resolve_env(
    image: &ImageRecord,
    user_env: &BTreeMap<String, String>,
    oauth: OAuthContext<'_>,
) -> Result<BTreeMap<String, String>, ToolServerError> {
    let mut resolved = BTreeMap::new();

    for (key, template) in &image.env_schema {
        let value = match template.as_str() {
            PROVIDER_CLIENT_ID => provider(image, key, oauth)?.client_id.clone(),
            PROVIDER_CLIENT_SECRET => provider(image, key, oauth)?.client_secret.clone(),
            USER_REFRESH_TOKEN => oauth
                .refresh_token
                .ok_or_else(|| ToolServerError::InvalidEnv {
                    key: key.clone(),
                    reason: format!(
                        "no refresh token stored for provider '{}'",
                        image.oauth_provider.as_deref().unwrap_or_default()
                    ),
                })?
                .to_string(),
            _ => user_env
                .get(key)
                .cloned()
                .ok_or_else(|| ToolServerError::InvalidEnv {
                    key: key.clone(),
                    reason: "missing key".into(),
                })?,
        };
        resolved.insert(key.clone(), value);
    }

    Ok(resolved)
}

/// Env used when probing an image for its tools: every key gets a dummy value.
pub fn placeholder_env(env_schema: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env_schema
        .keys()
        .map(|key| (key.clone(), "placeholder".to_string()))
        .collect()
}

fn provider<'a>(
    image: &ImageRecord,
    key: &str,
    oauth: OAuthContext<'a>,
) -> Result<&'a OAuthProvider, ToolServerError> {
    oauth.provider.ok_or_else(|| ToolServerError::InvalidEnv {
        key: key.to_string(),
        reason: match &image.oauth_provider {
            Some(name) => format!("oauth provider '{name}' is not registered"),
            None => "image has no oauth provider".into(),
        },
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
