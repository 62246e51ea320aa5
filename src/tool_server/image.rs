//! Admin-time registration of tool server images.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use super::env::{placeholder_env, RESERVED_KEYS};
use super::errors::ToolServerError;
use super::registry::NAME_SEPARATOR;
use super::supervisor::{ContainerSpec, ToolServerProcess, ToolSession, INIT_TIMEOUT};
use crate::store::{AuthMode, ImageRecord, ImageTool, Store};

/// Bound on starting a throwaway container and listing its tools.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// An image definition as submitted by an admin.
#[derive(Debug, Clone, Deserialize)]
pub struct NewImage {
    pub name: String,
    pub slug: String,
    pub version: u32,
    pub container_ref: String,
    /// `PUBLIC`, `AUTHENTICATED` or `AUTHENTICATED_OAUTH`.
    pub auth_mode: String,
    #[serde(default)]
    pub oauth_provider: Option<String>,
    #[serde(default)]
    pub env_schema: BTreeMap<String, String>,
    /// Discovered from the container when omitted.
    #[serde(default)]
    pub tools: Option<Vec<ImageTool>>,
}

/// Validate an image definition without touching the store.
pub fn validate(new: &NewImage) -> Result<ImageRecord, ToolServerError> {
    let invalid = |reason: String| ToolServerError::InvalidImage { reason };

    if new.name.trim().is_empty() {
        return Err(invalid("name is required".into()));
    }
    if new.slug.trim().is_empty() || new.slug.contains(NAME_SEPARATOR) {
        return Err(invalid(format!(
            "slug must be non-empty and must not contain '{NAME_SEPARATOR}'"
        )));
    }
    if new.container_ref.trim().is_empty() {
        return Err(invalid("container_ref is required".into()));
    }

    let auth_mode = AuthMode::parse(&new.auth_mode)
        .ok_or_else(|| invalid(format!("unknown auth mode '{}'", new.auth_mode)))?;

    if auth_mode == AuthMode::AuthenticatedOauth && new.oauth_provider.is_none() {
        return Err(invalid(
            "AUTHENTICATED_OAUTH images must name an oauth_provider".into(),
        ));
    }

    for (key, expected) in RESERVED_KEYS {
        if let Some(actual) = new.env_schema.get(*key) {
            if actual.as_str() != *expected {
                return Err(invalid(format!(
                    "env key {key} must map to '{expected}', got '{actual}'"
                )));
            }
        }
    }

    Ok(ImageRecord {
        id: format!("{}-v{}", new.slug, new.version),
        slug: new.slug.clone(),
        version: new.version,
        name: new.name.clone(),
        container_ref: new.container_ref.clone(),
        auth_mode,
        oauth_provider: new.oauth_provider.clone(),
        env_schema: new.env_schema.clone(),
    })
}

/// Validate, discover tools if needed, and persist an image with its tools.
pub async fn register_image(
    store: &Store,
    runtime: &str,
    new: NewImage,
) -> Result<(ImageRecord, Vec<ImageTool>), ToolServerError> {
    let image = validate(&new)?;
    if store.get_image(&image.id)?.is_some() {
        return Err(ToolServerError::InvalidImage {
            reason: format!("image '{}' is already registered", image.id),
        });
    }

    let tools = match new.tools {
        Some(tools) => tools,
        None => probe_tools(runtime, &image).await?,
    };

    store.insert_image(&image, &tools)?;
    tracing::info!(
        image_id = %image.id,
        auth_mode = image.auth_mode.as_str(),
        tools = tools.len(),
        "registered tool server image"
    );
    Ok((image, tools))
}

/// Start a throwaway container with placeholder env and list its tools.
async fn probe_tools(runtime: &str, image: &ImageRecord) -> Result<Vec<ImageTool>, ToolServerError> {
    let spec = ContainerSpec {
        runtime: runtime.to_string(),
        instance_id: format!("{}-probe", image.id),
        named: false,
        container_ref: image.container_ref.clone(),
        env: placeholder_env(&image.env_schema),
        log_path: None,
        init_timeout: INIT_TIMEOUT,
    };

    let probe = async {
        let process = ToolServerProcess::start(&spec).await?;
        let listed = process.list_tools().await;
        process.shutdown().await;
        listed
    };

    let tools = tokio::time::timeout(PROBE_TIMEOUT, probe)
        .await
        .map_err(|_| ToolServerError::HandshakeFailed {
            instance: spec.instance_id.clone(),
            reason: format!("tool discovery timed out after {}s", PROBE_TIMEOUT.as_secs()),
        })??;

    Ok(tools
        .into_iter()
        .map(|t| ImageTool {
            name: t.name,
            description: t.description,
            input_schema: t.input_schema,
        })
        .collect())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool_server::env::{PROVIDER_CLIENT_ID, USER_REFRESH_TOKEN};

    fn new_image() -> NewImage {
        let mut env_schema = BTreeMap::new();
        env_schema.insert("CLIENT_ID".to_string(), PROVIDER_CLIENT_ID.to_string());
        env_schema.insert("REFRESH_TOKEN".to_string(), USER_REFRESH_TOKEN.to_string());
        NewImage {
            name: "Gmail".into(),
            slug: "gmail".into(),
            version: 2,
            container_ref: "toolchat/gmail:2".into(),
            auth_mode: "AUTHENTICATED_OAUTH".into(),
            oauth_provider: Some("google".into()),
            env_schema,
            tools: Some(vec![ImageTool {
                name: "list_emails".into(),
                description: "List emails".into(),
                input_schema: serde_json::json!({"type": "object"}),
            }]),
        }
    }

    #[test]
    fn test_image_id_is_slug_and_version() {
        assert_eq!(validate(&new_image()).unwrap().id, "gmail-v2");
    }

    #[test]
    fn test_reserved_key_with_wrong_template_is_rejected() {
        let mut new = new_image();
        new.env_schema
            .insert("REFRESH_TOKEN".into(), "$provider.oauth_client_id".into());
        assert!(matches!(validate(&new), Err(ToolServerError::InvalidImage { .. })));
    }

    #[test]
    fn test_oauth_mode_requires_provider() {
        let mut new = new_image();
        new.oauth_provider = None;
        assert!(matches!(validate(&new), Err(ToolServerError::InvalidImage { .. })));
    }

    #[test]
    fn test_unknown_auth_mode_is_rejected() {
        let mut new = new_image();
        new.auth_mode = "OAUTH".into();
        assert!(matches!(validate(&new), Err(ToolServerError::InvalidImage { .. })));
    }

    #[tokio::test]
    async fn test_register_with_explicit_tools_skips_probe() {
        let store = Store::open(":memory:").unwrap();
        let (image, tools) = register_image(&store, "/nonexistent/runtime", new_image())
            .await
            .unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(store.image_tools(&image.id).unwrap(), tools);

        // Images are immutable: the same slug and version cannot be registered twice.
        let again = register_image(&store, "/nonexistent/runtime", new_image()).await;
        assert!(matches!(again, Err(ToolServerError::InvalidImage { .. })));
    }

    #[tokio::test]
    async fn test_probe_spawn_failure_is_reported() {
        let store = Store::open(":memory:").unwrap();
        let mut new = new_image();
        new.tools = None;
        let err = register_image(&store, "/nonexistent/runtime", new)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolServerError::SpawnFailed { .. }));
        assert!(store.get_image("gmail-v2").unwrap().is_none());
    }
}
