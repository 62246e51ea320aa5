//! Instance launcher: the chat server's side of the instance lifecycle.
//!
//! Starting an instance spawns a `toolchat-instance` host process, which runs
//! the container and serves its facade. The launcher learns the facade address
//! through the rendezvous socket and only then marks the instance `ready`, so
//! the catalog never sees an instance without a working address.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::client::FacadeClient;
use super::env::{resolve_env, OAuthContext};
use super::errors::ToolServerError;
use super::image::{register_image, NewImage};
use super::rendezvous::RendezvousListener;
use crate::store::{ImageRecord, ImageTool, InstanceRecord, InstanceState, Store};

/// How long a killed host gets to exit on its own before it is killed.
const HOST_EXIT_GRACE: Duration = Duration::from_secs(10);

/// Hex characters of the random instance suffix. Qualified tool names embed
/// the instance id and providers cap function names at 64 characters.
const INSTANCE_UID_LEN: usize = 12;

fn instance_uid() -> String {
    let mut uid = Uuid::new_v4().simple().to_string();
    uid.truncate(INSTANCE_UID_LEN);
    uid
}

/// Paths and limits used when spawning instance hosts.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub container_runtime: String,
    pub instance_host_bin: PathBuf,
    pub rendezvous_dir: PathBuf,
    pub rendezvous_timeout: Duration,
    /// Database the host opens to read its instance record.
    pub database_path: String,
    pub log_dir: PathBuf,
}

/// Starts, tracks and kills tool server instances.
pub struct Launcher {
    store: Arc<Store>,
    facade: FacadeClient,
    config: LauncherConfig,
    /// Host processes started by this launcher, keyed by instance id.
    hosts: Mutex<HashMap<String, Child>>,
}

impl Launcher {
    pub fn new(store: Arc<Store>, config: LauncherConfig) -> Result<Self, ToolServerError> {
        Ok(Self {
            store,
            facade: FacadeClient::new()?,
            config,
            hosts: Mutex::new(HashMap::new()),
        })
    }

    /// Register a new image, probing the container for tools when none are given.
    pub async fn register_image(
        &self,
        new: NewImage,
    ) -> Result<(ImageRecord, Vec<ImageTool>), ToolServerError> {
        register_image(&self.store, &self.config.container_runtime, new).await
    }

    pub fn list_instances(&self) -> Result<Vec<InstanceRecord>, ToolServerError> {
        Ok(self.store.list_instances()?)
    }

    /// Start an instance of an image and wait until its facade is reachable.
    pub async fn start_instance(
        &self,
        image_id: &str,
        user_env: &BTreeMap<String, String>,
    ) -> Result<InstanceRecord, ToolServerError> {
        let image = self
            .store
            .get_image(image_id)?
            .ok_or_else(|| ToolServerError::NotFound {
                entity: "image",
                id: image_id.to_string(),
            })?;

        let env = self.resolve_env(&image, user_env)?;

        let instance_id = format!("{}-inst-{}", image.id, instance_uid());
        let record = InstanceRecord {
            id: instance_id.clone(),
            image_id: image.id.clone(),
            env,
            address: None,
            state: InstanceState::Starting,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.store.insert_instance(&record)?;

        match self.spawn_and_wait(&instance_id).await {
            Ok((address, child)) => {
                self.adopt_host(&instance_id, &address, child).await?;
                tracing::info!(instance_id = %instance_id, address = %address, "instance ready");
                Ok(InstanceRecord {
                    address: Some(address),
                    state: InstanceState::Ready,
                    ..record
                })
            }
            Err(e) => {
                tracing::warn!(instance_id = %instance_id, error = %e, "instance failed to start");
                if let Err(mark) = self.store.mark_instance_dead(&instance_id) {
                    tracing::warn!(instance_id = %instance_id, error = %mark, "failed to mark instance dead");
                }
                Err(e)
            }
        }
    }

    /// Tear down an instance and delete its record. Unknown ids are a no-op.
    pub async fn kill_instance(&self, instance_id: &str) -> Result<(), ToolServerError> {
        let record = self.store.get_instance(instance_id)?;
        let host = self.hosts.lock().await.remove(instance_id);

        let Some(record) = record else {
            if let Some(mut host) = host {
                let _ = host.kill().await;
            }
            tracing::debug!(instance_id, "kill for unknown instance ignored");
            return Ok(());
        };

        if let Some(address) = &record.address {
            if let Err(e) = self.facade.kill(address).await {
                tracing::warn!(instance_id, error = %e, "facade kill failed");
            }
        }

        self.store.delete_instance(instance_id)?;

        if let Some(mut host) = host {
            match tokio::time::timeout(HOST_EXIT_GRACE, host.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(instance_id, "instance host did not exit, killing");
                    let _ = host.kill().await;
                }
            }
        }

        tracing::info!(instance_id, "instance killed");
        Ok(())
    }

    /// Kill every instance this launcher started.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.hosts.lock().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.kill_instance(&id).await {
                tracing::warn!(instance_id = %id, error = %e, "failed to kill instance on shutdown");
            }
        }
    }

    /// Mark a reporting instance ready and start tracking its host. If the
    /// record is gone (killed while starting), the host is killed instead.
    async fn adopt_host(
        &self,
        instance_id: &str,
        address: &str,
        mut child: Child,
    ) -> Result<(), ToolServerError> {
        if let Err(e) = self.store.mark_instance_ready(instance_id, address) {
            tracing::warn!(instance_id, error = %e, "instance record gone before ready, killing host");
            let _ = child.kill().await;
            if let Err(mark) = self.store.mark_instance_dead(instance_id) {
                tracing::warn!(instance_id, error = %mark, "failed to mark instance dead");
            }
            return Err(e.into());
        }
        self.hosts.lock().await.insert(instance_id.to_string(), child);
        Ok(())
    }

    fn resolve_env(
        &self,
        image: &ImageRecord,
        user_env: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, ToolServerError> {
        let (provider, refresh_token) = match &image.oauth_provider {
            Some(name) => (
                self.store.get_oauth_provider(name)?,
                self.store.get_refresh_token(name)?,
            ),
            None => (None, None),
        };
        resolve_env(
            image,
            user_env,
            OAuthContext {
                provider: provider.as_ref(),
                refresh_token: refresh_token.as_deref(),
            },
        )
    }

    /// Spawn the host for an instance and wait for its facade address.
    async fn spawn_and_wait(&self, instance_id: &str) -> Result<(String, Child), ToolServerError> {
        let listener = RendezvousListener::bind(&self.config.rendezvous_dir, instance_id)?;

        let mut cmd = Command::new(&self.config.instance_host_bin);
        cmd.arg("--instance-id")
            .arg(instance_id)
            .arg("--callback")
            .arg(listener.path())
            .arg("--database")
            .arg(&self.config.database_path)
            .arg("--runtime")
            .arg(&self.config.container_runtime)
            .arg("--log-dir")
            .arg(&self.config.log_dir);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ToolServerError::SpawnFailed {
            instance: instance_id.to_string(),
            reason: format!(
                "cannot start {}: {e}",
                self.config.instance_host_bin.display()
            ),
        })?;

        let handoff = async {
            tokio::select! {
                address = listener.receive() => address,
                status = child.wait() => Err(ToolServerError::Rendezvous {
                    instance: instance_id.to_string(),
                    reason: match status {
                        Ok(status) => format!("instance host exited before reporting its address ({status})"),
                        Err(e) => format!("instance host wait failed: {e}"),
                    },
                }),
            }
        };

        let result = match tokio::time::timeout(self.config.rendezvous_timeout, handoff).await {
            Ok(result) => result,
            Err(_) => Err(ToolServerError::Rendezvous {
                instance: instance_id.to_string(),
                reason: format!(
                    "no address reported within {}s",
                    self.config.rendezvous_timeout.as_secs()
                ),
            }),
        };

        match result {
            Ok(address) => Ok((format!("http://{address}"), child)),
            Err(e) => {
                let _ = child.kill().await;
                Err(e)
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AuthMode, ImageRecord};

    fn launcher(store: Arc<Store>, dir: &std::path::Path, host_bin: &str) -> Launcher {
        Launcher::new(
            store,
            LauncherConfig {
                container_runtime: "docker".into(),
                instance_host_bin: host_bin.into(),
                rendezvous_dir: dir.join("rv"),
                rendezvous_timeout: Duration::from_secs(5),
                database_path: ":memory:".into(),
                log_dir: dir.join("logs"),
            },
        )
        .unwrap()
    }

    fn seeded_store() -> Arc<Store> {
        let store = Arc::new(Store::open(":memory:").unwrap());
        let mut env_schema = BTreeMap::new();
        env_schema.insert("API_KEY".to_string(), "weather api key".to_string());
        store
            .insert_image(
                &ImageRecord {
                    id: "weather-v1".into(),
                    slug: "weather".into(),
                    version: 1,
                    name: "Weather".into(),
                    container_ref: "toolchat/weather:1".into(),
                    auth_mode: AuthMode::Authenticated,
                    oauth_provider: None,
                    env_schema,
                },
                &[],
            )
            .unwrap();
        store
    }

    fn api_key_env() -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("API_KEY".to_string(), "k".to_string());
        env
    }

    #[tokio::test]
    async fn test_unknown_image_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(seeded_store(), dir.path(), "true");
        let err = launcher
            .start_instance("nope-v1", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolServerError::NotFound { entity: "image", .. }));
    }

    #[tokio::test]
    async fn test_missing_env_creates_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let launcher = launcher(store.clone(), dir.path(), "true");
        let err = launcher
            .start_instance("weather-v1", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolServerError::InvalidEnv { .. }));
        assert!(store.list_instances().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_host_exiting_early_marks_instance_dead() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let launcher = launcher(store.clone(), dir.path(), "true");

        let err = launcher
            .start_instance("weather-v1", &api_key_env())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolServerError::Rendezvous { .. }));

        let instances = store.list_instances().unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].state, InstanceState::Dead);
        let uid = instances[0].id.strip_prefix("weather-v1-inst-").unwrap();
        assert_eq!(uid.len(), INSTANCE_UID_LEN);
        assert!(uid.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(store.ready_catalog_rows().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_host_binary_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let launcher = launcher(store.clone(), dir.path(), "/nonexistent/toolchat-instance");
        let err = launcher
            .start_instance("weather-v1", &api_key_env())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolServerError::SpawnFailed { .. }));
        assert_eq!(store.list_instances().unwrap()[0].state, InstanceState::Dead);
    }

    #[test]
    fn test_qualified_names_fit_provider_limit() {
        let instance_id = format!("google-calendar-v1-inst-{}", instance_uid());
        let name = crate::tool_server::registry::qualify(&instance_id, "list_events");
        assert!(name.len() <= 64, "{name} is {} chars", name.len());
    }

    fn process_alive(pid: u32) -> bool {
        std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_host_killed_when_record_deleted_while_starting() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let launcher = launcher(store.clone(), dir.path(), "true");

        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        assert!(process_alive(pid));

        // No record: as if DELETE /instances/{id} ran before the address arrived.
        let err = launcher
            .adopt_host("weather-v1-inst-gone", "http://127.0.0.1:9", child)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolServerError::Store(_)));
        assert!(!process_alive(pid));
        assert!(launcher.hosts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_adopted_host_is_reaped_on_kill() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        store
            .insert_instance(&InstanceRecord {
                id: "weather-v1-inst-b".into(),
                image_id: "weather-v1".into(),
                env: BTreeMap::new(),
                address: None,
                state: InstanceState::Starting,
                created_at: "2026-01-01T00:00:00Z".into(),
            })
            .unwrap();
        let launcher = launcher(store.clone(), dir.path(), "true");

        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        launcher
            .adopt_host("weather-v1-inst-b", "http://127.0.0.1:9", child)
            .await
            .unwrap();
        assert_eq!(
            store.get_instance("weather-v1-inst-b").unwrap().unwrap().state,
            InstanceState::Ready
        );
        assert_eq!(launcher.hosts.lock().await.len(), 1);

        launcher.kill_instance("weather-v1-inst-b").await.unwrap();
        assert!(!process_alive(pid));
        assert!(launcher.hosts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        store
            .insert_instance(&InstanceRecord {
                id: "weather-v1-inst-a".into(),
                image_id: "weather-v1".into(),
                env: BTreeMap::new(),
                address: None,
                state: InstanceState::Starting,
                created_at: "2026-01-01T00:00:00Z".into(),
            })
            .unwrap();
        // Address of a port nobody listens on: the facade kill fails and is logged.
        store
            .mark_instance_ready("weather-v1-inst-a", "http://127.0.0.1:9")
            .unwrap();

        let launcher = launcher(store.clone(), dir.path(), "true");
        launcher.kill_instance("weather-v1-inst-a").await.unwrap();
        assert!(store.get_instance("weather-v1-inst-a").unwrap().is_none());

        launcher.kill_instance("weather-v1-inst-a").await.unwrap();
        launcher.kill_instance("never-existed").await.unwrap();
    }
}
