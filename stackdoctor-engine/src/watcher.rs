//! # Config Hot Reload
//!
//! Watches a directory of per-plugin TOML config files. Filesystem events
//! are bridged from the `notify` watcher thread into a tokio channel,
//! debounced for 100 ms with duplicate paths drained and coalesced, then
//! each changed file is parsed, validated and handed to
//! `lifecycle.reload`. A file that fails validation or reload leaves the
//! running plugin untouched; the error is logged and the watcher keeps
//! going.

use crate::error::DiagnosisError;
use crate::lifecycle::LifecycleManager;
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use stackdoctor_sdk::plugin::{ConnectionConfig, MiddlewareType, PluginConfig};
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const DEBOUNCE: Duration = Duration::from_millis(100);

/// The on-disk shape of one plugin config file:
///
/// ```toml
/// [plugin]
/// name = "cache-main"
/// type = "redis"
/// enabled = true
/// priority = 5
///
/// [plugin.connection]
/// host = "127.0.0.1"
/// port = 6379
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginFileConfig {
    pub plugin: PluginFileEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginFileEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub middleware_type: MiddlewareType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

impl PluginFileEntry {
    pub fn to_plugin_config(&self) -> PluginConfig {
        PluginConfig {
            middleware_type: self.middleware_type.clone(),
            connection: self.connection.clone(),
            options: self.settings.clone(),
            enabled: self.enabled,
            priority: self.priority,
        }
    }
}

/// Parse and validate one plugin config file.
pub fn load_plugin_file(path: &Path) -> Result<PluginFileEntry, DiagnosisError> {
    let raw = std::fs::read_to_string(path)?;
    let parsed: PluginFileConfig =
        toml::from_str(&raw).map_err(|e| DiagnosisError::config(e.to_string()))?;
    validate_entry(&parsed.plugin)?;
    Ok(parsed.plugin)
}

fn validate_entry(entry: &PluginFileEntry) -> Result<(), DiagnosisError> {
    if entry.name.trim().is_empty() {
        return Err(DiagnosisError::config("plugin name must not be empty"));
    }
    if entry.connection.host.trim().is_empty() {
        return Err(DiagnosisError::config("connection host must not be empty"));
    }
    if entry.connection.port == 0 {
        return Err(DiagnosisError::config("connection port must not be zero"));
    }
    Ok(())
}

/// Receives validated configs from the watcher. Implemented by the
/// lifecycle manager; tests substitute recorders.
#[async_trait::async_trait]
pub trait ConfigReloader: Send + Sync {
    async fn reload(&self, name: &str, config: PluginConfig) -> Result<(), DiagnosisError>;
}

#[async_trait::async_trait]
impl ConfigReloader for LifecycleManager {
    async fn reload(&self, name: &str, config: PluginConfig) -> Result<(), DiagnosisError> {
        LifecycleManager::reload(self, name, config).await
    }
}

pub struct ConfigWatcher {
    dir: PathBuf,
    reloader: Arc<dyn ConfigReloader>,
    debounce: Duration,
}

/// Keeps the watcher thread and its pump task alive; dropping stops both.
pub struct WatcherHandle {
    _watcher: notify::RecommendedWatcher,
    stop: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl WatcherHandle {
    pub async fn shutdown(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

impl ConfigWatcher {
    pub fn new(dir: impl Into<PathBuf>, reloader: Arc<dyn ConfigReloader>) -> Self {
        Self {
            dir: dir.into(),
            reloader,
            debounce: DEBOUNCE,
        }
    }

    /// Shorten the debounce window (tests).
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Start watching. Events flow until the returned handle shuts down.
    pub fn start(self) -> Result<WatcherHandle, DiagnosisError> {
        let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        for path in event.paths {
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(err) => tracing::warn!(error = %err, "config watcher event error"),
            }
        })
        .map_err(|e| DiagnosisError::config(e.to_string()))?;

        watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|e| DiagnosisError::config(e.to_string()))?;
        tracing::info!(dir = %self.dir.display(), "config watcher started");

        let stop = CancellationToken::new();
        let task_stop = stop.clone();
        let reloader = Arc::clone(&self.reloader);
        let debounce = self.debounce;
        let task = tokio::spawn(async move {
            pump_events(rx, reloader, debounce, task_stop).await;
        });

        Ok(WatcherHandle {
            _watcher: watcher,
            stop,
            task,
        })
    }
}

async fn pump_events(
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    reloader: Arc<dyn ConfigReloader>,
    debounce: Duration,
    stop: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = stop.cancelled() => return,
            path = rx.recv() => match path {
                Some(path) => path,
                None => return,
            },
        };

        // Debounce: let the burst settle, then drain duplicates.
        tokio::time::sleep(debounce).await;
        let mut pending: HashSet<PathBuf> = HashSet::new();
        pending.insert(first);
        while let Ok(path) = rx.try_recv() {
            pending.insert(path);
        }

        for path in pending {
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            apply_config_file(&path, reloader.as_ref()).await;
        }
    }
}

async fn apply_config_file(path: &Path, reloader: &dyn ConfigReloader) {
    let entry = match load_plugin_file(path) {
        Ok(entry) => entry,
        Err(err) => {
            tracing::error!(
                file = %path.display(),
                error = %err,
                "invalid plugin config; keeping current state"
            );
            return;
        }
    };
    if !entry.enabled {
        tracing::info!(plugin = %entry.name, "config disables plugin; skipping reload");
        return;
    }
    let name = entry.name.clone();
    match reloader.reload(&name, entry.to_plugin_config()).await {
        Ok(()) => tracing::info!(plugin = %name, file = %path.display(), "hot reload applied"),
        Err(err) => tracing::error!(
            plugin = %name,
            error = %err,
            "hot reload failed; plugin left in current state"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingReloader {
        calls: Mutex<Vec<(String, PluginConfig)>>,
    }

    impl RecordingReloader {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, PluginConfig)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ConfigReloader for RecordingReloader {
        async fn reload(&self, name: &str, config: PluginConfig) -> Result<(), DiagnosisError> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), config));
            Ok(())
        }
    }

    const VALID_CONFIG: &str = r#"
[plugin]
name = "cache-main"
type = "redis"
priority = 5

[plugin.connection]
host = "127.0.0.1"
port = 6379
"#;

    const NAMELESS_CONFIG: &str = r#"
[plugin]
name = ""
type = "redis"

[plugin.connection]
host = "127.0.0.1"
port = 6379
"#;

    #[test]
    fn parses_a_valid_plugin_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.toml");
        std::fs::write(&path, VALID_CONFIG).unwrap();

        let entry = load_plugin_file(&path).unwrap();
        assert_eq!(entry.name, "cache-main");
        assert_eq!(entry.priority, 5);
        assert_eq!(entry.connection.port, 6379);
        assert!(entry.enabled);
    }

    #[test]
    fn rejects_configs_without_a_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.toml");
        std::fs::write(&path, NAMELESS_CONFIG).unwrap();
        assert!(matches!(
            load_plugin_file(&path),
            Err(DiagnosisError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn reloads_on_file_write() {
        let dir = tempfile::tempdir().unwrap();
        let reloader = RecordingReloader::new();
        let handle = ConfigWatcher::new(dir.path(), Arc::clone(&reloader) as Arc<dyn ConfigReloader>)
            .with_debounce(Duration::from_millis(20))
            .start()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(dir.path().join("cache.toml"), VALID_CONFIG).unwrap();

        // Give the watcher time to observe, debounce and apply.
        let mut waited = 0;
        while reloader.calls().is_empty() && waited < 40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            waited += 1;
        }
        let calls = reloader.calls();
        assert!(!calls.is_empty(), "expected at least one reload");
        assert_eq!(calls[0].0, "cache-main");
        assert_eq!(calls[0].1.priority, 5);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_triggers_no_reload() {
        let dir = tempfile::tempdir().unwrap();
        let reloader = RecordingReloader::new();
        let handle = ConfigWatcher::new(dir.path(), Arc::clone(&reloader) as Arc<dyn ConfigReloader>)
            .with_debounce(Duration::from_millis(20))
            .start()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(dir.path().join("bad.toml"), NAMELESS_CONFIG).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(reloader.calls().is_empty());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn non_toml_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let reloader = RecordingReloader::new();
        let handle = ConfigWatcher::new(dir.path(), Arc::clone(&reloader) as Arc<dyn ConfigReloader>)
            .with_debounce(Duration::from_millis(20))
            .start()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(dir.path().join("notes.txt"), "not a config").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(reloader.calls().is_empty());
        handle.shutdown().await;
    }
}
