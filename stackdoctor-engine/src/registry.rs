//! # Plugin Registry
//!
//! Single source of truth for plugin identity, type indexing,
//! middleware-type indexing and current state. Two indexes are kept under
//! one read-write lock: instances by name, and an ordered name list per
//! middleware type (registration order doubles as priority order for
//! selection).
//!
//! Locking discipline: the lock is never held across a plugin call.
//! Lookups return snapshots (`Arc` plugin handle + cloned metadata) and
//! release the lock before the caller does I/O.

use crate::error::DiagnosisError;
use chrono::{DateTime, Utc};
use stackdoctor_sdk::context::CallContext;
use stackdoctor_sdk::plugin::{
    MiddlewarePlugin, PluginConfig, PluginFactory, PluginState, PluginType,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A registered plugin with its configuration and lifecycle state.
#[derive(Clone)]
pub struct PluginInstance {
    pub name: String,
    pub plugin: Arc<dyn MiddlewarePlugin>,
    pub config: PluginConfig,
    pub state: PluginState,
    pub loaded_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state)
            .field("loaded_at", &self.loaded_at)
            .field("last_error", &self.last_error)
            .finish()
    }
}

impl PluginInstance {
    /// Whether lookups should hand this instance out.
    fn is_available(&self) -> bool {
        matches!(self.state, PluginState::Running | PluginState::Initializing)
    }
}

#[derive(Default)]
struct RegistryInner {
    factories: HashMap<String, Arc<dyn PluginFactory>>,
    instances: HashMap<String, PluginInstance>,
    /// Ordered instance names per middleware type.
    by_middleware: HashMap<String, Vec<String>>,
    /// Global registration order, used for reverse-order shutdown.
    registration_order: Vec<String>,
}

#[derive(Default)]
pub struct PluginRegistry {
    inner: RwLock<RegistryInner>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a middleware type. Fails with
    /// `AlreadyRegistered` if the type already has one.
    pub fn register_factory(&self, factory: Arc<dyn PluginFactory>) -> Result<(), DiagnosisError> {
        let key = factory.middleware_type().as_str().to_string();
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.factories.contains_key(&key) {
            return Err(DiagnosisError::AlreadyRegistered { name: key });
        }
        tracing::info!(middleware = %key, "registered plugin factory");
        inner.factories.insert(key, factory);
        Ok(())
    }

    /// Instantiate a plugin via its factory, connect it, and store the
    /// instance in `Initializing` state.
    pub async fn create_plugin(
        &self,
        ctx: &CallContext,
        name: &str,
        config: PluginConfig,
    ) -> Result<Arc<dyn MiddlewarePlugin>, DiagnosisError> {
        let middleware_key = config.middleware_type.as_str().to_string();
        let plugin = {
            let inner = self.inner.read().expect("registry lock poisoned");
            if inner.instances.contains_key(name) {
                return Err(DiagnosisError::AlreadyRegistered {
                    name: name.to_string(),
                });
            }
            let factory =
                inner
                    .factories
                    .get(&middleware_key)
                    .ok_or(DiagnosisError::FactoryMissing {
                        middleware: middleware_key.clone(),
                    })?;
            factory.create(&config)?
        };

        // Connect outside the lock.
        plugin.connect(ctx, &config.connection).await?;

        let instance = PluginInstance {
            name: name.to_string(),
            plugin: Arc::clone(&plugin),
            config,
            state: PluginState::Initializing,
            loaded_at: Utc::now(),
            last_error: None,
        };

        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.instances.contains_key(name) {
            // Raced with a concurrent create of the same name.
            return Err(DiagnosisError::AlreadyRegistered {
                name: name.to_string(),
            });
        }
        inner.instances.insert(name.to_string(), instance);
        inner
            .by_middleware
            .entry(middleware_key)
            .or_default()
            .push(name.to_string());
        inner.registration_order.push(name.to_string());
        tracing::info!(plugin = name, "plugin created and connected");
        Ok(plugin)
    }

    /// Insert an instance directly (used by embedders wiring pre-built
    /// plugins). The instance starts `Uninitialized`.
    pub fn register_instance(
        &self,
        name: &str,
        plugin: Arc<dyn MiddlewarePlugin>,
        config: PluginConfig,
    ) -> Result<(), DiagnosisError> {
        let middleware_key = config.middleware_type.as_str().to_string();
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.instances.contains_key(name) {
            return Err(DiagnosisError::AlreadyRegistered {
                name: name.to_string(),
            });
        }
        inner.instances.insert(
            name.to_string(),
            PluginInstance {
                name: name.to_string(),
                plugin,
                config,
                state: PluginState::Uninitialized,
                loaded_at: Utc::now(),
                last_error: None,
            },
        );
        inner
            .by_middleware
            .entry(middleware_key)
            .or_default()
            .push(name.to_string());
        inner.registration_order.push(name.to_string());
        Ok(())
    }

    /// Fetch an available (Running or Initializing) instance by name.
    pub fn get(&self, name: &str) -> Result<PluginInstance, DiagnosisError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        match inner.instances.get(name) {
            Some(instance) if instance.is_available() => Ok(instance.clone()),
            _ => Err(DiagnosisError::NotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Fetch the first available instance for a middleware type,
    /// preferring higher-priority (earlier-registered, higher `priority`
    /// field) instances.
    pub fn get_by_middleware(&self, middleware: &str) -> Result<PluginInstance, DiagnosisError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let names = inner
            .by_middleware
            .get(middleware)
            .ok_or(DiagnosisError::NotFound {
                name: middleware.to_string(),
            })?;
        let mut candidates: Vec<&PluginInstance> = names
            .iter()
            .filter_map(|n| inner.instances.get(n))
            .filter(|i| i.is_available())
            .collect();
        candidates.sort_by_key(|i| std::cmp::Reverse(i.config.priority));
        candidates
            .first()
            .map(|i| (*i).clone())
            .ok_or(DiagnosisError::NotFound {
                name: middleware.to_string(),
            })
    }

    /// Remove an instance. Fails with `InUse` while Running.
    pub fn unregister(&self, name: &str) -> Result<(), DiagnosisError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let instance = inner
            .instances
            .get(name)
            .ok_or(DiagnosisError::NotFound {
                name: name.to_string(),
            })?;
        if instance.state == PluginState::Running {
            return Err(DiagnosisError::InUse {
                name: name.to_string(),
            });
        }
        let middleware_key = instance.config.middleware_type.as_str().to_string();
        inner.instances.remove(name);
        if let Some(names) = inner.by_middleware.get_mut(&middleware_key) {
            names.retain(|n| n != name);
        }
        inner.registration_order.retain(|n| n != name);
        tracing::info!(plugin = name, "plugin unregistered");
        Ok(())
    }

    /// Snapshot of every instance regardless of state.
    pub fn all(&self) -> Vec<PluginInstance> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .registration_order
            .iter()
            .filter_map(|n| inner.instances.get(n))
            .cloned()
            .collect()
    }

    pub fn list_by_type(&self, plugin_type: PluginType) -> Vec<PluginInstance> {
        self.all()
            .into_iter()
            .filter(|i| i.plugin.info().plugin_type == plugin_type)
            .collect()
    }

    pub fn list_by_middleware(&self, middleware: &str) -> Vec<PluginInstance> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .by_middleware
            .get(middleware)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| inner.instances.get(n))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Registration order snapshot; `stop_all` walks it in reverse.
    pub fn registration_order(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .registration_order
            .clone()
    }

    /// Internal state mutation used by the lifecycle manager.
    pub(crate) fn set_state(
        &self,
        name: &str,
        state: PluginState,
        last_error: Option<String>,
    ) -> Result<(), DiagnosisError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let instance = inner
            .instances
            .get_mut(name)
            .ok_or(DiagnosisError::NotFound {
                name: name.to_string(),
            })?;
        tracing::debug!(plugin = name, from = %instance.state, to = %state, "plugin state transition");
        instance.state = state;
        if last_error.is_some() {
            instance.last_error = last_error;
        }
        Ok(())
    }

    /// Current state regardless of availability.
    pub fn state_of(&self, name: &str) -> Result<PluginState, DiagnosisError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .instances
            .get(name)
            .map(|i| i.state)
            .ok_or(DiagnosisError::NotFound {
                name: name.to_string(),
            })
    }

    pub(crate) fn update_config(
        &self,
        name: &str,
        config: PluginConfig,
    ) -> Result<(), DiagnosisError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let instance = inner
            .instances
            .get_mut(name)
            .ok_or(DiagnosisError::NotFound {
                name: name.to_string(),
            })?;
        instance.config = config;
        Ok(())
    }

    /// Full instance snapshot regardless of state (lifecycle internals).
    pub(crate) fn instance_of(&self, name: &str) -> Result<PluginInstance, DiagnosisError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .instances
            .get(name)
            .cloned()
            .ok_or(DiagnosisError::NotFound {
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{static_plugin_config, StaticPlugin, StaticPluginFactory};

    fn registry_with_factory() -> PluginRegistry {
        let registry = PluginRegistry::new();
        registry
            .register_factory(Arc::new(StaticPluginFactory::healthy()))
            .unwrap();
        registry
    }

    #[test]
    fn duplicate_factory_is_rejected() {
        let registry = registry_with_factory();
        let err = registry
            .register_factory(Arc::new(StaticPluginFactory::healthy()))
            .unwrap_err();
        assert!(matches!(err, DiagnosisError::AlreadyRegistered { .. }));
    }

    #[tokio::test]
    async fn create_requires_a_factory() {
        let registry = PluginRegistry::new();
        let err = match registry
            .create_plugin(
                &CallContext::background(),
                "cache-1",
                static_plugin_config(),
            )
            .await
        {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, DiagnosisError::FactoryMissing { .. }));
    }

    #[tokio::test]
    async fn created_plugins_are_visible_while_initializing() {
        let registry = registry_with_factory();
        registry
            .create_plugin(
                &CallContext::background(),
                "cache-1",
                static_plugin_config(),
            )
            .await
            .unwrap();

        assert_eq!(
            registry.state_of("cache-1").unwrap(),
            PluginState::Initializing
        );
        assert!(registry.get("cache-1").is_ok());
        assert!(registry.get_by_middleware("static").is_ok());
    }

    #[tokio::test]
    async fn stopped_plugins_are_not_returned() {
        let registry = registry_with_factory();
        registry
            .create_plugin(
                &CallContext::background(),
                "cache-1",
                static_plugin_config(),
            )
            .await
            .unwrap();
        registry
            .set_state("cache-1", PluginState::Stopped, None)
            .unwrap();

        assert!(matches!(
            registry.get("cache-1"),
            Err(DiagnosisError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unregister_refuses_running_plugins() {
        let registry = registry_with_factory();
        registry
            .create_plugin(
                &CallContext::background(),
                "cache-1",
                static_plugin_config(),
            )
            .await
            .unwrap();
        registry
            .set_state("cache-1", PluginState::Running, None)
            .unwrap();

        assert!(matches!(
            registry.unregister("cache-1"),
            Err(DiagnosisError::InUse { .. })
        ));

        registry
            .set_state("cache-1", PluginState::Stopped, None)
            .unwrap();
        registry.unregister("cache-1").unwrap();
        assert!(registry.all().is_empty());
    }

    #[tokio::test]
    async fn priority_selects_among_instances() {
        let registry = registry_with_factory();
        let low = static_plugin_config();
        let mut high = static_plugin_config();
        high.priority = 10;

        registry
            .create_plugin(&CallContext::background(), "low", low)
            .await
            .unwrap();
        registry
            .create_plugin(&CallContext::background(), "high", high)
            .await
            .unwrap();

        let chosen = registry.get_by_middleware("static").unwrap();
        assert_eq!(chosen.name, "high");
    }

    #[tokio::test]
    async fn duplicate_instance_names_are_rejected() {
        let registry = registry_with_factory();
        registry
            .register_instance(
                "cache-1",
                Arc::new(StaticPlugin::healthy()),
                static_plugin_config(),
            )
            .unwrap();
        let err = registry
            .register_instance(
                "cache-1",
                Arc::new(StaticPlugin::healthy()),
                static_plugin_config(),
            )
            .unwrap_err();
        assert!(matches!(err, DiagnosisError::AlreadyRegistered { .. }));
    }
}
