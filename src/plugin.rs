//! Observer plugins.
//!
//! Plugins are compiled in and registered by name with a factory producing a
//! state observer. Loading is isolated per plugin: a failing, empty or
//! panicking factory is logged and the remaining plugins still load.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::PluginError;
use crate::job::{ExecutionStateObserver, JobInfo};

/// Prefix shared by the names of all plugins.
pub const PLUGIN_PREFIX: &str = "taro_";

pub type PluginFactory =
    Box<dyn Fn() -> anyhow::Result<Option<Arc<dyn ExecutionStateObserver>>> + Send + Sync>;

#[derive(Default)]
pub struct PluginRegistry {
    factories: BTreeMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the plugins shipped with taro.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(StateLogPlugin::NAME, || {
            Ok(Some(Arc::new(StateLogPlugin) as Arc<dyn ExecutionStateObserver>))
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> anyhow::Result<Option<Arc<dyn ExecutionStateObserver>>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn load(&self, name: &str) -> Result<Arc<dyn ExecutionStateObserver>, PluginError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;

        match panic::catch_unwind(AssertUnwindSafe(factory)) {
            Ok(Ok(Some(observer))) => Ok(observer),
            Ok(Ok(None)) => Err(PluginError::NoListener(name.to_string())),
            Ok(Err(e)) => Err(PluginError::Factory {
                name: name.to_string(),
                reason: format!("{e:#}"),
            }),
            Err(payload) => Err(PluginError::Panicked {
                name: name.to_string(),
                reason: crate::job::panic_message(payload.as_ref()),
            }),
        }
    }

    /// Loads the requested plugins among those registered under `prefix`.
    ///
    /// Requested names that are not registered and plugins failing to load
    /// are logged and skipped.
    pub fn discover(
        &self,
        prefix: &str,
        names: &[String],
    ) -> BTreeMap<String, Arc<dyn ExecutionStateObserver>> {
        let mut loaded = BTreeMap::new();
        for name in names {
            if !name.starts_with(prefix) || !self.factories.contains_key(name) {
                tracing::warn!(plugin = %name, prefix, "plugin_not_found");
                continue;
            }
            match self.load(name) {
                Ok(observer) => {
                    tracing::debug!(plugin = %name, "plugin_loaded");
                    loaded.insert(name.clone(), observer);
                }
                Err(e) => tracing::error!(plugin = %name, error = %e, "plugin_load_failed"),
            }
        }
        loaded
    }
}

/// Built-in plugin logging every state transition.
pub struct StateLogPlugin;

impl StateLogPlugin {
    pub const NAME: &'static str = "taro_state_log";
}

impl ExecutionStateObserver for StateLogPlugin {
    fn state_update(&self, job_info: &JobInfo) {
        tracing::info!(
            job_id = %job_info.job_id,
            instance_id = %job_info.instance_id,
            state = %job_info.state(),
            status = job_info.status.as_deref().unwrap_or(""),
            "plugin_state_log"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn noop() -> anyhow::Result<Option<Arc<dyn ExecutionStateObserver>>> {
        Ok(Some(Arc::new(|_: &JobInfo| {}) as Arc<dyn ExecutionStateObserver>))
    }

    fn exploding() -> anyhow::Result<Option<Arc<dyn ExecutionStateObserver>>> {
        panic!("factory bug");
    }

    fn registry() -> PluginRegistry {
        let mut registry = PluginRegistry::with_builtins();
        registry.register("taro_noop", noop);
        registry.register("taro_broken", || Err(anyhow!("missing setting")));
        registry.register("taro_empty", || Ok(None));
        registry.register("taro_exploding", exploding);
        registry.register("other_noop", noop);
        registry
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn builtins_are_registered() {
        let registry = PluginRegistry::with_builtins();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec![StateLogPlugin::NAME]);
        assert!(registry.load(StateLogPlugin::NAME).is_ok());
    }

    #[test]
    fn load_errors_are_classified() {
        let registry = registry();
        assert!(matches!(registry.load("taro_missing"), Err(PluginError::NotFound(_))));
        assert!(matches!(registry.load("taro_empty"), Err(PluginError::NoListener(_))));
        assert!(matches!(registry.load("taro_broken"), Err(PluginError::Factory { .. })));
        match registry.load("taro_exploding") {
            Err(PluginError::Panicked { reason, .. }) => assert_eq!(reason, "factory bug"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn one_bad_plugin_never_blocks_others() {
        let loaded = registry().discover(
            PLUGIN_PREFIX,
            &names(&[
                "taro_broken",
                "taro_exploding",
                "taro_noop",
                "taro_empty",
                "taro_unknown",
                "other_noop",
                StateLogPlugin::NAME,
            ]),
        );
        assert_eq!(
            loaded.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["taro_noop", StateLogPlugin::NAME]
        );
    }
}
