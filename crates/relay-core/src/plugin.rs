use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    registry::{
        dispatch, EventType, HandlerCtx, HandlerMetadata, HandlerPayload, HandlerRegistry,
        HandlerSet, PluginFilter,
    },
    Result,
};

/// A bundle of handlers with optional lifecycle hooks.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Handlers to register. Their `owner_plugin` is forced to `name()`.
    fn handlers(&self) -> Vec<HandlerMetadata>;

    async fn on_load(&self) -> Result<()> {
        Ok(())
    }

    async fn on_enable(&self) -> Result<()> {
        Ok(())
    }

    async fn on_disable(&self) -> Result<()> {
        Ok(())
    }

    async fn on_unload(&self) -> Result<()> {
        Ok(())
    }
}

struct Loaded {
    plugin: Arc<dyn Plugin>,
    enabled: bool,
}

/// Owns the loaded plugins and keeps the registry in step with them.
pub struct PluginHost {
    registry: Arc<HandlerRegistry>,
    plugins: Mutex<Vec<Loaded>>,
}

impl PluginHost {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            plugins: Mutex::new(Vec::new()),
        }
    }

    fn handler_set(plugins: &[Arc<dyn Plugin>]) -> Result<HandlerSet> {
        HandlerSet::from_handlers(plugins.iter().flat_map(|p| {
            let owner = p.name().to_string();
            p.handlers().into_iter().map(move |mut h| {
                h.owner_plugin = owner.clone();
                h
            })
        }))
    }

    /// Load `plugins` into an empty host.
    pub async fn load_all(&self, plugins: Vec<Arc<dyn Plugin>>) -> Result<()> {
        self.reload(plugins).await
    }

    /// Replace every loaded plugin. The new handler set is built first; if
    /// that fails nothing changes. Otherwise the old plugins are shut down
    /// and the new set goes live in a single swap.
    pub async fn reload(&self, plugins: Vec<Arc<dyn Plugin>>) -> Result<()> {
        self.reload_keeping(plugins, &[]).await
    }

    /// Reload the plugins that are loaded now, picking up fresh handler
    /// lists. Plugins an admin disabled stay disabled.
    pub async fn reload_current(&self) -> Result<()> {
        let (plugins, disabled): (Vec<_>, Vec<_>) = {
            let loaded = self.plugins.lock().await;
            (
                loaded.iter().map(|l| l.plugin.clone()).collect(),
                loaded
                    .iter()
                    .filter(|l| !l.enabled)
                    .map(|l| l.plugin.name().to_string())
                    .collect(),
            )
        };
        self.reload_keeping(plugins, &disabled).await
    }

    async fn reload_keeping(&self, plugins: Vec<Arc<dyn Plugin>>, disabled: &[String]) -> Result<()> {
        let set = Self::handler_set(&plugins)?;
        let mut loaded = self.plugins.lock().await;

        for old in loaded.iter().filter(|l| l.enabled) {
            if let Err(e) = old.plugin.on_disable().await {
                warn!(plugin = old.plugin.name(), error = %e, "on_disable failed");
            }
        }
        for old in loaded.iter() {
            if let Err(e) = old.plugin.on_unload().await {
                warn!(plugin = old.plugin.name(), error = %e, "on_unload failed");
            }
        }

        let handlers = set.len();
        self.registry.swap(set);
        *loaded = plugins
            .into_iter()
            .map(|plugin| Loaded {
                plugin,
                enabled: true,
            })
            .collect();
        info!(plugins = loaded.len(), handlers, "plugins loaded");

        for l in loaded.iter_mut() {
            let name = l.plugin.name().to_string();
            if let Err(e) = l.plugin.on_load().await {
                warn!(plugin = %name, error = %e, "on_load failed; disabling");
                l.enabled = false;
            } else if disabled.contains(&name) {
                l.enabled = false;
            } else if let Err(e) = l.plugin.on_enable().await {
                warn!(plugin = %name, error = %e, "on_enable failed; disabling");
                l.enabled = false;
            }
            if !l.enabled {
                self.registry.set_plugin_enabled(&name, false);
            }
        }

        let hooks = self
            .registry
            .snapshot()
            .lookup(EventType::Loaded, &PluginFilter::All);
        for l in loaded.iter() {
            let mut hctx = HandlerCtx::new(EventType::Loaded)
                .with_payload(HandlerPayload::Plugin(l.plugin.name()));
            if let Err(e) = dispatch(&hooks, &mut hctx).await {
                warn!(plugin = l.plugin.name(), error = %e, "loaded hook failed");
            }
        }
        Ok(())
    }

    /// Returns false if no plugin has that name.
    pub async fn enable(&self, name: &str) -> Result<bool> {
        let mut loaded = self.plugins.lock().await;
        let Some(l) = loaded.iter_mut().find(|l| l.plugin.name() == name) else {
            return Ok(false);
        };
        l.plugin.on_enable().await?;
        l.enabled = true;
        self.registry.set_plugin_enabled(name, true);
        info!(plugin = name, "plugin enabled");
        Ok(true)
    }

    pub async fn disable(&self, name: &str) -> Result<bool> {
        let mut loaded = self.plugins.lock().await;
        let Some(l) = loaded.iter_mut().find(|l| l.plugin.name() == name) else {
            return Ok(false);
        };
        self.registry.set_plugin_enabled(name, false);
        l.enabled = false;
        l.plugin.on_disable().await?;
        info!(plugin = name, "plugin disabled");
        Ok(true)
    }

    pub async fn names(&self) -> Vec<String> {
        self.plugins
            .lock()
            .await
            .iter()
            .map(|l| l.plugin.name().to_string())
            .collect()
    }

    /// Loaded plugins with their enabled flag, in load order.
    pub async fn list(&self) -> Vec<(String, bool)> {
        self.plugins
            .lock()
            .await
            .iter()
            .map(|l| (l.plugin.name().to_string(), l.enabled))
            .collect()
    }
}
