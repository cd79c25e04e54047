use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use crate::{
    domain::Origin, event::MessageResult, messaging::types::PlatformCapabilities, Result,
};

/// Outbound side of a platform adapter.
///
/// Retries are the adapter's business; the pipeline calls `send` once and
/// only logs failures.
#[async_trait]
pub trait PlatformPort: Send + Sync {
    /// Platform id, matching `Origin::platform`.
    fn name(&self) -> &str;

    fn capabilities(&self) -> PlatformCapabilities;

    async fn send(&self, origin: &Origin, result: &MessageResult) -> Result<()>;
}

/// Platform ports by name. Adapters can be added while the bus is running.
#[derive(Default)]
pub struct Platforms {
    inner: RwLock<HashMap<String, Arc<dyn PlatformPort>>>,
}

impl Platforms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, port: Arc<dyn PlatformPort>) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(port.name().to_string(), port);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PlatformPort>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
