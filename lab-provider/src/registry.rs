use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::error::{HypervisorError, Result};
use crate::proxmox::{ProxmoxConfig, ProxmoxProvider};
use crate::vcenter::{VcenterConfig, VcenterProvider};
use crate::Hypervisor;

/// Enabled backends keyed by [`Hypervisor::name`].
#[derive(Clone, Default)]
pub struct HypervisorRegistry {
    backends: HashMap<&'static str, Arc<dyn Hypervisor>>,
    default: Option<&'static str>,
}

impl HypervisorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend. The first one registered becomes the default.
    pub fn register(&mut self, backend: Arc<dyn Hypervisor>) -> &mut Self {
        let name = backend.name();
        self.default.get_or_insert(name);
        self.backends.insert(name, backend);
        self
    }

    pub fn with(mut self, backend: Arc<dyn Hypervisor>) -> Self {
        self.register(backend);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Hypervisor>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| HypervisorError::Unknown(name.to_string()))
    }

    /// Backend named in a request, or the default one when none is given.
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn Hypervisor>> {
        match name.or(self.default) {
            Some(name) => self.get(name),
            None => Err(HypervisorError::Unknown("<none configured>".to_string())),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.backends.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Build every named backend from its environment configuration.
    pub fn from_env(enabled: &[String]) -> Result<Self> {
        let mut registry = Self::new();

        for name in enabled {
            let backend: Arc<dyn Hypervisor> = match name.as_str() {
                "proxmox" => Arc::new(ProxmoxProvider::new(ProxmoxConfig::from_env()?)?),
                "vcenter" => Arc::new(VcenterProvider::new(VcenterConfig::from_env()?)?),
                other => return Err(HypervisorError::Unknown(other.to_string())),
            };
            info!(backend = %name, "Hypervisor backend enabled");
            registry.register(backend);
        }

        Ok(registry)
    }
}
