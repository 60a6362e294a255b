//! vCenter backend: deploy a content-library template per OS.

mod provider;

pub use provider::VcenterProvider;

use lab_core::{env, ConfigError};
use std::collections::HashMap;
use std::time::Duration;

use crate::ResourceLimits;

#[derive(Clone)]
pub struct VcenterConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub cluster_id: String,
    pub folder_id: String,
    pub datastore_name: String,
    /// OS name (lowercase) to content-library item id.
    pub templates: HashMap<String, String>,
    pub limits: ResourceLimits,
    pub verify_tls: bool,
    pub request_timeout: Duration,
    pub name_prefix: String,
    /// Hardware key of the boot disk inside the template.
    pub disk_key: String,
}

impl VcenterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = ResourceLimits::default();

        Ok(Self {
            url: env::required("VCENTER_URL")?,
            username: env::required("VCENTER_USERNAME")?,
            password: env::required("VCENTER_PASSWORD")?,
            cluster_id: env::required("CLUSTER_ID")?,
            folder_id: env::required("FOLDER_ID")?,
            datastore_name: env::required("VCENTER_DATASTORE_NAME")?,
            templates: parse_templates(&env::required("VCENTER_TEMPLATES")?)?,
            limits: ResourceLimits {
                max_memory_mb: env::parse_or("VCENTER_MAX_MEMORY", defaults.max_memory_mb)?,
                max_cpu_cores: env::parse_or("VCENTER_MAX_CPU_CORES", defaults.max_cpu_cores)?,
                max_disk_gb: env::parse_or("VCENTER_MAX_DISK_SIZE", defaults.max_disk_gb)?,
            },
            verify_tls: env::flag("VERIFY_TLS"),
            request_timeout: Duration::from_secs(env::parse_or("VCENTER_REQUEST_TIMEOUT", 60)?),
            name_prefix: env::or_default("VCENTER_NAME_PREFIX", "OICT-AUTO"),
            disk_key: env::or_default("VCENTER_DISK_KEY", "2000"),
        })
    }
}

/// Parse `ubuntu=lib-item-1,debian=lib-item-2`.
pub fn parse_templates(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    env::list(raw)
        .into_iter()
        .map(|entry| match entry.split_once('=') {
            Some((os, id)) if !os.trim().is_empty() && !id.trim().is_empty() => {
                Ok((os.trim().to_ascii_lowercase(), id.trim().to_string()))
            }
            _ => Err(ConfigError::Invalid {
                name: "VCENTER_TEMPLATES".to_string(),
                value: entry,
            }),
        })
        .collect()
}
