//! Proxmox VE backend: clone a template by id, grow it, resize its disk.

mod provider;

pub use provider::ProxmoxProvider;

use lab_core::{env, ConfigError};
use std::time::Duration;

use crate::ResourceLimits;

#[derive(Clone)]
pub struct ProxmoxConfig {
    pub server_url: String,
    pub node: String,
    pub username: String,
    pub password: String,
    pub template_vmid: u32,
    pub limits: ResourceLimits,
    pub verify_tls: bool,
    pub request_timeout: Duration,
    /// Upper bound for one clone/stop/delete task to finish.
    pub task_timeout: Duration,
    pub task_poll_interval: Duration,
    pub bridge: String,
    pub ci_user: Option<String>,
    pub ci_password: Option<String>,
    /// When set, the assigned address is written to cloud-init `ipconfig0`.
    pub network: Option<StaticNetwork>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticNetwork {
    pub prefix_len: u8,
    pub gateway: String,
}

impl ProxmoxConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = ResourceLimits::default();

        let network = match env::optional("PROXMOX_GATEWAY") {
            Some(gateway) => Some(StaticNetwork {
                prefix_len: env::parse_or("PROXMOX_PREFIX_LEN", 24)?,
                gateway,
            }),
            None => None,
        };

        Ok(Self {
            server_url: env::required("PROXMOX_SERVER_URL")?,
            node: env::required("PROXMOX_NODE")?,
            username: env::required("PVE_USERNAME")?,
            password: env::required("PVE_PASSWORD")?,
            template_vmid: env::parse_or("PROXMOX_TEMPLATE_VMID", 9000)?,
            limits: ResourceLimits {
                max_memory_mb: env::parse_or("PROXMOX_MAX_MEMORY", defaults.max_memory_mb)?,
                max_cpu_cores: env::parse_or("PROXMOX_MAX_CPU_CORES", defaults.max_cpu_cores)?,
                max_disk_gb: env::parse_or("PROXMOX_MAX_DISK_SIZE", defaults.max_disk_gb)?,
            },
            verify_tls: env::flag("VERIFY_TLS"),
            request_timeout: Duration::from_secs(env::parse_or("PROXMOX_REQUEST_TIMEOUT", 30)?),
            task_timeout: Duration::from_secs(env::parse_or("PROXMOX_TASK_TIMEOUT", 300)?),
            task_poll_interval: Duration::from_secs(2),
            bridge: env::or_default("PROXMOX_BRIDGE", "vmbr1"),
            ci_user: env::optional("PROXMOX_CI_USER"),
            ci_password: env::optional("PROXMOX_CI_PASSWORD"),
            network,
        })
    }
}
