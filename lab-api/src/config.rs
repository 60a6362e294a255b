use lab_core::{env, ConfigError};
use lab_orchestrator::ProvisionerSettings;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_janitor_interval")]
    pub janitor_interval_secs: u64,

    /// Deadline for every call to a hypervisor, firewall or DNS controller.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How long a `pending` machine may go untouched before it counts as
    /// abandoned and can be torn down.
    #[serde(default = "default_pending_grace")]
    pub pending_grace_secs: u64,

    #[serde(default = "default_hypervisors")]
    pub hypervisors: Vec<String>,

    /// Managed suffix appended to every requested subdomain.
    #[serde(default)]
    pub domain_prefix: Option<String>,

    /// Zone for the record published with a new machine.
    #[serde(default)]
    pub default_zone: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3121".to_string()
}

fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lab")
        .join("api")
        .join("lab.db")
}

fn default_janitor_interval() -> u64 {
    300
}

fn default_request_timeout() -> u64 {
    120
}

fn default_pending_grace() -> u64 {
    900
}

fn default_hypervisors() -> Vec<String> {
    vec!["proxmox".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            janitor_interval_secs: default_janitor_interval(),
            request_timeout_secs: default_request_timeout(),
            pending_grace_secs: default_pending_grace(),
            hypervisors: default_hypervisors(),
            domain_prefix: None,
            default_zone: None,
        }
    }
}

impl Config {
    /// Read the service configuration. Unset variables take their defaults;
    /// set but malformed numbers are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let hypervisors = env::optional("LAB_HYPERVISORS")
            .map(|raw| env::list(&raw))
            .unwrap_or(defaults.hypervisors);

        Ok(Self {
            bind_addr: env::or_default("LAB_API_BIND", &defaults.bind_addr),
            db_path: env::optional("LAB_API_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            janitor_interval_secs: env::parse_or("LAB_API_JANITOR_INTERVAL", defaults.janitor_interval_secs)?,
            request_timeout_secs: env::parse_or("LAB_API_REQUEST_TIMEOUT", defaults.request_timeout_secs)?,
            pending_grace_secs: env::parse_or("LAB_API_PENDING_GRACE", defaults.pending_grace_secs)?,
            hypervisors,
            domain_prefix: env::optional("DOMAIN_PREFIX"),
            default_zone: env::optional("DNS_DEFAULT_ZONE"),
        })
    }

    pub fn provisioner_settings(&self) -> ProvisionerSettings {
        ProvisionerSettings {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            domain_suffix: self.domain_prefix.clone(),
            default_zone: self.default_zone.clone(),
            pending_grace: chrono::Duration::seconds(self.pending_grace_secs as i64),
            ..ProvisionerSettings::default()
        }
    }
}
