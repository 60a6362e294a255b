use async_trait::async_trait;
use lab_core::TimedCache;
use reqwest::{Client, Method};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::VcenterConfig;
use crate::error::{HypervisorError, Result};
use crate::http::{as_u64, base_url, build_client, read_json, CallFailure};
use crate::resources::{plan_overrides, ResourceOverrides, Resources};
use crate::{CreateSpec, CreationStage, Hypervisor, PowerState, ProvisionedVm, ResourceLimits, VmSnapshot};

const BACKEND: &str = "vcenter";
const SESSION_TTL: Duration = Duration::from_secs(25 * 60);
const DATASTORE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const SESSION_HEADER: &str = "vmware-api-session-id";
const GIB: u64 = 1024 * 1024 * 1024;

type CallResult<T> = std::result::Result<T, CallFailure>;

pub struct VcenterProvider {
    config: VcenterConfig,
    base: String,
    client: Client,
    session: TimedCache<String>,
    datastore: TimedCache<String>,
}

impl VcenterProvider {
    pub fn new(config: VcenterConfig) -> Result<Self> {
        let base = base_url(&config.url)?;
        let client = build_client(config.verify_tls, config.request_timeout)?;

        Ok(Self {
            config,
            base,
            client,
            session: TimedCache::new(SESSION_TTL),
            datastore: TimedCache::new(DATASTORE_TTL),
        })
    }

    pub fn vm_name(&self, owner: &str, name: &str) -> String {
        format!("{}-{}-{}", self.config.name_prefix, owner, name)
    }

    async fn login(&self) -> CallResult<String> {
        debug!(user = %self.config.username, "Opening vCenter session");

        let response = self
            .client
            .post(format!("{}/api/session", self.base))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?;

        match read_json(response).await? {
            Value::String(token) if !token.is_empty() => Ok(token),
            _ => Err(CallFailure::Unauthorized(
                "Session response carried no token".to_string(),
            )),
        }
    }

    async fn session_valid(&self, token: String) -> bool {
        let response = self
            .client
            .get(format!("{}/api/session", self.base))
            .header(SESSION_HEADER, token)
            .send()
            .await;

        matches!(response, Ok(r) if r.status().is_success())
    }

    async fn call(&self, method: Method, path: &str, body: Option<&Value>) -> CallResult<Value> {
        let token = self
            .session
            .get_validated(|token| self.session_valid(token), || self.login())
            .await?;

        let mut request = self
            .client
            .request(method, format!("{}{}", self.base, path))
            .header(SESSION_HEADER, token);

        if let Some(body) = body {
            request = request.json(body);
        }

        match read_json(request.send().await?).await {
            Err(CallFailure::Unauthorized(message)) => {
                self.session.invalidate().await;
                Err(CallFailure::Unauthorized(message))
            }
            other => other,
        }
    }

    async fn datastore_id(&self) -> Result<String> {
        self.datastore
            .get_or_refresh(|| async {
                let name: String =
                    url::form_urlencoded::byte_serialize(self.config.datastore_name.as_bytes()).collect();
                let path = format!("/api/vcenter/datastore?names={}", name);
                let data = self.call(Method::GET, &path, None).await?;

                data.as_array()
                    .and_then(|list| list.first())
                    .and_then(|ds| ds["datastore"].as_str())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        CallFailure::Decode(format!(
                            "Datastore '{}' not found",
                            self.config.datastore_name
                        ))
                    })
            })
            .await
            .map_err(|e| e.into_error(BACKEND, HypervisorError::Unavailable))
    }

    fn template_for(&self, os: &str) -> Result<&str> {
        self.config
            .templates
            .get(&os.to_ascii_lowercase())
            .map(String::as_str)
            .ok_or_else(|| HypervisorError::UnknownTemplate(os.to_string()))
    }

    async fn template_resources(&self, item: &str) -> Result<Resources> {
        let path = format!("/api/vcenter/vm-template/library-items/{}", item);
        let data = self.call(Method::GET, &path, None).await.map_err(|e| {
            e.into_error(BACKEND, |message| HypervisorError::TemplateFetch {
                template: item.to_string(),
                message,
            })
        })?;

        Ok(parse_template_hardware(&data, &self.config.disk_key))
    }

    fn deploy_body(&self, vm_name: &str, spec: &CreateSpec, datastore: &str, overrides: &ResourceOverrides) -> Value {
        let mut hardware = Map::new();
        if let Some(cores) = overrides.cpu_cores {
            hardware.insert("cpu_update".into(), json!({ "num_cpus": cores }));
        }
        if let Some(memory) = overrides.memory_mb {
            hardware.insert("memory_update".into(), json!({ "memory": memory }));
        }
        if let Some(disk) = overrides.disk_gb {
            let mut disks = Map::new();
            disks.insert(self.config.disk_key.clone(), json!({ "capacity": disk * GIB }));
            hardware.insert("disks_to_update".into(), Value::Object(disks));
        }

        json!({
            "name": vm_name,
            "description": format!("{} (owner: {})", spec.description, spec.owner_display_name),
            "placement": {
                "cluster": self.config.cluster_id,
                "folder": self.config.folder_id,
            },
            "disk_storage": { "datastore": datastore },
            "vm_home_storage": { "datastore": datastore },
            "powered_on": true,
            "hardware_customization": Value::Object(hardware),
        })
    }
}

#[async_trait]
impl Hypervisor for VcenterProvider {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn limits(&self) -> ResourceLimits {
        self.config.limits
    }

    async fn list_all(&self) -> Result<Vec<VmSnapshot>> {
        let data = self
            .call(Method::GET, "/api/vcenter/vm", None)
            .await
            .map_err(|e| e.into_error(BACKEND, HypervisorError::Unavailable))?;

        let list = data
            .as_array()
            .ok_or_else(|| HypervisorError::Protocol("Expected a VM list".to_string()))?;

        Ok(list
            .iter()
            .filter_map(|vm| {
                let vmid = vm["vm"].as_str()?.to_string();
                Some(VmSnapshot {
                    vmid,
                    name: vm["name"].as_str().unwrap_or_default().to_string(),
                    node: None,
                    power_state: PowerState::parse(vm["power_state"].as_str().unwrap_or("")),
                    cpu_usage: None,
                    cpu_count: as_u64(&vm["cpu_count"]).map(|c| c as u32),
                    memory_used_bytes: None,
                    memory_max_bytes: as_u64(&vm["memory_size_MiB"]).map(|m| m * 1024 * 1024),
                    uptime_secs: None,
                })
            })
            .collect())
    }

    async fn status(&self, vmid: &str) -> Result<VmSnapshot> {
        let data = self
            .call(Method::GET, &format!("/api/vcenter/vm/{}", vmid), None)
            .await
            .map_err(|e| {
                if e.is_absent() {
                    HypervisorError::NotFound(vmid.to_string())
                } else {
                    e.into_error(BACKEND, HypervisorError::Unavailable)
                }
            })?;

        Ok(VmSnapshot {
            vmid: vmid.to_string(),
            name: data["name"].as_str().unwrap_or_default().to_string(),
            node: None,
            power_state: PowerState::parse(data["power_state"].as_str().unwrap_or("")),
            cpu_usage: None,
            cpu_count: as_u64(&data["cpu"]["count"]).map(|c| c as u32),
            memory_used_bytes: None,
            memory_max_bytes: as_u64(&data["memory"]["size_MiB"]).map(|m| m * 1024 * 1024),
            uptime_secs: None,
        })
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, owner = %spec.owner))]
    async fn create(&self, spec: &CreateSpec) -> Result<ProvisionedVm> {
        let requested = self.config.limits.clamp(spec.resources);
        let item = self.template_for(&spec.os)?.to_string();
        let vm_name = self.vm_name(&spec.owner, &spec.name);

        let template = self.template_resources(&item).await?;
        let overrides = plan_overrides(template, requested);
        let datastore = self.datastore_id().await?;

        let path = format!(
            "/api/vcenter/vm-template/library-items/{}?action=deploy",
            item
        );
        let body = self.deploy_body(&vm_name, spec, &datastore, &overrides);

        let data = self
            .call(Method::POST, &path, Some(&body))
            .await
            .map_err(|e| match e {
                CallFailure::Status(_, ref text) if text.contains("ALREADY_EXISTS") => {
                    HypervisorError::AlreadyExists(vm_name.clone())
                }
                other => other.into_error(BACKEND, |message| HypervisorError::Clone {
                    vmid: vm_name.clone(),
                    message,
                }),
            })?;

        let vmid = data
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| HypervisorError::Protocol(format!("Deploy returned {}", data)))?;

        let resources = overrides.effective(template);
        info!(
            vmid = %vmid,
            vm_name = %vm_name,
            memory_mb = resources.memory_mb,
            cpu_cores = resources.cpu_cores,
            disk_gb = resources.disk_gb,
            stage = %CreationStage::Ready,
            "vCenter VM deployed"
        );

        Ok(ProvisionedVm { vmid, resources })
    }

    #[instrument(skip(self))]
    async fn destroy(&self, vmid: &str, owner: &str) -> Result<()> {
        let live = self.status(vmid).await?;

        if live.power_state != PowerState::Stopped {
            let path = format!("/api/vcenter/vm/{}/power?action=stop", vmid);
            match self.call(Method::POST, &path, None).await {
                Ok(_) => {}
                Err(CallFailure::Status(_, text)) if text.contains("ALREADY_IN_DESIRED_STATE") => {}
                Err(e) => {
                    return Err(e.into_error(BACKEND, |message| HypervisorError::PowerOff {
                        vmid: vmid.to_string(),
                        message,
                    }))
                }
            }
        }

        self.call(Method::DELETE, &format!("/api/vcenter/vm/{}", vmid), None)
            .await
            .map_err(|e| {
                if e.is_absent() {
                    HypervisorError::NotFound(vmid.to_string())
                } else {
                    e.into_error(BACKEND, |message| HypervisorError::Delete {
                        vmid: vmid.to_string(),
                        message,
                    })
                }
            })?;

        info!(vmid, "vCenter VM destroyed");
        Ok(())
    }
}

fn parse_template_hardware(data: &Value, disk_key: &str) -> Resources {
    Resources {
        memory_mb: as_u64(&data["memory"]["size_MiB"]).unwrap_or(0),
        cpu_cores: as_u64(&data["cpu"]["count"]).unwrap_or(1) as u32,
        disk_gb: as_u64(&data["disks"][disk_key]["capacity"])
            .map(|bytes| bytes / GIB)
            .unwrap_or(0),
    }
}
