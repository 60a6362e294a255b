use async_trait::async_trait;
use lab_core::TimedCache;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::COOKIE;
use reqwest::{Client, Method};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::ProxmoxConfig;
use crate::error::{HypervisorError, Result};
use crate::http::{as_u64, base_url, build_client, read_json, CallFailure};
use crate::resources::{plan_overrides, ResourceOverrides, Resources};
use crate::{
    CreateSpec, CreationStage, Hypervisor, PowerState, ProvisionedVm, ResourceLimits, VmSnapshot,
};

const BACKEND: &str = "proxmox";
const TICKET_TTL: Duration = Duration::from_secs(90 * 60);
const DISK: &str = "scsi0";

static DISK_SIZE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"size=(\d+)([KMGT]?)")
        .expect("Disk size regex should compile - this is a static pattern")
});

type CallResult<T> = std::result::Result<T, CallFailure>;

#[derive(Clone)]
struct Ticket {
    cookie: String,
    csrf: String,
}

pub struct ProxmoxProvider {
    config: ProxmoxConfig,
    base: String,
    client: Client,
    ticket: TimedCache<Ticket>,
}

impl ProxmoxProvider {
    pub fn new(config: ProxmoxConfig) -> Result<Self> {
        let base = base_url(&config.server_url)?;
        let client = build_client(config.verify_tls, config.request_timeout)?;

        Ok(Self {
            config,
            base,
            client,
            ticket: TimedCache::new(TICKET_TTL),
        })
    }

    async fn login(&self) -> CallResult<Ticket> {
        debug!(user = %self.config.username, "Requesting Proxmox ticket");

        let response = self
            .client
            .post(format!("{}/api2/json/access/ticket", self.base))
            .form(&[
                ("username", self.config.username.as_str()),
                ("password", self.config.password.as_str()),
            ])
            .send()
            .await?;

        let body = read_json(response).await?;
        let data = &body["data"];

        match (data["ticket"].as_str(), data["CSRFPreventionToken"].as_str()) {
            (Some(ticket), Some(csrf)) => Ok(Ticket {
                cookie: ticket.to_string(),
                csrf: csrf.to_string(),
            }),
            _ => Err(CallFailure::Unauthorized(
                "Login response carried no ticket".to_string(),
            )),
        }
    }

    /// Authenticated call returning the `data` member of the envelope.
    async fn call(&self, method: Method, path: &str, form: &[(&str, String)]) -> CallResult<Value> {
        let ticket = self.ticket.get_or_refresh(|| self.login()).await?;

        let mut request = self
            .client
            .request(method.clone(), format!("{}/api2/json{}", self.base, path))
            .header(COOKIE, format!("PVEAuthCookie={}", ticket.cookie));

        if method != Method::GET {
            request = request.header("CSRFPreventionToken", ticket.csrf);
        }
        if !form.is_empty() {
            request = request.form(form);
        }

        match read_json(request.send().await?).await {
            Ok(mut body) => Ok(body.get_mut("data").map(Value::take).unwrap_or(Value::Null)),
            Err(CallFailure::Unauthorized(message)) => {
                self.ticket.invalidate().await;
                Err(CallFailure::Unauthorized(message))
            }
            Err(e) => Err(e),
        }
    }

    /// Poll a task by UPID until it stops.
    async fn wait_for_task(&self, upid: &str) -> CallResult<()> {
        let path = format!("/nodes/{}/tasks/{}/status", self.config.node, upid);

        let poll = async {
            loop {
                let data = self.call(Method::GET, &path, &[]).await?;
                if data["status"].as_str() == Some("stopped") {
                    return match data["exitstatus"].as_str() {
                        Some("OK") => Ok(()),
                        other => Err(CallFailure::Failed(format!(
                            "Task {} ended with {}",
                            upid,
                            other.unwrap_or("no exit status")
                        ))),
                    };
                }
                tokio::time::sleep(self.config.task_poll_interval).await;
            }
        };

        tokio::time::timeout(self.config.task_timeout, poll)
            .await
            .map_err(|_| CallFailure::Transport(format!("Timed out waiting for task {}", upid)))?
    }

    /// Run a call that answers with a task id and wait for that task.
    async fn run_task(&self, method: Method, path: &str, form: &[(&str, String)]) -> CallResult<()> {
        let data = self.call(method, path, form).await?;
        match data.as_str() {
            Some(upid) => self.wait_for_task(upid).await,
            None => Ok(()),
        }
    }

    fn vm_path(&self, vmid: &str, suffix: &str) -> String {
        format!("/nodes/{}/qemu/{}{}", self.config.node, vmid, suffix)
    }

    async fn next_vmid(&self) -> Result<String> {
        let data = self
            .call(Method::GET, "/cluster/nextid", &[])
            .await
            .map_err(|e| e.into_error(BACKEND, HypervisorError::IdAllocation))?;

        as_u64(&data)
            .map(|id| id.to_string())
            .ok_or_else(|| HypervisorError::IdAllocation(format!("Unexpected id payload: {}", data)))
    }

    async fn template_resources(&self) -> Result<Resources> {
        let template = self.config.template_vmid.to_string();
        let data = self
            .call(Method::GET, &self.vm_path(&template, "/config"), &[])
            .await
            .map_err(|e| {
                e.into_error(BACKEND, |message| HypervisorError::TemplateFetch {
                    template: template.clone(),
                    message,
                })
            })?;

        Ok(parse_template_config(&data))
    }

    async fn clone_template(&self, vmid: &str, spec: &CreateSpec) -> Result<()> {
        let template = self.config.template_vmid.to_string();
        let form = [
            ("newid", vmid.to_string()),
            ("name", spec.name.clone()),
            ("full", "1".to_string()),
        ];

        self.run_task(Method::POST, &self.vm_path(&template, "/clone"), &form)
            .await
            .map_err(|e| {
                e.into_error(BACKEND, |message| HypervisorError::Clone {
                    vmid: vmid.to_string(),
                    message,
                })
            })
    }

    async fn configure(&self, vmid: &str, spec: &CreateSpec, overrides: &ResourceOverrides) -> Result<()> {
        let form = hardware_profile(&self.config, spec, overrides);

        self.call(Method::PUT, &self.vm_path(vmid, "/config"), &form)
            .await
            .map(|_| ())
            .map_err(|e| {
                e.into_error(BACKEND, |message| HypervisorError::Configure {
                    vmid: vmid.to_string(),
                    message,
                })
            })
    }

    async fn resize_disk(&self, vmid: &str, grow_gb: u64) -> Result<()> {
        let form = [("disk", DISK.to_string()), ("size", format!("+{}G", grow_gb))];

        self.run_task(Method::PUT, &self.vm_path(vmid, "/resize"), &form)
            .await
            .map_err(|e| {
                e.into_error(BACKEND, |message| HypervisorError::Resize {
                    vmid: vmid.to_string(),
                    message,
                })
            })
    }

    async fn list_node(&self, node: &str) -> CallResult<Vec<VmSnapshot>> {
        let data = self.call(Method::GET, &format!("/nodes/{}/qemu", node), &[]).await?;
        let entries = data
            .as_array()
            .ok_or_else(|| CallFailure::Decode(format!("Expected VM list for node {}", node)))?;

        Ok(entries
            .iter()
            .filter(|vm| as_u64(&vm["template"]) != Some(1))
            .filter_map(|vm| {
                let vmid = as_u64(&vm["vmid"])?.to_string();
                Some(snapshot_from(vmid, Some(node), vm))
            })
            .collect())
    }
}

#[async_trait]
impl Hypervisor for ProxmoxProvider {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn limits(&self) -> ResourceLimits {
        self.config.limits
    }

    async fn list_all(&self) -> Result<Vec<VmSnapshot>> {
        let nodes = self
            .call(Method::GET, "/nodes", &[])
            .await
            .map_err(|e| e.into_error(BACKEND, HypervisorError::Unavailable))?;

        let names: Vec<String> = nodes
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|n| n["node"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let mut snapshots = Vec::new();
        let mut answered = 0usize;

        for node in &names {
            match self.list_node(node).await {
                Ok(mut vms) => {
                    answered += 1;
                    snapshots.append(&mut vms);
                }
                Err(e) => warn!(node = %node, "Failed to list VMs on node: {}", e.message()),
            }
        }

        if answered == 0 && !names.is_empty() {
            return Err(HypervisorError::Unavailable(format!(
                "None of {} nodes answered",
                names.len()
            )));
        }

        Ok(snapshots)
    }

    async fn status(&self, vmid: &str) -> Result<VmSnapshot> {
        let data = self
            .call(Method::GET, &self.vm_path(vmid, "/status/current"), &[])
            .await
            .map_err(|e| {
                if e.is_absent() {
                    HypervisorError::NotFound(vmid.to_string())
                } else {
                    e.into_error(BACKEND, HypervisorError::Unavailable)
                }
            })?;

        Ok(snapshot_from(vmid.to_string(), Some(self.config.node.as_str()), &data))
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, owner = %spec.owner))]
    async fn create(&self, spec: &CreateSpec) -> Result<ProvisionedVm> {
        let requested = self.config.limits.clamp(spec.resources);

        let vmid = self.next_vmid().await?;
        debug!(vmid = %vmid, stage = %CreationStage::IdAllocated);

        let template = self.template_resources().await?;
        let overrides = plan_overrides(template, requested);

        self.clone_template(&vmid, spec).await?;
        debug!(vmid = %vmid, stage = %CreationStage::Cloned);

        self.configure(&vmid, spec, &overrides).await?;
        debug!(vmid = %vmid, stage = %CreationStage::ResourceConfigured);

        if let Some(grow) = overrides.disk_grow_gb {
            self.resize_disk(&vmid, grow).await?;
            debug!(vmid = %vmid, grow_gb = grow, stage = %CreationStage::DiskResized);
        }

        let resources = overrides.effective(template);
        info!(
            vmid = %vmid,
            memory_mb = resources.memory_mb,
            cpu_cores = resources.cpu_cores,
            disk_gb = resources.disk_gb,
            stage = %CreationStage::Ready,
            "Proxmox VM created"
        );

        Ok(ProvisionedVm { vmid, resources })
    }

    async fn bind_address(&self, vmid: &str, address: &str) -> Result<()> {
        let Some(network) = &self.config.network else {
            return Ok(());
        };

        let form = [(
            "ipconfig0",
            format!("ip={}/{},gw={}", address, network.prefix_len, network.gateway),
        )];

        self.call(Method::PUT, &self.vm_path(vmid, "/config"), &form)
            .await
            .map(|_| ())
            .map_err(|e| {
                e.into_error(BACKEND, |message| HypervisorError::Configure {
                    vmid: vmid.to_string(),
                    message,
                })
            })
    }

    #[instrument(skip(self))]
    async fn destroy(&self, vmid: &str, owner: &str) -> Result<()> {
        let live = self.status(vmid).await?;

        if live.power_state != PowerState::Stopped {
            self.run_task(Method::POST, &self.vm_path(vmid, "/status/stop"), &[])
                .await
                .map_err(|e| {
                    e.into_error(BACKEND, |message| HypervisorError::PowerOff {
                        vmid: vmid.to_string(),
                        message,
                    })
                })?;
        }

        self.run_task(
            Method::DELETE,
            &self.vm_path(vmid, "?purge=1&destroy-unreferenced-disks=1"),
            &[],
        )
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

        info!(vmid, "Proxmox VM destroyed");
        Ok(())
    }
}

/// Fixed hardware profile plus the growing overrides.
fn hardware_profile(
    config: &ProxmoxConfig,
    spec: &CreateSpec,
    overrides: &ResourceOverrides,
) -> Vec<(&'static str, String)> {
    let mut form = vec![
        ("sockets", "1".to_string()),
        ("numa", "0".to_string()),
        ("cpu", "x86-64-v2-AES".to_string()),
        ("scsihw", "virtio-scsi-single".to_string()),
        ("net0", format!("virtio,bridge={},firewall=1", config.bridge)),
        (
            "description",
            format!("{} (owner: {})", spec.description, spec.owner_display_name),
        ),
    ];

    if let Some(user) = &config.ci_user {
        form.push(("ciuser", user.clone()));
    }
    if let Some(password) = &config.ci_password {
        form.push(("cipassword", password.clone()));
    }
    if let Some(memory) = overrides.memory_mb {
        form.push(("memory", memory.to_string()));
    }
    if let Some(cores) = overrides.cpu_cores {
        form.push(("cores", cores.to_string()));
    }

    form
}

/// Read cores, memory and boot disk size from a template config.
fn parse_template_config(data: &Value) -> Resources {
    let disk_gb = data[DISK]
        .as_str()
        .and_then(|disk| DISK_SIZE_REGEX.captures(disk))
        .and_then(|caps| {
            let size: u64 = caps[1].parse().ok()?;
            Some(match &caps[2] {
                "T" => size * 1024,
                "M" => size / 1024,
                "K" => 0,
                _ => size,
            })
        })
        .unwrap_or(0);

    Resources {
        memory_mb: as_u64(&data["memory"]).unwrap_or(0),
        cpu_cores: as_u64(&data["cores"]).unwrap_or(1) as u32,
        disk_gb,
    }
}

fn snapshot_from(vmid: String, node: Option<&str>, data: &Value) -> VmSnapshot {
    VmSnapshot {
        name: data["name"].as_str().unwrap_or_default().to_string(),
        vmid,
        node: node.map(str::to_string),
        power_state: PowerState::parse(data["status"].as_str().unwrap_or("unknown")),
        cpu_usage: data["cpu"].as_f64(),
        cpu_count: as_u64(&data["cpus"]).or_else(|| as_u64(&data["maxcpu"])).map(|c| c as u32),
        memory_used_bytes: as_u64(&data["mem"]),
        memory_max_bytes: as_u64(&data["maxmem"]),
        uptime_secs: as_u64(&data["uptime"]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_template_config_mixed_types() {
        let data = json!({
            "cores": "2",
            "memory": 1024,
            "scsi0": "local-lvm:base-9000-disk-0,iothread=1,size=20G",
        });
        assert_eq!(parse_template_config(&data), Resources::new(1024, 2, 20));
    }

    #[test]
    fn test_parse_template_config_units() {
        let tera = json!({ "cores": 1, "memory": "512", "scsi0": "ceph:vm-1,size=1T" });
        assert_eq!(parse_template_config(&tera).disk_gb, 1024);

        let missing = json!({ "cores": 1, "memory": "512" });
        assert_eq!(parse_template_config(&missing).disk_gb, 0);
    }

    #[test]
    fn test_hardware_profile_only_sends_overrides() {
        let config = ProxmoxConfig {
            server_url: "https://pve.lab:8006".into(),
            node: "pve".into(),
            username: "root@pam".into(),
            password: "secret".into(),
            template_vmid: 9000,
            limits: ResourceLimits::default(),
            verify_tls: false,
            request_timeout: Duration::from_secs(5),
            task_timeout: Duration::from_secs(5),
            task_poll_interval: Duration::from_millis(10),
            bridge: "vmbr1".into(),
            ci_user: Some("student".into()),
            ci_password: None,
            network: None,
        };
        let spec = CreateSpec {
            name: "web1".into(),
            resources: Resources::new(4096, 1, 10),
            owner: "u1".into(),
            owner_display_name: "User One".into(),
            description: "coursework".into(),
            os: "Ubuntu".into(),
            subdomain: None,
        };

        let overrides = plan_overrides(Resources::new(1024, 2, 20), spec.resources);
        let form = hardware_profile(&config, &spec, &overrides);
        let keys: Vec<&str> = form.iter().map(|(k, _)| *k).collect();

        assert!(keys.contains(&"memory"));
        assert!(!keys.contains(&"cores"));
        assert!(keys.contains(&"ciuser"));
        assert!(!keys.contains(&"cipassword"));
        assert!(form.contains(&("net0", "virtio,bridge=vmbr1,firewall=1".to_string())));
    }

    #[test]
    fn test_snapshot_from_status() {
        let data = json!({
            "name": "web1", "status": "running", "cpu": 0.25, "cpus": 2,
            "mem": 536870912u64, "maxmem": 1073741824u64, "uptime": 3600
        });
        let snapshot = snapshot_from("105".into(), Some("pve"), &data);
        assert_eq!(snapshot.power_state, PowerState::Running);
        assert_eq!(snapshot.cpu_count, Some(2));
        assert_eq!(snapshot.uptime_secs, Some(3600));
    }
}
