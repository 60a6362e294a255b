//! Sophos XG/XGS controller over its XML API.
//!
//! Every request carries its own login block; success is the
//! `<Status code="200">` element inside the body, not the HTTP status.

use async_trait::async_trait;
use lab_core::{env, ConfigError};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::{
    trusted_host_name, AccessGrant, AccessRequest, BindingNames, CloseReport, Firewall,
    FirewallError, RemovalOutcome, Result,
};

static STATUS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<Status code="(\d+)">([^<]*)</Status>"#)
        .expect("Status regex should compile - this is a static pattern")
});

const SUCCESS_CODES: [u16; 2] = [200, 216];

/// Networks and services the rules are built from, loaded from `IP_LIST`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallPolicy {
    pub source_networks: Vec<String>,
    pub services: Vec<String>,
    pub outbound_services: Vec<String>,
    #[serde(default = "default_wan_zone")]
    pub wan_zone: String,
    #[serde(default = "default_lan_zone")]
    pub lan_zone: String,
}

fn default_wan_zone() -> String {
    "WAN".to_string()
}

fn default_lan_zone() -> String {
    "DMZ".to_string()
}

impl FirewallPolicy {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FirewallError::Policy(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| FirewallError::Policy(format!("{}: {}", path.display(), e)))
    }
}

#[derive(Clone)]
pub struct SophosConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub policy: FirewallPolicy,
    pub rule_group: String,
    pub trusted_group: String,
    pub verify_tls: bool,
    pub request_timeout: Duration,
}

impl SophosConfig {
    pub fn from_env() -> Result<Self> {
        let policy_path = env::required("IP_LIST")?;

        Ok(Self {
            url: env::required("SOPHOS_FIREWALL_URL")?,
            username: env::required("SOPHOS_FIREWALL_USER")?,
            password: env::required("SOPHOS_FIREWALL_PASS")?,
            policy: FirewallPolicy::load(Path::new(&policy_path))?,
            rule_group: env::or_default("SOPHOS_RULE_GROUP", "Autonet"),
            trusted_group: env::or_default("SOPHOS_TRUSTED_GROUP", "Students Private IP's"),
            verify_tls: env::flag("VERIFY_TLS"),
            request_timeout: Duration::from_secs(env::parse_or("SOPHOS_REQUEST_TIMEOUT", 30)?),
        })
    }
}

pub struct SophosFirewall {
    config: SophosConfig,
    endpoint: String,
    client: Client,
}

impl SophosFirewall {
    pub fn new(config: SophosConfig) -> Result<Self> {
        let endpoint = url::Url::parse(&config.url)
            .and_then(|base| base.join("/webconsole/APIController"))
            .map_err(|e| {
                FirewallError::Config(ConfigError::Invalid {
                    name: "SOPHOS_FIREWALL_URL".to_string(),
                    value: format!("{} ({})", config.url, e),
                })
            })?
            .to_string();

        let client = crate::build_client(config.verify_tls, config.request_timeout)
            .map_err(|e| FirewallError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            endpoint,
            client,
        })
    }

    /// Send one operation block and return the controller's status message.
    async fn send(&self, object: &str, operation: &str) -> Result<String> {
        let request = format!(
            "<Request><Login><Username>{}</Username><Password>{}</Password></Login>{}</Request>",
            escape(&self.config.username),
            escape(&self.config.password),
            operation
        );

        let response = self
            .client
            .post(&self.endpoint)
            .form(&[("reqxml", request)])
            .send()
            .await
            .map_err(|e| FirewallError::Unavailable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FirewallError::Unavailable(e.to_string()))?;

        if !status.is_success() {
            return Err(FirewallError::Unavailable(format!("HTTP {}", status)));
        }

        debug!(object, "Firewall answered: {}", body.trim());
        interpret(object, &body)
    }

    async fn add(&self, object: &str, xml: String) -> Result<()> {
        self.send(object, &format!(r#"<Set operation="add">{}</Set>"#, xml))
            .await
            .map(|_| ())
    }

    async fn remove(&self, kind: &str, name: &str) -> RemovalOutcome {
        let xml = format!("<Remove><{kind}><Name>{}</Name></{kind}></Remove>", escape(name));

        match self.send(name, &xml).await {
            Ok(_) => RemovalOutcome::Removed,
            Err(FirewallError::Rejected { message, .. }) if is_absent(&message) => {
                RemovalOutcome::Absent
            }
            Err(e) => RemovalOutcome::Failed(e.to_string()),
        }
    }

    fn host_xml(&self, name: &str, address: IpAddr, group: Option<&str>) -> String {
        let family = if address.is_ipv4() { "IPv4" } else { "IPv6" };
        let groups = group
            .map(|g| format!("<HostGroupList><HostGroup>{}</HostGroup></HostGroupList>", escape(g)))
            .unwrap_or_default();

        format!(
            "<IPHost><Name>{}</Name><IPFamily>{}</IPFamily><HostType>IP</HostType><IPAddress>{}</IPAddress>{}</IPHost>",
            escape(name),
            family,
            address,
            groups
        )
    }

    fn rule_xml(&self, name: &str, host: &str, inbound: bool) -> String {
        let policy = &self.config.policy;
        let (from_zone, to_zone) = if inbound {
            (&policy.wan_zone, &policy.lan_zone)
        } else {
            (&policy.lan_zone, &policy.wan_zone)
        };
        let host_list = format!("<Network>{}</Network>", escape(host));
        let (sources, destinations, services) = if inbound {
            (list("Network", &policy.source_networks), host_list, list("Service", &policy.services))
        } else {
            (host_list, String::new(), list("Service", &policy.outbound_services))
        };

        format!(
            concat!(
                "<FirewallRule transactionid=\"\">",
                "<Name>{name}</Name>",
                "<Description>Managed by lab provisioning</Description>",
                "<IPFamily>IPv4</IPFamily>",
                "<Status>Enable</Status>",
                "<Position>Bottom</Position>",
                "<PolicyType>Network</PolicyType>",
                "<NetworkPolicy>",
                "<Action>Accept</Action>",
                "<LogTraffic>Enable</LogTraffic>",
                "<SourceZones><Zone>{from}</Zone></SourceZones>",
                "<DestinationZones><Zone>{to}</Zone></DestinationZones>",
                "<Schedule>All The Time</Schedule>",
                "<SourceNetworks>{sources}</SourceNetworks>",
                "<Services>{services}</Services>",
                "<DestinationNetworks>{destinations}</DestinationNetworks>",
                "</NetworkPolicy>",
                "</FirewallRule>"
            ),
            name = escape(name),
            from = escape(from_zone),
            to = escape(to_zone),
            sources = sources,
            services = services,
            destinations = destinations,
        )
    }

    fn group_xml(&self, names: &BindingNames) -> String {
        format!(
            concat!(
                "<FirewallRuleGroup><Name>{}</Name><SecurityPolicyList>",
                "<SecurityPolicy>{}</SecurityPolicy><SecurityPolicy>{}</SecurityPolicy>",
                "</SecurityPolicyList></FirewallRuleGroup>"
            ),
            escape(&self.config.rule_group),
            escape(&names.inbound),
            escape(&names.outbound)
        )
    }

    async fn register_trusted(&self, owner: &str, home_ips: &[IpAddr]) -> Vec<(IpAddr, String)> {
        let mut failures = Vec::new();

        for (index, address) in home_ips.iter().enumerate() {
            let name = trusted_host_name(owner, index + 1);
            let xml = self.host_xml(&name, *address, Some(&self.config.trusted_group));

            if let Err(e) = self.add(&name, xml).await {
                warn!(owner, address = %address, "Failed to register trusted address: {}", e);
                failures.push((*address, e.to_string()));
            }
        }

        failures
    }
}

#[async_trait]
impl Firewall for SophosFirewall {
    #[instrument(skip(self, request), fields(owner = %request.owner, vm = %request.vm_name))]
    async fn open_access(&self, request: &AccessRequest) -> Result<AccessGrant> {
        let names = BindingNames::new(&request.owner, &request.vm_name);

        self.add(&names.host, self.host_xml(&names.host, request.address, None))
            .await?;

        let (inbound, outbound) = tokio::join!(
            self.add(&names.inbound, self.rule_xml(&names.inbound, &names.host, true)),
            self.add(&names.outbound, self.rule_xml(&names.outbound, &names.host, false)),
        );
        inbound?;
        outbound?;

        self.send(
            &self.config.rule_group,
            &format!(r#"<Set operation="update">{}</Set>"#, self.group_xml(&names)),
        )
        .await?;

        let trusted_failures = self.register_trusted(&request.owner, &request.home_ips).await;

        info!(address = %request.address, host = %names.host, "Firewall access opened");
        Ok(AccessGrant {
            names,
            trusted_failures,
        })
    }

    #[instrument(skip(self))]
    async fn close_access(&self, owner: &str, vm_name: &str) -> Result<CloseReport> {
        let names = BindingNames::new(owner, vm_name);

        let (inbound, outbound) = tokio::join!(
            self.remove("FirewallRule", &names.inbound),
            self.remove("FirewallRule", &names.outbound),
        );
        let host = self.remove("IPHost", &names.host).await;

        let report = CloseReport {
            names,
            inbound,
            outbound,
            host,
        }
        .into_result()?;

        info!(host = %report.names.host, "Firewall access closed");
        Ok(report)
    }
}

/// Scan every `<Status>` element; all must carry a success code.
fn interpret(object: &str, body: &str) -> Result<String> {
    let statuses: Vec<(u16, String)> = STATUS_REGEX
        .captures_iter(body)
        .filter_map(|caps| Some((caps[1].parse().ok()?, caps[2].trim().to_string())))
        .collect();

    if statuses.is_empty() {
        if body.contains("Authentication Failure") {
            return Err(FirewallError::Auth("Controller rejected the credentials".to_string()));
        }
        return Err(FirewallError::Rejected {
            object: object.to_string(),
            code: 0,
            message: "Response carried no status".to_string(),
        });
    }

    let failure = statuses
        .iter()
        .find(|(code, _)| !SUCCESS_CODES.contains(code))
        .cloned();

    match failure {
        None => Ok(statuses
            .into_iter()
            .map(|(_, message)| message)
            .collect::<Vec<_>>()
            .join("; ")),
        Some((_, message)) if message.to_ascii_lowercase().contains("already exists") => {
            Err(FirewallError::AlreadyExists(object.to_string()))
        }
        Some((code, message)) => Err(FirewallError::Rejected {
            object: object.to_string(),
            code,
            message,
        }),
    }
}

fn is_absent(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("not found")
        || message.contains("not exist")
        || message.contains("no such")
}

fn list(tag: &str, items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("<{tag}>{}</{tag}>", escape(item)))
        .collect()
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
