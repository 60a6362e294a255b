//! Technitium DNS Server HTTP API (token in the query string).

use async_trait::async_trait;
use lab_core::{env, ConfigError};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::{DnsController, DnsError, DnsRecord, PublishedRecord, Result, Zone};

#[derive(Clone)]
pub struct TechnitiumConfig {
    pub host: String,
    pub token: String,
    pub verify_tls: bool,
    pub request_timeout: Duration,
}

impl TechnitiumConfig {
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            host: env::required("TECHNITIUM_HOST")?,
            token: env::required("TECHNITIUM_API_TOKEN")?,
            verify_tls: env::flag("VERIFY_TLS"),
            request_timeout: Duration::from_secs(env::parse_or("TECHNITIUM_REQUEST_TIMEOUT", 15)?),
        })
    }
}

pub struct TechnitiumController {
    config: TechnitiumConfig,
    base: String,
    client: Client,
}

impl TechnitiumController {
    pub fn new(config: TechnitiumConfig) -> Result<Self> {
        let base = url::Url::parse(&config.host)
            .map_err(|e| {
                DnsError::Config(ConfigError::Invalid {
                    name: "TECHNITIUM_HOST".to_string(),
                    value: format!("{} ({})", config.host, e),
                })
            })?
            .as_str()
            .trim_end_matches('/')
            .to_string();

        let client = crate::build_client(config.verify_tls, config.request_timeout)
            .map_err(|e| DnsError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            base,
            client,
        })
    }

    /// Call `/api/{path}` and return the `response` member on `status: ok`.
    async fn call(&self, path: &str, params: &[(&str, String)]) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}/api/{}", self.base, path))
            .query(&[("token", self.config.token.as_str())])
            .query(params)
            .send()
            .await
            .map_err(|e| DnsError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DnsError::Unavailable(format!("HTTP {} from {}", status, path)));
        }

        let mut body: Value = response
            .json()
            .await
            .map_err(|e| DnsError::Unavailable(format!("Invalid JSON from {}: {}", path, e)))?;

        match body["status"].as_str() {
            Some("ok") => Ok(body.get_mut("response").map(Value::take).unwrap_or(Value::Null)),
            Some("invalid-token") => Err(DnsError::Auth(
                body["errorMessage"].as_str().unwrap_or("invalid token").to_string(),
            )),
            _ => Err(DnsError::Rejected(
                body["errorMessage"]
                    .as_str()
                    .unwrap_or("unknown controller error")
                    .to_string(),
            )),
        }
    }

    fn record_params(record: &DnsRecord) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("zone", record.zone.clone()),
            ("domain", record.domain.clone()),
            ("type", record.value.record_type().to_string()),
        ];
        params.extend(record.value.params());
        params
    }
}

#[async_trait]
impl DnsController for TechnitiumController {
    async fn list_zones(&self) -> Result<Vec<Zone>> {
        let response = self.call("zones/list", &[]).await?;

        Ok(response["zones"]
            .as_array()
            .map(|zones| {
                zones
                    .iter()
                    .filter(|z| !z["internal"].as_bool().unwrap_or(false))
                    .filter_map(|z| {
                        Some(Zone {
                            name: z["name"].as_str()?.to_string(),
                            kind: z["type"].as_str().unwrap_or("Primary").to_string(),
                            disabled: z["disabled"].as_bool().unwrap_or(false),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_records(&self, zone: &str, domain: &str) -> Result<Vec<PublishedRecord>> {
        let params = [("zone", zone.to_string()), ("domain", domain.to_string())];
        let response = self.call("zones/records/get", &params).await?;

        Ok(response["records"]
            .as_array()
            .map(|records| {
                records
                    .iter()
                    .map(|r| PublishedRecord {
                        name: r["name"].as_str().unwrap_or_default().to_string(),
                        record_type: r["type"].as_str().unwrap_or_default().to_string(),
                        ttl: r["ttl"].as_u64().unwrap_or(0) as u32,
                        data: r["rData"].to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    #[instrument(skip(self, record), fields(domain = %record.domain, kind = %record.value.record_type()))]
    async fn add_record(&self, record: &DnsRecord) -> Result<()> {
        let mut params = Self::record_params(record);
        params.push(("ttl", record.ttl.to_string()));
        params.push(("overwrite", "false".to_string()));

        self.call("zones/records/add", &params).await?;
        info!(zone = %record.zone, value = %record.value, "DNS record published");
        Ok(())
    }

    #[instrument(skip(self, record), fields(domain = %record.domain, kind = %record.value.record_type()))]
    async fn delete_record(&self, record: &DnsRecord) -> Result<()> {
        match self.call("zones/records/delete", &Self::record_params(record)).await {
            Ok(_) => {
                info!(zone = %record.zone, "DNS record deleted");
                Ok(())
            }
            Err(DnsError::Rejected(message)) if is_absent(&message) => {
                debug!(zone = %record.zone, "DNS record already absent: {}", message);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn is_absent(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("not found") || message.contains("no such") || message.contains("does not exist")
}
