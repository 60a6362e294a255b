//! DNS records and the controller that publishes them.

mod technitium;

pub use technitium::{TechnitiumConfig, TechnitiumController};

use async_trait::async_trait;
use lab_core::{ConfigError, ErrorClass};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("Unsupported record type: {0}")]
    UnsupportedType(String),

    #[error("Invalid {record_type} record value: {message}")]
    InvalidValue {
        record_type: RecordType,
        message: String,
    },

    #[error("DNS controller authentication failed: {0}")]
    Auth(String),

    #[error("DNS controller unreachable: {0}")]
    Unavailable(String),

    #[error("DNS controller rejected the request: {0}")]
    Rejected(String),

    #[error("DNS configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, DnsError>;

impl DnsError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DnsError::UnsupportedType(_) | DnsError::InvalidValue { .. } => ErrorClass::Validation,
            DnsError::Auth(_) => ErrorClass::Auth,
            DnsError::Unavailable(_) | DnsError::Rejected(_) => ErrorClass::ExternalUnavailable,
            DnsError::Config(_) => ErrorClass::Internal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    A,
    Aaaa,
    Cname,
    Mx,
    Txt,
    Srv,
    Caa,
    Ptr,
    Dname,
    Aname,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
            RecordType::Cname => "CNAME",
            RecordType::Mx => "MX",
            RecordType::Txt => "TXT",
            RecordType::Srv => "SRV",
            RecordType::Caa => "CAA",
            RecordType::Ptr => "PTR",
            RecordType::Dname => "DNAME",
            RecordType::Aname => "ANAME",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = DnsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::Aaaa),
            "CNAME" => Ok(RecordType::Cname),
            "MX" => Ok(RecordType::Mx),
            "TXT" => Ok(RecordType::Txt),
            "SRV" => Ok(RecordType::Srv),
            "CAA" => Ok(RecordType::Caa),
            "PTR" => Ok(RecordType::Ptr),
            "DNAME" => Ok(RecordType::Dname),
            "ANAME" => Ok(RecordType::Aname),
            _ => Err(DnsError::UnsupportedType(s.to_string())),
        }
    }
}

/// A record value checked against the shape its type requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordValue {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Mx { preference: u16, exchange: String },
    Txt(String),
    Srv { priority: u16, weight: u16, port: u16, target: String },
    Caa { flags: u8, tag: String, value: String },
    Ptr(String),
    Dname(String),
    Aname(String),
}

impl RecordValue {
    /// Parse the textual value as stored in the ledger
    /// (`"10 mail.example"`, `"0 5 443 svc.example"`, ...).
    pub fn parse(record_type: RecordType, raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let invalid = |message: String| DnsError::InvalidValue {
            record_type,
            message,
        };

        if raw.is_empty() {
            return Err(invalid("value is empty".to_string()));
        }

        let tokens: Vec<&str> = raw.split_whitespace().collect();
        let expect = |count: usize, shape: &str| {
            if tokens.len() == count {
                Ok(())
            } else {
                Err(invalid(format!(
                    "expected {} space-separated values ({}), got {}",
                    count,
                    shape,
                    tokens.len()
                )))
            }
        };
        let number = |token: &str, field: &str| {
            token
                .parse::<u16>()
                .map_err(|_| invalid(format!("{} must be a number, got '{}'", field, token)))
        };

        match record_type {
            RecordType::A => raw
                .parse()
                .map(RecordValue::A)
                .map_err(|_| invalid(format!("'{}' is not an IPv4 address", raw))),
            RecordType::Aaaa => raw
                .parse()
                .map(RecordValue::Aaaa)
                .map_err(|_| invalid(format!("'{}' is not an IPv6 address", raw))),
            RecordType::Mx => {
                expect(2, "preference exchange")?;
                Ok(RecordValue::Mx {
                    preference: number(tokens[0], "preference")?,
                    exchange: tokens[1].to_string(),
                })
            }
            RecordType::Srv => {
                expect(4, "priority weight port target")?;
                Ok(RecordValue::Srv {
                    priority: number(tokens[0], "priority")?,
                    weight: number(tokens[1], "weight")?,
                    port: number(tokens[2], "port")?,
                    target: tokens[3].to_string(),
                })
            }
            RecordType::Caa => {
                expect(3, "flags tag value")?;
                let flags = number(tokens[0], "flags")?;
                Ok(RecordValue::Caa {
                    flags: u8::try_from(flags)
                        .map_err(|_| invalid(format!("flags must be 0-255, got {}", flags)))?,
                    tag: tokens[1].to_string(),
                    value: tokens[2].trim_matches('"').to_string(),
                })
            }
            RecordType::Cname => Ok(RecordValue::Cname(raw.to_string())),
            RecordType::Txt => Ok(RecordValue::Txt(raw.to_string())),
            RecordType::Ptr => Ok(RecordValue::Ptr(raw.to_string())),
            RecordType::Dname => Ok(RecordValue::Dname(raw.to_string())),
            RecordType::Aname => Ok(RecordValue::Aname(raw.to_string())),
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            RecordValue::A(_) => RecordType::A,
            RecordValue::Aaaa(_) => RecordType::Aaaa,
            RecordValue::Cname(_) => RecordType::Cname,
            RecordValue::Mx { .. } => RecordType::Mx,
            RecordValue::Txt(_) => RecordType::Txt,
            RecordValue::Srv { .. } => RecordType::Srv,
            RecordValue::Caa { .. } => RecordType::Caa,
            RecordValue::Ptr(_) => RecordType::Ptr,
            RecordValue::Dname(_) => RecordType::Dname,
            RecordValue::Aname(_) => RecordType::Aname,
        }
    }

    /// Controller query parameters carrying the value.
    pub fn params(&self) -> Vec<(&'static str, String)> {
        match self {
            RecordValue::A(ip) => vec![("ipAddress", ip.to_string())],
            RecordValue::Aaaa(ip) => vec![("ipAddress", ip.to_string())],
            RecordValue::Cname(name) => vec![("cname", name.clone())],
            RecordValue::Mx {
                preference,
                exchange,
            } => vec![
                ("preference", preference.to_string()),
                ("exchange", exchange.clone()),
            ],
            RecordValue::Txt(text) => vec![("text", text.clone())],
            RecordValue::Srv {
                priority,
                weight,
                port,
                target,
            } => vec![
                ("priority", priority.to_string()),
                ("weight", weight.to_string()),
                ("port", port.to_string()),
                ("target", target.clone()),
            ],
            RecordValue::Caa { flags, tag, value } => vec![
                ("flags", flags.to_string()),
                ("tag", tag.clone()),
                ("value", value.clone()),
            ],
            RecordValue::Ptr(name) => vec![("ptrName", name.clone())],
            RecordValue::Dname(name) => vec![("dname", name.clone())],
            RecordValue::Aname(name) => vec![("aname", name.clone())],
        }
    }
}

/// Canonical text form, the inverse of [`RecordValue::parse`].
impl fmt::Display for RecordValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordValue::A(ip) => write!(f, "{}", ip),
            RecordValue::Aaaa(ip) => write!(f, "{}", ip),
            RecordValue::Mx {
                preference,
                exchange,
            } => write!(f, "{} {}", preference, exchange),
            RecordValue::Srv {
                priority,
                weight,
                port,
                target,
            } => write!(f, "{} {} {} {}", priority, weight, port, target),
            RecordValue::Caa { flags, tag, value } => write!(f, "{} {} {}", flags, tag, value),
            RecordValue::Cname(s)
            | RecordValue::Txt(s)
            | RecordValue::Ptr(s)
            | RecordValue::Dname(s)
            | RecordValue::Aname(s) => f.write_str(s),
        }
    }
}

/// One record as the controller sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub zone: String,
    /// Fully qualified name (`web1.students.lab.example`).
    pub domain: String,
    pub ttl: u32,
    pub value: RecordValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Zone {
    pub name: String,
    pub kind: String,
    pub disabled: bool,
}

/// A record read back from the controller, value left as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PublishedRecord {
    pub name: String,
    pub record_type: String,
    pub ttl: u32,
    pub data: String,
}

/// Capability interface for the DNS controller.
#[async_trait]
pub trait DnsController: Send + Sync {
    /// Zones open to users (internal zones are filtered out).
    async fn list_zones(&self) -> Result<Vec<Zone>>;

    async fn get_records(&self, zone: &str, domain: &str) -> Result<Vec<PublishedRecord>>;

    async fn add_record(&self, record: &DnsRecord) -> Result<()>;

    /// Remove a record. A record the controller does not have counts as
    /// removed.
    async fn delete_record(&self, record: &DnsRecord) -> Result<()>;
}
