//! Validation of user-supplied names and addresses.
//!
//! Machine names end up inside firewall object names and DNS labels, so they
//! are held to hostname label rules before anything is sent to a controller.

use std::net::IpAddr;

use crate::error::{ValidationError, ValidationResult};

/// Validate a single DNS label (RFC 1123).
pub fn validate_label(label: &str) -> ValidationResult<()> {
    if label.is_empty() || label.len() > 63 {
        return Err(ValidationError::new(
            "Labels must be between 1 and 63 characters",
        ));
    }

    if label.starts_with('-') || label.ends_with('-') {
        return Err(ValidationError::new(
            "Labels cannot start or end with a hyphen",
        ));
    }

    if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(ValidationError::new(format!(
            "Label '{}' contains invalid characters (only alphanumeric and '-' allowed)",
            label
        )));
    }

    Ok(())
}

/// Machine names become part of firewall object names and default DNS
/// labels, so they must be a single valid label.
pub fn validate_machine_name(name: &str) -> ValidationResult<()> {
    if name.trim().is_empty() {
        return Err(ValidationError::new("Name is required"));
    }
    validate_label(name).map_err(|e| ValidationError::new(format!("Invalid machine name: {}", e)))
}

/// Validate a dotted subdomain (one or more labels, no leading/trailing dot).
pub fn validate_subdomain(subdomain: &str) -> ValidationResult<()> {
    if subdomain.is_empty() || subdomain.len() > 253 {
        return Err(ValidationError::new(
            "Subdomain must be between 1 and 253 characters",
        ));
    }

    if subdomain.starts_with('.') || subdomain.ends_with('.') {
        return Err(ValidationError::new(
            "Subdomain cannot start or end with a dot",
        ));
    }

    for label in subdomain.split('.') {
        validate_label(label)
            .map_err(|e| ValidationError::new(format!("Invalid subdomain '{}': {}", subdomain, e)))?;
    }

    Ok(())
}

/// Strip trailing dots and lowercase, the form subdomains are stored in.
pub fn normalize_subdomain(subdomain: &str) -> String {
    subdomain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Parse an IPv4 or IPv6 literal.
pub fn parse_ip(address: &str) -> ValidationResult<IpAddr> {
    address
        .trim()
        .parse::<IpAddr>()
        .map_err(|_| ValidationError::new(format!("Invalid IP address: {}", address)))
}
