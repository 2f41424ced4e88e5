//! SNI to backend hostname derivation.
//!
//! The routing table is a pure function: the incoming SNI is normalized,
//! validated against DNS label rules, and prefixed to produce the hostname
//! the helper child dials.

use crate::error::TunnelError;

/// Prefix applied to the normalized SNI to obtain the tunnel hostname.
const TUNNEL_HOSTNAME_PREFIX: &str = "cft-";

/// Normalize, validate, and derive the tunnel hostname from a client SNI.
pub fn derive_tunnel_hostname(sni: &str) -> Result<String, TunnelError> {
    let normalized = sni.trim().to_ascii_lowercase();
    if let Err(reason) = validate_hostname(&normalized) {
        return Err(TunnelError::InvalidSni {
            sni: sni.to_string(),
            reason,
        });
    }
    let derived = format!("{TUNNEL_HOSTNAME_PREFIX}{normalized}");
    if let Err(reason) = validate_hostname(&derived) {
        return Err(TunnelError::InvalidSni {
            sni: sni.to_string(),
            reason: format!("derived hostname {derived:?}: {reason}"),
        });
    }
    Ok(derived)
}

/// Basic DNS hostname constraints for use on a helper command line.
fn validate_hostname(host: &str) -> Result<(), String> {
    if host.is_empty() {
        return Err("hostname is empty".to_string());
    }
    if host.len() > 253 {
        return Err("hostname too long".to_string());
    }
    if host.starts_with('.') || host.ends_with('.') {
        return Err("hostname must not start or end with a dot".to_string());
    }
    if !host.contains('.') {
        return Err("hostname must contain at least one dot".to_string());
    }
    for label in host.split('.') {
        if label.is_empty() {
            return Err("hostname has empty label".to_string());
        }
        if label.len() > 63 {
            return Err(format!("label {label:?} too long"));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(format!("label {label:?} contains invalid characters"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("label {label:?} must not start or end with a hyphen"));
        }
    }
    Ok(())
}
