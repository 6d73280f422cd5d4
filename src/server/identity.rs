//! Device identification.
//!
//! Field devices are identified by remote address before a single payload
//! byte is read. The identification table maps normalized remote IPs to
//! device aliases; with the whitelist flag set, an unknown address is
//! rejected outright.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use crate::error::{GatewayError, Result};

/// Remote-address-to-alias table plus the whitelist policy flag.
#[derive(Debug, Clone, Default)]
pub struct IdentityTable {
    aliases: HashMap<String, String>,
    require_alias: bool,
}

impl IdentityTable {
    pub fn new(aliases: HashMap<String, String>, require_alias: bool) -> Self {
        Self { aliases, require_alias }
    }

    /// Resolve a peer address to a device id.
    ///
    /// With the whitelist enabled, an address without an alias is rejected
    /// before any payload is read. Without it, the normalized address itself
    /// becomes the device id so every point still carries a stable identity.
    pub fn identify(&self, peer: SocketAddr) -> Result<String> {
        let host = normalize_remote(peer);
        match self.aliases.get(&host) {
            Some(alias) => Ok(alias.clone()),
            None if self.require_alias => Err(GatewayError::WhitelistRejected { addr: host }),
            None => Ok(host),
        }
    }
}

/// Strip the port and canonicalize loopback and IPv4-mapped-IPv6 forms, so
/// table entries written as dotted quads match however the peer connected.
pub fn normalize_remote(peer: SocketAddr) -> String {
    match peer.ip() {
        IpAddr::V4(ip) => ip.to_string(),
        IpAddr::V6(ip) => {
            if let Some(mapped) = ip.to_ipv4_mapped() {
                mapped.to_string()
            } else if ip.is_loopback() {
                "127.0.0.1".to_string()
            } else {
                ip.to_string()
            }
        }
    }
}
