//! Host name resolution into concrete endpoints.

use std::net::{IpAddr, SocketAddr};

use tracing::debug;

use crate::error::ForwardError;

/// Resolve `host` to a single socket address.
///
/// IP literals are used as-is. Otherwise the first IPv4 result wins, falling
/// back to the first result of any family.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ForwardError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let candidates: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ForwardError::AddressResolution {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    let addr = pick_preferred(&candidates).ok_or_else(|| ForwardError::AddressResolution {
        host: host.to_string(),
        reason: "no addresses returned".to_string(),
    })?;
    debug!(host, %addr, candidates = candidates.len(), "Resolved host");
    Ok(addr)
}

/// First IPv4 address, else the first address.
pub fn pick_preferred(candidates: &[SocketAddr]) -> Option<SocketAddr> {
    candidates
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
}
