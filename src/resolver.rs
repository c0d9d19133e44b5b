use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;

/// Default Minecraft server port, also used when a supplied port is invalid.
pub const DEFAULT_PORT: u16 = 25565;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("dns lookup failed for {host}: {source}")]
    Dns {
        host: String,
        #[source]
        source: hickory_resolver::error::ResolveError,
    },
    #[error("{host} resolves only to private or reserved addresses")]
    PrivateIp { host: String },
}

/// Split `"host[:port]"`. Out-of-range or unparseable ports are clamped:
/// invalid or non-positive falls back to 25565, anything above 65535 becomes
/// 65535. IPv6 literals (more than one colon) are treated as bare hosts.
pub fn parse_server_address(input: &str) -> (String, u16) {
    let trimmed = input.trim();
    if let Some((host, port)) = trimmed.rsplit_once(':') {
        if !host.is_empty() && !host.contains(':') {
            return (host.to_string(), clamp_port(port));
        }
    }
    (trimmed.to_string(), DEFAULT_PORT)
}

fn clamp_port(raw: &str) -> u16 {
    match raw.trim().parse::<i64>() {
        Ok(p) if p > 65535 => 65535,
        Ok(p) if p > 0 => p as u16,
        _ => DEFAULT_PORT,
    }
}

/// SSRF guard: addresses a scan must never be dispatched to.
///
/// Rejects loopback, link-local, RFC1918, CGNAT (100.64/10), multicast,
/// reserved (240/4), unspecified, broadcast, and the IPv6 equivalents
/// including unique-local fc00::/7.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || octets[0] >= 240
        || (octets[0] == 100 && (octets[1] & 0xC0) == 64)
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let segments = ip.segments();
    ip.is_loopback()
        || ip.is_multicast()
        || ip.is_unspecified()
        || (segments[0] & 0xFFC0) == 0xFE80
        || (segments[0] & 0xFE00) == 0xFC00
        || ip.to_ipv4_mapped().is_some_and(is_private_v4)
}

/// Resolve `host` to one public IP address.
///
/// Literal IPs skip DNS and only pass the private-range check. Hostnames go
/// through A/AAAA lookup; the first public address wins, and a host whose
/// every address is private is rejected.
pub async fn resolve_server_ip(host: &str) -> Result<IpAddr, ResolveError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(ResolveError::PrivateIp {
                host: host.to_string(),
            });
        }
        return Ok(ip);
    }

    let resolver =
        TokioAsyncResolver::tokio_from_system_conf().map_err(|source| ResolveError::Dns {
            host: host.to_string(),
            source,
        })?;
    let lookup = resolver
        .lookup_ip(host)
        .await
        .map_err(|source| ResolveError::Dns {
            host: host.to_string(),
            source,
        })?;
    lookup
        .iter()
        .find(|ip| !is_private_ip(*ip))
        .ok_or_else(|| ResolveError::PrivateIp {
            host: host.to_string(),
        })
}

/// Query `_minecraft._tcp.<host>` and return the first SRV target/port.
/// Any failure means "no SRV record" — the caller keeps the original host.
pub async fn lookup_srv(host: &str) -> Option<(String, u16)> {
    let resolver = TokioAsyncResolver::tokio_from_system_conf().ok()?;
    let lookup = resolver
        .srv_lookup(format!("_minecraft._tcp.{host}."))
        .await
        .ok()?;
    let record = lookup.iter().next()?;
    let target = record.target().to_utf8();
    Some((target.trim_end_matches('.').to_string(), record.port()))
}
