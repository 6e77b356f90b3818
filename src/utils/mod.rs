use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    // On Windows, disable ANSI colors to avoid garbage characters in console
    // On Unix systems, keep ANSI colors for better readability
    #[cfg(target_os = "windows")]
    let use_ansi = false;

    #[cfg(not(target_os = "windows"))]
    let use_ansi = true;

    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_ansi(use_ansi)
            .with_line_number(true)
            .with_file(true)
            .finish(),
    )?;
    Ok(())
}

/// Site-local (private range) address check
///
/// IPv4 private blocks, plus the deprecated IPv6 site-local prefix `fec0::/10`.
pub fn is_site_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfec0,
    }
}

/// Site-local IPv4 addresses grouped by interface name
pub fn site_local_interfaces() -> io::Result<BTreeMap<String, Vec<Ipv4Addr>>> {
    let mut interfaces: BTreeMap<String, Vec<Ipv4Addr>> = BTreeMap::new();
    for iface in get_if_addrs::get_if_addrs()? {
        if let IpAddr::V4(ip) = iface.ip() {
            if ip.is_private() {
                interfaces.entry(iface.name.clone()).or_default().push(ip);
            }
        }
    }
    Ok(interfaces)
}

/// Every site-local address bound to a local interface
pub fn site_local_addresses() -> io::Result<Vec<IpAddr>> {
    Ok(get_if_addrs::get_if_addrs()?
        .into_iter()
        .map(|iface| iface.ip())
        .filter(is_site_local)
        .collect())
}

/// Resolve `host:port`, preferring IPv4 to match the IPv4 P2P socket
pub async fn resolve_addr(host_port: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = host_port.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(host_port).await?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .with_context(|| format!("No addresses resolved for {}", host_port))
}
