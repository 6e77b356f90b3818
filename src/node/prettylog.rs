// ============================================================================
// Console Output Functions
// ============================================================================

use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::OffsetDateTime;
use crate::config::Config;
use crate::node::models::NodeStatus;
use crate::node::ListenAddrs;
use crate::session::SessionEvent;

const TIMESTAMP: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

pub fn log_startup_banner(config: &Config, listen: &ListenAddrs) {
    println!("====================================");
    println!("  udpunch peer starting");
    println!("====================================");
    println!("LAN listen: {}", format_addr(listen.lan));
    println!(
        "Keep-alive: {}ms (timeout {}ms)",
        config.session.keepalive_interval_ms,
        config
            .session
            .timing()
            .map(|t| t.timeout().as_millis().to_string())
            .unwrap_or_else(|_| "-".to_string())
    );
    if config.stun.enabled {
        println!("STUN server: {}", config.stun.server);
    }
    if config.beacon.enabled {
        println!(
            "LAN beacon: {}:{} every {}ms",
            config.beacon.multicast_addr, config.beacon.multicast_port, config.beacon.announce_interval_ms
        );
    }
    println!("------------------------------------");
}

pub fn format_addr(addr: Option<std::net::SocketAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string())
}

fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(TIMESTAMP)
        .unwrap_or_else(|_| "-".to_string())
}

/// One history line per event, `->` marks inbound text
pub fn format_event(event: &SessionEvent) -> String {
    match event {
        SessionEvent::Connected(addr) => format!("{} [{}] connected", timestamp(), addr),
        SessionEvent::Disconnected(addr) => format!("{} [{}] disconnected", timestamp(), addr),
        SessionEvent::Message(addr, payload) => {
            format!("{} [{}] -> {}", timestamp(), addr, String::from_utf8_lossy(payload))
        }
    }
}

pub fn print_event(event: &SessionEvent) {
    println!("{}", format_event(event));
}

pub fn print_sent(target: std::net::SocketAddr, text: &str) {
    println!("{} [{}] <- {}", timestamp(), target, text);
}

pub fn print_peers(status: &NodeStatus) {
    println!(" [Listen] LAN={}, WAN={}", status.lan.as_deref().unwrap_or("-"), status.wan.as_deref().unwrap_or("-"));
    if status.peers.is_empty() {
        println!("   (no peers)");
        return;
    }
    for (idx, peer) in status.peers.iter().enumerate() {
        let branch = if idx + 1 == status.peers.len() { "└─" } else { "├─" };
        let age = peer
            .last_receive_ms_ago
            .map(|ms| format!("{}ms ago", ms))
            .unwrap_or_else(|| "never".to_string());
        println!("   {} {:<24} {:<12} last rx: {}", branch, peer.addr, peer.state, age);
    }
}
