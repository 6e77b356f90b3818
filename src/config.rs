use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use crate::error::ConfigError;
use crate::session::Timing;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub beacon: BeaconConfig,
    #[serde(default)]
    pub stun: StunConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    // shared p2p socket, port 0 picks an ephemeral port
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // probe cadence for every peer session
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,

    // peer considered gone after this much silence, 3x interval when absent
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    // upper bound for a single send on the shared socket
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    // datagrams queued per session before the dispatcher starts dropping
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BeaconConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_multicast_addr")]
    pub multicast_addr: Ipv4Addr,

    #[serde(default = "default_multicast_port")]
    pub multicast_port: u16,

    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StunConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    // host:port, resolved once at startup
    #[serde(default = "default_stun_server")]
    pub server: String,

    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,

    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:0".to_string()
}

fn default_keepalive_interval_ms() -> u64 {
    3000
}

fn default_send_timeout_ms() -> u64 {
    1000
}

fn default_inbox_capacity() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_multicast_addr() -> Ipv4Addr {
    Ipv4Addr::new(224, 0, 0, 1)
}

fn default_multicast_port() -> u16 {
    12345
}

fn default_announce_interval_ms() -> u64 {
    1000
}

fn default_stun_server() -> String {
    "stun.l.google.com:19302".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            timeout_ms: None,
            send_timeout_ms: default_send_timeout_ms(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            multicast_addr: default_multicast_addr(),
            multicast_port: default_multicast_port(),
            announce_interval_ms: default_announce_interval_ms(),
        }
    }
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server: default_stun_server(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            timeout_ms: None,
        }
    }
}

impl SessionConfig {
    pub fn timing(&self) -> Result<Timing, ConfigError> {
        timing_from(self.keepalive_interval_ms, self.timeout_ms)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_addr
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.bind_addr.clone()))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl BeaconConfig {
    pub fn announce_interval(&self) -> Result<Duration, ConfigError> {
        if self.announce_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(Duration::from_millis(self.announce_interval_ms))
    }

    /// Multicast group, rejected unless it is in 224.0.0.0/4
    pub fn group(&self) -> Result<Ipv4Addr, ConfigError> {
        if !self.multicast_addr.is_multicast() {
            return Err(ConfigError::InvalidAddress(self.multicast_addr.to_string()));
        }
        Ok(self.multicast_addr)
    }
}

impl StunConfig {
    pub fn timing(&self) -> Result<Timing, ConfigError> {
        timing_from(self.keepalive_interval_ms, self.timeout_ms)
    }
}

fn timing_from(interval_ms: u64, timeout_ms: Option<u64>) -> Result<Timing, ConfigError> {
    let interval = Duration::from_millis(interval_ms);
    match timeout_ms {
        Some(timeout_ms) => Timing::new(interval, Duration::from_millis(timeout_ms)),
        None => Timing::with_interval(interval),
    }
}

impl Config {
    /// Check every timing relationship up front so nothing fails at runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.timing()?;
        self.session.bind_addr()?;
        if self.beacon.enabled {
            self.beacon.group()?;
            self.beacon.announce_interval()?;
        }
        if self.stun.enabled {
            self.stun.timing()?;
        }
        Ok(())
    }
}

pub fn load(path: &str) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
    let config: Config = toml::from_str(&content).with_context(|| format!("Failed to parse {}", path))?;
    config.validate().with_context(|| format!("Invalid configuration in {}", path))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.session.keepalive_interval_ms, 3000);
        assert_eq!(config.beacon.multicast_addr, Ipv4Addr::new(224, 0, 0, 1));
        assert_eq!(config.beacon.multicast_port, 12345);
        assert_eq!(config.beacon.announce_interval_ms, 1000);
        assert_eq!(config.stun.server, "stun.l.google.com:19302");

        let timing = config.session.timing().unwrap();
        assert_eq!(timing.timeout(), Duration::from_millis(9000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
            [session]
            keepalive_interval_ms = 1000
            timeout_ms = 2500

            [beacon]
            enabled = false
            "#,
        )
        .unwrap();
        let timing = config.session.timing().unwrap();
        assert_eq!(timing.interval(), Duration::from_millis(1000));
        assert_eq!(timing.timeout(), Duration::from_millis(2500));
        assert!(!config.beacon.enabled);
        assert!(config.stun.enabled);
    }

    #[test]
    fn test_timeout_not_above_interval_rejected() {
        let config: Config = toml::from_str(
            r#"
            [stun]
            keepalive_interval_ms = 3000
            timeout_ms = 3000
            "#,
        )
        .unwrap();
        assert_eq!(
            config.validate(),
            Err(ConfigError::TimeoutNotAboveInterval { interval_ms: 3000, timeout_ms: 3000 })
        );
    }

    #[test]
    fn test_unicast_beacon_group_rejected() {
        let mut config = Config::default();
        config.beacon.multicast_addr = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(config.validate(), Err(ConfigError::InvalidAddress("10.0.0.1".to_string())));

        // only checked while the beacon is enabled
        config.beacon.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_reports_path() {
        let missing = std::env::temp_dir().join("udpunch-missing-config.toml");
        let err = load(missing.to_str().unwrap()).unwrap_err();
        assert!(format!("{:#}", err).contains("udpunch-missing-config.toml"));

        let broken = std::env::temp_dir().join(format!("udpunch-broken-{}.toml", std::process::id()));
        fs::write(&broken, "[session\n").unwrap();
        let err = load(broken.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse"));
        fs::remove_file(&broken).unwrap();
    }

    #[test]
    fn test_bad_bind_addr_rejected() {
        let mut config = Config::default();
        config.session.bind_addr = "not-an-addr".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidAddress(_))));
    }
}
