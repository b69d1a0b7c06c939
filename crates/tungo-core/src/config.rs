//! Startup configuration: JSON files produced by administrative tooling,
//! consumed once at process start.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::replay::DEFAULT_WINDOW;

/// Floor applied to the handshake deadline regardless of `dialTimeoutMs`.
pub const HANDSHAKE_DEADLINE_FLOOR: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("reading configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing configuration: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// Everything one session needs to know about its transport and tunnel
/// addressing. Immutable once a session starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSettings {
    #[serde(rename = "connectionIP")]
    pub connection_ip: String,
    pub port: u16,
    pub interface_name: String,
    /// Tunnel IPv4 address in textual form.
    pub interface_address: String,
    #[serde(rename = "interfaceIPCIDR")]
    pub interface_ip_cidr: u8,
    /// Optional tunnel IPv6 address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_address_v6: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_v6_cidr: Option<u8>,
    pub mtu: u16,
    pub dial_timeout_ms: u64,
    /// Replay window capacity for datagram transports, in messages.
    #[serde(default = "default_replay_window")]
    pub replay_window: usize,
}

fn default_replay_window() -> usize {
    DEFAULT_WINDOW
}

impl ConnectionSettings {
    pub fn endpoint(&self) -> String {
        let ip: Result<IpAddr, _> = self.connection_ip.parse();
        match ip {
            Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, self.port),
            _ => format!("{}:{}", self.connection_ip, self.port),
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Handshake deadline: `dialTimeoutMs` with a five-second floor.
    pub fn handshake_deadline(&self) -> Duration {
        self.dial_timeout().max(HANDSHAKE_DEADLINE_FLOOR)
    }

    pub fn tunnel_ip(&self) -> Result<IpAddr, ConfigError> {
        self.interface_address
            .parse()
            .map_err(|_| ConfigError::Invalid(format!(
                "interfaceAddress {:?} is not an IP address",
                self.interface_address
            )))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".into()));
        }
        if self.connection_ip.is_empty() {
            return Err(ConfigError::Invalid("connectionIP must be set".into()));
        }
        let tunnel = self.tunnel_ip()?;
        if tunnel.is_ipv4() && self.interface_ip_cidr > 32 {
            return Err(ConfigError::Invalid(format!(
                "interfaceIPCIDR {} exceeds 32",
                self.interface_ip_cidr
            )));
        }
        if let Some(v6) = &self.interface_address_v6 {
            let parsed: IpAddr = v6.parse().map_err(|_| {
                ConfigError::Invalid(format!("interfaceAddressV6 {:?} is not an IP address", v6))
            })?;
            if !parsed.is_ipv6() {
                return Err(ConfigError::Invalid(
                    "interfaceAddressV6 must be an IPv6 address".into(),
                ));
            }
            if self.interface_v6_cidr.unwrap_or(0) > 128 {
                return Err(ConfigError::Invalid("interfaceV6Cidr exceeds 128".into()));
            }
        }
        if self.mtu < 576 {
            return Err(ConfigError::Invalid(format!(
                "mtu {} is below the IPv4 minimum of 576",
                self.mtu
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub protocol: Transport,
    pub tcp_settings: ConnectionSettings,
    pub udp_settings: ConnectionSettings,
    #[serde(rename = "ed25519ServerPublic")]
    pub ed25519_server_public: String,
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: ClientConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.active().validate()?;
        if self.ed25519_server_public.is_empty() {
            return Err(ConfigError::Invalid("ed25519ServerPublic must be set".into()));
        }
        Ok(())
    }

    /// Settings for the configured transport.
    pub fn active(&self) -> &ConnectionSettings {
        match self.protocol {
            Transport::Tcp => &self.tcp_settings,
            Transport::Udp => &self.udp_settings,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(rename = "enableTCP")]
    pub enable_tcp: bool,
    #[serde(rename = "enableUDP")]
    pub enable_udp: bool,
    pub tcp_settings: ConnectionSettings,
    pub udp_settings: ConnectionSettings,
    #[serde(rename = "ed25519Public")]
    pub ed25519_public: String,
    #[serde(rename = "ed25519Private")]
    pub ed25519_private: String,
    #[serde(default)]
    pub allowed_peers: Vec<String>,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enable_tcp && !self.enable_udp {
            return Err(ConfigError::Invalid(
                "at least one of enableTCP/enableUDP must be set".into(),
            ));
        }
        if self.enable_tcp {
            self.tcp_settings.validate()?;
        }
        if self.enable_udp {
            self.udp_settings.validate()?;
        }
        if self.ed25519_private.is_empty() {
            return Err(ConfigError::Invalid("ed25519Private must be set".into()));
        }
        Ok(())
    }

    /// Settings the shared device is sized from.
    pub fn device_settings(&self) -> &ConnectionSettings {
        if self.enable_tcp {
            &self.tcp_settings
        } else {
            &self.udp_settings
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn settings(port: u16) -> ConnectionSettings {
        ConnectionSettings {
            connection_ip: "127.0.0.1".into(),
            port,
            interface_name: "tungo0".into(),
            interface_address: "10.0.0.2".into(),
            interface_ip_cidr: 24,
            interface_address_v6: None,
            interface_v6_cidr: None,
            mtu: 1420,
            dial_timeout_ms: 5000,
            replay_window: DEFAULT_WINDOW,
        }
    }

    #[test]
    fn json_field_names_match_the_published_schema() {
        let json = serde_json::to_value(settings(51820)).unwrap();
        let obj = json.as_object().unwrap();
        for field in [
            "connectionIP",
            "port",
            "interfaceName",
            "interfaceAddress",
            "interfaceIPCIDR",
            "mtu",
            "dialTimeoutMs",
            "replayWindow",
        ] {
            assert!(obj.contains_key(field), "missing field {field}");
        }
    }

    #[test]
    fn client_config_roundtrips_through_json() {
        let config = ClientConfig {
            protocol: Transport::Udp,
            tcp_settings: settings(51820),
            udp_settings: settings(51821),
            ed25519_server_public: "AAAA".into(),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"protocol\":\"udp\""));
        assert!(json.contains("\"ed25519ServerPublic\""));
        let back: ClientConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.protocol, Transport::Udp);
        assert_eq!(back.active().port, 51821);
    }

    #[test]
    fn deadline_is_floored_at_five_seconds() {
        let mut s = settings(1);
        s.dial_timeout_ms = 100;
        assert_eq!(s.handshake_deadline(), Duration::from_secs(5));
        s.dial_timeout_ms = 9000;
        assert_eq!(s.handshake_deadline(), Duration::from_secs(9));
    }

    #[test]
    fn invalid_settings_are_refused() {
        let mut s = settings(0);
        assert!(s.validate().is_err());
        s.port = 51820;
        s.interface_address = "not-an-ip".into();
        assert!(s.validate().is_err());
        s.interface_address = "10.0.0.2".into();
        s.mtu = 100;
        assert!(s.validate().is_err());
    }

    #[test]
    fn server_config_needs_a_transport() {
        let config = ServerConfig {
            enable_tcp: false,
            enable_udp: false,
            tcp_settings: settings(51820),
            udp_settings: settings(51821),
            ed25519_public: String::new(),
            ed25519_private: "AAAA".into(),
            allowed_peers: vec![],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn ipv6_endpoint_is_bracketed() {
        let mut s = settings(51820);
        s.connection_ip = "fd00::1".into();
        assert_eq!(s.endpoint(), "[fd00::1]:51820");
    }
}
