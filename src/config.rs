//! Server configuration
//!
//! A validated, immutable settings record. Loaded from JSON (all fields
//! optional, defaults below) and/or built from command line flags, then
//! checked by `validate` before the server binds.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::{Codec, Encoding, ErrorPolicy};
use crate::error::ConfigError;

/// Default bind host
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default bind port
pub const DEFAULT_PORT: u16 = 9999;
/// Default connection limit
pub const DEFAULT_MAX_USERS: usize = 5;
/// Default read buffer size in bytes
pub const DEFAULT_BUFF_SIZE: usize = 4096;
/// Default number of broadcasts kept for `DUMP`
pub const DEFAULT_HISTORY_SIZE: usize = 100;

const MAX_USERS_RANGE: std::ops::RangeInclusive<usize> = 1..=100;
const BUFF_SIZE_RANGE: std::ops::RangeInclusive<usize> = 1024..=(1 << 20);
/// Largest accepted `history_size`
pub const MAX_HISTORY_SIZE: usize = 10_000;

/// Who may issue `KICK`, `BAN` and `KILL`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminPolicy {
    /// Every session
    #[default]
    Anyone,
    /// Only sessions connected from a loopback address
    Loopback,
}

/// Server settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Dotted-quad IPv4 address to bind
    pub host: String,
    pub port: u16,
    /// Maximum concurrent sessions, also the listen backlog
    pub max_users: usize,
    /// Bytes per socket read, and the longest accepted line
    pub buff_size: usize,
    pub encoding: Encoding,
    pub encoding_errors: ErrorPolicy,
    /// Install a log subscriber in the binary
    pub logging: bool,
    /// Broadcasts kept for `DUMP`; 0 disables the log
    pub history_size: usize,
    pub admin_policy: AdminPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_users: DEFAULT_MAX_USERS,
            buff_size: DEFAULT_BUFF_SIZE,
            encoding: Encoding::Utf8,
            encoding_errors: ErrorPolicy::Replace,
            logging: true,
            history_size: DEFAULT_HISTORY_SIZE,
            admin_policy: AdminPolicy::Anyone,
        }
    }
}

impl Config {
    /// Load a JSON config file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Check every setting, returning the first violation
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ipv4_host()?;
        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }
        if !MAX_USERS_RANGE.contains(&self.max_users) {
            return Err(ConfigError::InvalidMaxUsers(self.max_users));
        }
        if !BUFF_SIZE_RANGE.contains(&self.buff_size) {
            return Err(ConfigError::InvalidBuffSize(self.buff_size));
        }
        if self.history_size > MAX_HISTORY_SIZE {
            return Err(ConfigError::InvalidHistorySize(self.history_size));
        }
        if !self.codec().round_trips("test") {
            return Err(ConfigError::EncodingRoundTrip(self.encoding.to_string()));
        }
        Ok(())
    }

    /// Parsed bind address
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::V4(SocketAddrV4::new(self.ipv4_host()?, self.port)))
    }

    /// Initial codec for new sessions
    pub fn codec(&self) -> Codec {
        Codec::new(self.encoding, self.encoding_errors)
    }

    fn ipv4_host(&self) -> Result<Ipv4Addr, ConfigError> {
        // Ipv4Addr's parser already insists on exactly four decimal octets
        self.host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(self.host.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.bind_addr().unwrap(),
            "127.0.0.1:9999".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_invalid_host() {
        for host in ["localhost", "1.2.3", "1.2.3.4.5", "256.0.0.1", "::1"] {
            let config = Config {
                host: host.to_string(),
                ..Config::default()
            };
            assert!(
                matches!(config.validate(), Err(ConfigError::InvalidHost(_))),
                "host {host} should be rejected"
            );
        }
    }

    #[test]
    fn test_port_zero_rejected() {
        let config = Config {
            port: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPort(0))));
    }

    #[test]
    fn test_max_users_bounds() {
        for (max_users, ok) in [(0, false), (1, true), (100, true), (101, false)] {
            let config = Config {
                max_users,
                ..Config::default()
            };
            assert_eq!(config.validate().is_ok(), ok, "max_users {max_users}");
        }
    }

    #[test]
    fn test_buff_size_bounds() {
        for (buff_size, ok) in [(1023, false), (1024, true), (1 << 20, true), ((1 << 20) + 1, false)] {
            let config = Config {
                buff_size,
                ..Config::default()
            };
            assert_eq!(config.validate().is_ok(), ok, "buff_size {buff_size}");
        }
    }

    #[test]
    fn test_history_size_bounds() {
        for (history_size, ok) in [(0, true), (MAX_HISTORY_SIZE, true), (MAX_HISTORY_SIZE + 1, false)] {
            let config = Config {
                history_size,
                ..Config::default()
            };
            assert_eq!(config.validate().is_ok(), ok, "history_size {history_size}");
        }

        let config = Config {
            history_size: usize::MAX,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidHistorySize(usize::MAX))
        ));
    }

    #[test]
    fn test_json_partial_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"port": 7000, "encoding": "latin-1", "admin_policy": "loopback"}"#)
                .unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.encoding, Encoding::Latin1);
        assert_eq!(config.admin_policy, AdminPolicy::Loopback);
        assert_eq!(config.max_users, DEFAULT_MAX_USERS);
    }

    #[test]
    fn test_json_rejects_unknown_encoding() {
        let result = serde_json::from_str::<Config>(r#"{"encoding": "klingon"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_json_rejects_strict_policy() {
        let result = serde_json::from_str::<Config>(r#"{"encoding_errors": "strict"}"#);
        assert!(result.is_err());
    }
}
