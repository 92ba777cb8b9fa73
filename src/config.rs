//! Configuration loading.

use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid IP range {0:?}")]
    BadIpRange(String),
}

/// Bouncer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub listen: ListenConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Hostname the bouncer identifies as towards downstreams.
    pub hostname: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Address of the plaintext listener, e.g. `127.0.0.1:6667`.
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "slbncd.db".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// Cap on messages replayed per target (backlog and CHATHISTORY).
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig {
            limit: default_history_limit(),
        }
    }
}

fn default_history_limit() -> usize {
    4000
}

/// Upstream dialing options.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamConfig {
    /// IPv4 range in `base/prefix` form to bind local upstream sockets
    /// from; the address picked for a user is `base + user id + 1`.
    pub bind_ipv4: Option<String>,
    /// Same for IPv6.
    pub bind_ipv6: Option<String>,
}

/// An IP range for deterministic local binds.
#[derive(Debug, Clone, Copy)]
pub struct IpRange {
    pub base: IpAddr,
    pub prefix_len: u8,
}

impl IpRange {
    pub fn parse(s: &str) -> Result<IpRange, ConfigError> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| ConfigError::BadIpRange(s.to_owned()))?;
        let base: IpAddr = addr
            .parse()
            .map_err(|_| ConfigError::BadIpRange(s.to_owned()))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| ConfigError::BadIpRange(s.to_owned()))?;
        let max = match base {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(ConfigError::BadIpRange(s.to_owned()));
        }
        Ok(IpRange { base, prefix_len })
    }

    /// `base + offset`, or `None` when the result leaves the range.
    pub fn addr_at(&self, offset: u128) -> Option<IpAddr> {
        match self.base {
            IpAddr::V4(v4) => {
                let host_bits = 32 - u32::from(self.prefix_len);
                let base = u32::from(v4);
                let addr = base.checked_add(u32::try_from(offset).ok()?)?;
                if host_bits < 32 && (addr >> host_bits) != (base >> host_bits) {
                    return None;
                }
                Some(IpAddr::V4(addr.into()))
            }
            IpAddr::V6(v6) => {
                let host_bits = 128 - u32::from(self.prefix_len);
                let base = u128::from(v6);
                let addr = base.checked_add(offset)?;
                if host_bits < 128 && (addr >> host_bits) != (base >> host_bits) {
                    return None;
                }
                Some(IpAddr::V6(addr.into()))
            }
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal() {
        let config: Config = toml::from_str(
            r#"
            [server]
            hostname = "bouncer.example.org"
            [listen]
            address = "127.0.0.1:6667"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.hostname, "bouncer.example.org");
        assert_eq!(config.history.limit, 4000);
        assert_eq!(config.database.path, "slbncd.db");
    }

    #[test]
    fn ip_range_offsets() {
        let range = IpRange::parse("192.0.2.0/29").unwrap();
        assert_eq!(range.addr_at(3).unwrap().to_string(), "192.0.2.3");
        assert!(range.addr_at(9).is_none(), "outside the /29");

        let range = IpRange::parse("2001:db8::/64").unwrap();
        assert_eq!(range.addr_at(5).unwrap().to_string(), "2001:db8::5");

        assert!(IpRange::parse("not-an-ip/24").is_err());
        assert!(IpRange::parse("192.0.2.0").is_err());
        assert!(IpRange::parse("192.0.2.0/40").is_err());
    }
}
