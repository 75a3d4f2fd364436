//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Per-port banner overrides; keys are port numbers.
    #[serde(default)]
    pub banners: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Upper bound (inclusive) for on-demand listener creation.
    #[serde(default = "default_max_port")]
    pub max_port: u16,
    /// `""` for 0.0.0.0, `"public"` to pick the first non-private IPv4
    /// found on local interfaces, or a literal address.
    #[serde(default)]
    pub bind_address: String,
    /// Strikes per source IP before connections are dropped outright.
    #[serde(default = "default_ban_threshold")]
    pub ban_threshold: u64,
    /// Ports opened unconditionally at startup. Required where the raw
    /// socket observer cannot run.
    #[serde(default)]
    pub preopen_ports: Vec<u16>,
    /// How long to wait for a silent client before sending the port's
    /// banner.
    #[serde(default = "default_banner_delay_ms")]
    pub banner_delay_ms: u64,
    /// Idle deadline for the initial read; stalled connections are closed.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

fn default_max_port() -> u16 {
    65535
}

fn default_ban_threshold() -> u64 {
    128
}

fn default_banner_delay_ms() -> u64 {
    500
}

fn default_idle_timeout_ms() -> u64 {
    5000
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_port: default_max_port(),
            bind_address: String::new(),
            ban_threshold: default_ban_threshold(),
            preopen_ports: Vec::new(),
            banner_delay_ms: default_banner_delay_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptureConfig {
    /// Filesystem root for artifacts; `"."` is the working directory and
    /// `""` disables the local sink.
    #[serde(default)]
    pub output_folder: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3Config {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub key_id: String,
    /// Secret key; the S3 sink is disabled while this is empty.
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("mantrap").required(false))
            .add_source(config::Environment::with_prefix("MANTRAP").separator("__"));

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.manager.max_port == 0 {
            anyhow::bail!("Invalid max_port: 0 is not allowed");
        }

        let bind = self.manager.bind_address.as_str();
        if !bind.is_empty() && bind != "public" && bind.parse::<IpAddr>().is_err() {
            anyhow::bail!("Invalid bind_address '{}'", bind);
        }

        for port in self.banners.keys() {
            if port.parse::<u16>().is_err() {
                anyhow::bail!("Invalid banner port '{}'", port);
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid logging level '{}'. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        Ok(())
    }

    /// Address listeners bind to, resolved once at startup.
    pub fn resolve_bind_addr(&self) -> Result<IpAddr> {
        match self.manager.bind_address.as_str() {
            "" => Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            "public" => first_public_ipv4()
                .ok_or_else(|| anyhow::anyhow!("no non-private IPv4 address on any interface")),
            literal => Ok(literal.parse()?),
        }
    }

    /// Banner override configured for `port`, if any.
    pub fn banner_override(&self, port: u16) -> Option<Vec<u8>> {
        self.banners
            .get(&port.to_string())
            .map(|banner| banner.clone().into_bytes())
    }
}

/// First non-private IPv4 address discovered on local interfaces.
fn first_public_ipv4() -> Option<IpAddr> {
    for iface in pnet::datalink::interfaces() {
        for network in &iface.ips {
            if let IpAddr::V4(ip) = network.ip() {
                if !is_private_ipv4(&ip) {
                    return Some(IpAddr::V4(ip));
                }
            }
        }
    }
    None
}

fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_unspecified()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.manager.max_port, 65535);
        assert_eq!(
            config.resolve_bind_addr().unwrap(),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
    }

    #[test]
    fn rejects_bad_bind_address() {
        let config = Config {
            manager: ManagerConfig {
                bind_address: "not-an-ip".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn literal_bind_address_resolves() {
        let config = Config {
            manager: ManagerConfig {
                bind_address: "127.0.0.1".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(
            config.resolve_bind_addr().unwrap(),
            "127.0.0.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn rejects_bad_banner_port() {
        let mut config = Config::default();
        config
            .banners
            .insert("not-a-port".into(), "hello\r\n".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn banner_override_lookup() {
        let mut config = Config::default();
        config.banners.insert("2222".into(), "SSH-2.0-test\r\n".into());
        assert_eq!(
            config.banner_override(2222),
            Some(b"SSH-2.0-test\r\n".to_vec())
        );
        assert_eq!(config.banner_override(22), None);
    }

    #[test]
    fn rejects_bad_log_level() {
        let config = Config {
            logging: LoggingConfig {
                level: "loud".into(),
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
