//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::handlers::{CaptureLimits, ListenerSpec};
use crate::record::Protocol;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub ports: PortsConfig,
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    pub privileges: PrivilegesConfig,
    #[serde(default)]
    pub geoip: GeoIpConfig,
    #[serde(default)]
    pub recorders: Vec<RecorderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub tls_cert: String,
    #[serde(default)]
    pub tls_key: String,
    /// Reported as the `host` of every record; falls back to the system hostname
    #[serde(default)]
    pub hostname: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TcpPortConfig {
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortsConfig {
    #[serde(default)]
    pub tcp: Vec<TcpPortConfig>,
    #[serde(default)]
    pub udp: Vec<u16>,
    /// TCP ports that are neither listened on nor counted (e.g. the admin SSH port)
    #[serde(default)]
    pub ignore_tcp: Vec<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    pub interface: String,
    #[serde(default = "default_missed_file")]
    pub missed_file: PathBuf,
}

fn default_missed_file() -> PathBuf {
    PathBuf::from("missed.txt")
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_large_dir")]
    pub large_dir: PathBuf,
    #[serde(default = "default_spill_threshold")]
    pub spill_threshold: usize,
    #[serde(default = "default_max_tcp_bytes")]
    pub max_tcp_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            large_dir: default_large_dir(),
            spill_threshold: default_spill_threshold(),
            max_tcp_bytes: default_max_tcp_bytes(),
        }
    }
}

fn default_large_dir() -> PathBuf {
    PathBuf::from("large")
}

fn default_spill_threshold() -> usize {
    CaptureLimits::default().spill_threshold
}

fn default_max_tcp_bytes() -> usize {
    CaptureLimits::default().max_bytes
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrivilegesConfig {
    pub user: String,
    pub group: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoIpConfig {
    pub database: String,
}

impl Default for GeoIpConfig {
    fn default() -> Self {
        Self {
            database: "GeoLite2-City.mmdb".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl RecorderConfig {
    pub fn option(&self, key: &str) -> Result<&str> {
        self.options
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| anyhow::anyhow!("recorder '{}' requires option '{}'", self.name, key))
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var("HONEYPOKE_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let builder = config::Config::builder()
            .add_source(config::File::with_name(&config_path))
            .add_source(config::Environment::with_prefix("HONEYPOKE").separator("__"));

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let mut tcp_seen = HashSet::new();
        for tcp in &self.ports.tcp {
            if tcp.port == 0 {
                anyhow::bail!("Invalid TCP port: 0 is not allowed");
            }
            if !tcp_seen.insert(tcp.port) {
                anyhow::bail!("TCP port {} is configured more than once", tcp.port);
            }
        }

        let mut udp_seen = HashSet::new();
        for port in &self.ports.udp {
            if *port == 0 {
                anyhow::bail!("Invalid UDP port: 0 is not allowed");
            }
            if !udp_seen.insert(*port) {
                anyhow::bail!("UDP port {} is configured more than once", port);
            }
        }

        if self.ports.tcp.iter().any(|tcp| tcp.tls) && !self.tls_configured() {
            anyhow::bail!("TLS listeners require both server.tls_cert and server.tls_key");
        }

        if self.watcher.interface.is_empty() {
            anyhow::bail!("Watcher interface cannot be empty");
        }

        if self.capture.spill_threshold > self.capture.max_tcp_bytes {
            anyhow::bail!(
                "capture.spill_threshold ({}) cannot exceed capture.max_tcp_bytes ({})",
                self.capture.spill_threshold,
                self.capture.max_tcp_bytes
            );
        }

        if !self.recorders.iter().any(|r| r.enabled) {
            anyhow::bail!("No recorders enabled in config file");
        }

        Ok(())
    }

    pub fn tls_configured(&self) -> bool {
        !self.server.tls_cert.is_empty() && !self.server.tls_key.is_empty()
    }

    /// Every listener this process will bind, TCP first
    pub fn listeners(&self) -> Vec<ListenerSpec> {
        let tcp = self.ports.tcp.iter().map(|tcp| ListenerSpec {
            protocol: Protocol::Tcp,
            port: tcp.port,
            tls: tcp.tls,
        });
        let udp = self.ports.udp.iter().map(|port| ListenerSpec {
            protocol: Protocol::Udp,
            port: *port,
            tls: false,
        });
        tcp.chain(udp).collect()
    }

    pub fn capture_limits(&self) -> CaptureLimits {
        CaptureLimits {
            spill_threshold: self.capture.spill_threshold,
            max_bytes: self.capture.max_tcp_bytes,
            ..CaptureLimits::default()
        }
    }
}

#[cfg(test)]
pub(crate) fn parse(toml: &str) -> Result<Config> {
    let settings = config::Config::builder()
        .add_source(config::File::from_str(toml, config::FileFormat::Toml))
        .build()?;
    Ok(settings.try_deserialize()?)
}
