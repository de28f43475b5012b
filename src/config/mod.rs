//! Configuration module
//!
//! This module defines the proxy configuration structure and related methods
//! for loading configuration from different sources (command-line arguments,
//! environment variables, and configuration files).

mod defaults;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;

use crate::common::{ProxyError, Result};

/// Environment variable prefix for configuration options
pub const ENV_PREFIX: &str = "TUNLENS_";

/// Proxy configuration
///
/// Contains all configuration options needed by the engine and the
/// intercept listener. Supports loading from command-line arguments,
/// environment variables, and JSON configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(default)]
pub struct Config {
    /// Listen address for the local intercept listener
    #[serde(default = "defaults::listen")]
    pub listen: SocketAddr,

    /// Destination ports whose TCP flows are redirected into the intercept
    /// listener instead of being NAT-forwarded
    #[serde(default = "defaults::intercept_ports")]
    pub intercept_ports: Vec<u16>,

    /// Path of the password-protected PKCS#12 store holding the root CA
    #[serde(default = "defaults::ca_store_path")]
    pub ca_store_path: PathBuf,

    /// Password protecting the CA store at rest
    #[serde(default = "defaults::ca_password")]
    pub ca_password: String,

    /// Idle window after which a UDP flow is evicted and its socket closed
    #[serde(default = "defaults::udp_idle_timeout_secs")]
    pub udp_idle_timeout_secs: u64,

    /// Bound on each TLS handshake phase (client-facing and upstream)
    #[serde(default = "defaults::handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Bound on outbound TCP connects
    #[serde(default = "defaults::connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Verify upstream server certificates.
    ///
    /// Disabled by default: the tool's purpose is inspection of consenting
    /// clients, so the upstream connector trusts any certificate unless
    /// this is set. Enabling it makes upstream handshakes use the default
    /// trust roots and fail on invalid chains.
    #[serde(default = "defaults::verify_upstream")]
    pub verify_upstream: bool,

    /// Uplink interface outbound sockets are bound to (SO_BINDTODEVICE).
    /// When unset, sockets are opened unbound and routing policy must
    /// exclude this process from the tun routes by other means.
    #[serde(default = "defaults::bind_device")]
    pub bind_device: Option<String>,

    /// MTU of the tun device; reads are sized to this
    #[serde(default = "defaults::mtu")]
    pub mtu: usize,

    /// Relay buffer size
    #[serde(default = "defaults::buffer_size")]
    pub buffer_size: usize,

    /// Maximum relay buffers outstanding at once
    #[serde(default = "defaults::max_buffers")]
    pub max_buffers: usize,

    /// Log level (debug, info, warn, error)
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: defaults::listen(),
            intercept_ports: defaults::intercept_ports(),
            ca_store_path: defaults::ca_store_path(),
            ca_password: defaults::ca_password(),
            udp_idle_timeout_secs: defaults::udp_idle_timeout_secs(),
            handshake_timeout_secs: defaults::handshake_timeout_secs(),
            connect_timeout_secs: defaults::connect_timeout_secs(),
            verify_upstream: defaults::verify_upstream(),
            bind_device: defaults::bind_device(),
            mtu: defaults::mtu(),
            buffer_size: defaults::buffer_size(),
            max_buffers: defaults::max_buffers(),
            log_level: defaults::log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("Failed to read configuration file: {}", e))
        })?;

        serde_json::from_str(&config_str).map_err(|e| {
            ProxyError::Config(format!("Failed to parse configuration file: {}", e))
        })
    }

    /// Merge another configuration into this one
    ///
    /// Non-default values from `other` override values in `self`. This
    /// implements the configuration priority chain
    /// (defaults < file < environment < command line).
    pub fn merge(mut self, other: Config) -> Self {
        let base = Config::default();

        if other.listen != base.listen {
            self.listen = other.listen;
        }
        if other.intercept_ports != base.intercept_ports {
            self.intercept_ports = other.intercept_ports;
        }
        if other.ca_store_path != base.ca_store_path {
            self.ca_store_path = other.ca_store_path;
        }
        if other.ca_password != base.ca_password {
            self.ca_password = other.ca_password;
        }
        if other.udp_idle_timeout_secs != base.udp_idle_timeout_secs {
            self.udp_idle_timeout_secs = other.udp_idle_timeout_secs;
        }
        if other.handshake_timeout_secs != base.handshake_timeout_secs {
            self.handshake_timeout_secs = other.handshake_timeout_secs;
        }
        if other.connect_timeout_secs != base.connect_timeout_secs {
            self.connect_timeout_secs = other.connect_timeout_secs;
        }
        if other.verify_upstream != base.verify_upstream {
            self.verify_upstream = other.verify_upstream;
        }
        if other.bind_device != base.bind_device {
            self.bind_device = other.bind_device;
        }
        if other.mtu != base.mtu {
            self.mtu = other.mtu;
        }
        if other.buffer_size != base.buffer_size {
            self.buffer_size = other.buffer_size;
        }
        if other.max_buffers != base.max_buffers {
            self.max_buffers = other.max_buffers;
        }
        if other.log_level != base.log_level {
            self.log_level = other.log_level;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.intercept_ports.is_empty() {
            return Err(ProxyError::Config(
                "intercept_ports must name at least one port".to_string(),
            ));
        }
        if self.mtu < 576 {
            return Err(ProxyError::Config(format!(
                "mtu {} below minimum IPv4 datagram size", self.mtu
            )));
        }
        if self.buffer_size == 0 || self.max_buffers == 0 {
            return Err(ProxyError::Config(
                "buffer_size and max_buffers must be non-zero".to_string(),
            ));
        }
        if self.ca_password.is_empty() {
            return Err(ProxyError::Config(
                "ca_password must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
