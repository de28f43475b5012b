//! Centralized configuration defaults
//!
//! Every default lives here so the serde attributes, `Default` impl, and
//! merge logic all agree on a single value.

use std::net::SocketAddr;
use std::path::PathBuf;

pub fn listen() -> SocketAddr {
    "127.0.0.1:8889".parse().expect("valid default listen address")
}

pub fn intercept_ports() -> Vec<u16> {
    vec![443, 8443]
}

pub fn ca_store_path() -> PathBuf {
    PathBuf::from("ca_keystore.p12")
}

pub fn ca_password() -> String {
    "tunlens".to_string()
}

pub fn udp_idle_timeout_secs() -> u64 {
    30
}

pub fn handshake_timeout_secs() -> u64 {
    10
}

pub fn connect_timeout_secs() -> u64 {
    10
}

pub fn verify_upstream() -> bool {
    false
}

pub fn bind_device() -> Option<String> {
    None
}

pub fn mtu() -> usize {
    1500
}

pub fn buffer_size() -> usize {
    8192
}

pub fn max_buffers() -> usize {
    256
}

pub fn log_level() -> String {
    "info".to_string()
}
