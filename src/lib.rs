//! Tunlens: transparent TLS-intercepting proxy over a tun interface
//!
//! Tunlens captures raw IPv4 traffic from an externally-created tun
//! device, reconstructs TCP/UDP flows and forwards them through protected
//! sockets, and terminates TLS locally for flows destined to TLS ports
//! using an on-the-fly-issued certificate so the first HTTP transaction
//! can be observed before the bytes relay opaquely.
//!
//! # Main Features
//!
//! - IPv4/TCP/UDP packet codec with computed checksums
//! - NAT-style flow tracking with protected outbound sockets
//! - Local certificate authority with a persisted, password-protected root
//! - Zero-copy ClientHello sniffing for SNI/ALPN
//! - Dual-handshake TLS interception emitting an ordered event stream
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tunlens::config::Config;
//! use tunlens::event;
//! use tunlens::intercept::{MitmContext, RedirectMap};
//! use tunlens::proxy::Engine;
//! use tunlens::tls::CaManager;
//! use tunlens::common::NullProtector;
//!
//! #[tokio::main]
//! async fn main() -> tunlens::common::Result<()> {
//!     let config = Arc::new(Config::default());
//!     let ca = Arc::new(CaManager::new(&config.ca_store_path, &config.ca_password));
//!     let (events, mut event_rx) = event::channel();
//!     let ctx = Arc::new(MitmContext::new(&config, ca, events, Arc::new(NullProtector)));
//!
//!     let engine = Engine::new(config, ctx, Arc::new(RedirectMap::new()));
//!     // `device` is the externally-created tun device, e.g. an inherited fd
//!     let device = tokio::io::duplex(1500).0;
//!     let mut handle = engine.start(device).await?;
//!
//!     tokio::spawn(async move {
//!         while let Some(event) = event_rx.recv().await {
//!             println!("{:?}", event);
//!         }
//!     });
//!
//!     handle.wait().await;
//!     Ok(())
//! }
//! ```

// Public modules
pub mod common;
pub mod config;
pub mod event;
pub mod intercept;
pub mod nat;
pub mod packet;
pub mod pcap;
pub mod proxy;
pub mod tls;

// Re-export commonly used structures and functions for convenience
pub use common::{parse_socket_addr, ProxyError, Result};
pub use event::{Event, EventReceiver, EventSender};
pub use proxy::{Engine, EngineHandle};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
