//! Common module
//!
//! This module contains shared types, errors, and utility functions used throughout the application.

pub mod error;
pub mod log;
pub mod net;
pub mod buffer_pool;

// Re-export commonly used types and functions
pub use error::{ProxyError, Result};
pub use log::init_logger;
pub use net::{
    parse_socket_addr, bind_udp_protected, connect_tcp_protected, ArcProtector,
    DeviceProtector, NullProtector, SocketProtector,
};
pub use buffer_pool::{BufferPool, PooledBuffer};
