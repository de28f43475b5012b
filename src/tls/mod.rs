//! TLS handling module
//!
//! Certificate authority management and ClientHello sniffing. The intercept
//! engine consumes both; neither holds global state.

pub mod ca;
pub mod sniffer;

pub use ca::{names_equal, CaCredentials, CaManager, LeafCertificate};
pub use sniffer::{looks_like_tls, peek_client_hello, ClientHelloInfo, TlsVersion};
