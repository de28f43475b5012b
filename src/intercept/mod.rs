//! TLS intercept engine
//!
//! The loopback listener, the dual-handshake relay, and the
//! first-transaction HTTP observer.

pub mod http;
pub mod server;

pub use http::{HttpMessage, HttpSniffer, ParsedTransaction};
pub use server::{is_pinning_rejection, InterceptProxy, MitmContext, RedirectMap};
