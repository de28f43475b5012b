//! Connection tracker / NAT engine module
//!
//! Flow identification, the concurrent flow table, and the per-flow tasks
//! that own the protected outbound sockets.

pub mod flow;
pub mod tracker;

pub use flow::{FlowKey, FlowProto, TcpState};
pub use tracker::{ConnectionTracker, TrackerConfig};
