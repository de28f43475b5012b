//! Observability events
//!
//! The ordered `Event` stream is the core's sole outbound data interface:
//! the caller receives events as they occur and decides about display,
//! storage, or forwarding. Nothing in the core blocks on the consumer.

use serde::Serialize;
use std::time::SystemTime;
use tokio::sync::mpsc;

/// One observation from the intercept engine
#[derive(Debug, Clone, Serialize)]
pub enum Event {
    /// First HTTP request seen on an intercepted connection
    Request {
        timestamp: SystemTime,
        hostname: String,
        method: String,
        url: String,
        headers: Vec<(String, String)>,
        body_preview: Option<String>,
    },
    /// Response paired with the first request
    Response {
        timestamp: SystemTime,
        hostname: String,
        status: u16,
        headers: Vec<(String, String)>,
        body_preview: Option<String>,
    },
    /// A peer rejected the interception certificate in a way that matches
    /// the certificate-pinning heuristics
    PinningDetected {
        timestamp: SystemTime,
        hostname: String,
        detail: String,
    },
    /// ALPN negotiation completed on an intercepted connection
    ProtocolDetected {
        timestamp: SystemTime,
        hostname: String,
        protocol: String,
    },
    /// A per-connection failure; other connections are unaffected
    Error {
        timestamp: SystemTime,
        hostname: Option<String>,
        message: String,
    },
}

impl Event {
    /// Hostname the event concerns, when known
    pub fn hostname(&self) -> Option<&str> {
        match self {
            Event::Request { hostname, .. }
            | Event::Response { hostname, .. }
            | Event::PinningDetected { hostname, .. }
            | Event::ProtocolDetected { hostname, .. } => Some(hostname),
            Event::Error { hostname, .. } => hostname.as_deref(),
        }
    }

    pub fn timestamp(&self) -> SystemTime {
        match self {
            Event::Request { timestamp, .. }
            | Event::Response { timestamp, .. }
            | Event::PinningDetected { timestamp, .. }
            | Event::ProtocolDetected { timestamp, .. }
            | Event::Error { timestamp, .. } => *timestamp,
        }
    }
}

/// Sender half handed to the core at construction
pub type EventSender = mpsc::UnboundedSender<Event>;
/// Receiver half kept by the caller
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Create the event channel pair.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_accessor() {
        let event = Event::Error {
            timestamp: SystemTime::now(),
            hostname: Some("api.example.com".to_string()),
            message: "handshake failed".to_string(),
        };
        assert_eq!(event.hostname(), Some("api.example.com"));

        let event = Event::Error {
            timestamp: SystemTime::now(),
            hostname: None,
            message: "no origin".to_string(),
        };
        assert_eq!(event.hostname(), None);
    }

    #[test]
    fn test_events_serialize() {
        let event = Event::ProtocolDetected {
            timestamp: SystemTime::now(),
            hostname: "example.com".to_string(),
            protocol: "http/1.1".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("ProtocolDetected"));
        assert!(json.contains("http/1.1"));
    }
}
