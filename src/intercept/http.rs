//! First-transaction HTTP parsing
//!
//! Lightweight HTTP/1.x parsing for observability: start line plus headers
//! terminated by a blank line, with a body preview bounded by Content-Length
//! when present. Chunked and streamed bodies are not reassembled; the
//! preview is simply absent for them. Only the first request/response pair
//! on a connection is parsed; everything after relays opaquely.

/// Give up on header parsing beyond this many bytes
pub const MAX_HEADER_BYTES: usize = 32 * 1024;
/// Body previews are truncated to this length
pub const MAX_BODY_PREVIEW: usize = 2048;

/// A parsed HTTP message head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpMessage {
    pub start_line: String,
    /// Request method, `None` for responses
    pub method: Option<String>,
    /// Request target, `None` for responses
    pub url: Option<String>,
    /// Status code, `None` for requests
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    /// Bytes of the header block including the terminating blank line
    pub header_len: usize,
}

impl HttpMessage {
    pub fn is_response(&self) -> bool {
        self.status.is_some()
    }

    /// Case-insensitive header lookup returning the first match
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("Content-Length")?.trim().parse().ok()
    }
}

/// Locate the end of the header block (the index just past CRLFCRLF).
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse a complete header block out of `buf`.
///
/// Returns `None` while the blank line has not arrived yet or the start
/// line is not HTTP at all.
pub fn parse_message(buf: &[u8]) -> Option<HttpMessage> {
    let header_len = find_header_end(buf)?;
    let text = String::from_utf8_lossy(&buf[..header_len]);
    let mut lines = text.split("\r\n");

    let start_line = lines.next()?.to_string();
    if start_line.is_empty() {
        return None;
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some(idx) = line.find(':') {
            let key = line[..idx].trim();
            let value = line[idx + 1..].trim();
            if !key.is_empty() {
                headers.push((key.to_string(), value.to_string()));
            }
        }
    }

    let mut method = None;
    let mut url = None;
    let mut status = None;

    if start_line.starts_with("HTTP/") {
        status = start_line.split(' ').nth(1).and_then(|s| s.parse().ok());
        status?;
    } else {
        let mut parts = start_line.split(' ');
        let m = parts.next()?.to_string();
        let u = parts.next()?.to_string();
        // Request line must end with an HTTP version token
        if !parts.next().is_some_and(|v| v.starts_with("HTTP/")) {
            return None;
        }
        method = Some(m);
        url = Some(u);
    }

    Some(HttpMessage {
        start_line,
        method,
        url,
        status,
        headers,
        header_len,
    })
}

/// A completed first-transaction observation
#[derive(Debug, Clone)]
pub struct ParsedTransaction {
    pub message: HttpMessage,
    pub body_preview: Option<String>,
}

enum SniffState {
    Headers,
    Body { target: usize },
    Done,
}

/// Incremental observer fed with relayed bytes.
///
/// The relay forwards every chunk untouched; this only keeps a bounded copy
/// until the first message head (and its bounded body preview) is complete,
/// then stops accumulating for good.
pub struct HttpSniffer {
    buf: Vec<u8>,
    message: Option<HttpMessage>,
    state: SniffState,
}

impl HttpSniffer {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            message: None,
            state: SniffState::Headers,
        }
    }

    /// Whether this sniffer still wants bytes
    pub fn active(&self) -> bool {
        !matches!(self.state, SniffState::Done)
    }

    /// Feed relayed bytes; returns the transaction once fully observed.
    pub fn observe(&mut self, chunk: &[u8]) -> Option<ParsedTransaction> {
        match self.state {
            SniffState::Done => None,
            SniffState::Headers => {
                self.buf.extend_from_slice(chunk);
                if let Some(message) = parse_message(&self.buf) {
                    let body_len = message.content_length().unwrap_or(0);
                    let target = body_len.min(MAX_BODY_PREVIEW);
                    let header_len = message.header_len;
                    self.message = Some(message);

                    if target == 0 {
                        // Body absent (no Content-Length, or zero)
                        self.state = SniffState::Done;
                        return Some(self.finish(None));
                    }
                    if self.buf.len() - header_len >= target {
                        let preview = preview_from(&self.buf[header_len..], target);
                        self.state = SniffState::Done;
                        return Some(self.finish(preview));
                    }
                    self.state = SniffState::Body { target };
                    None
                } else if self.buf.len() > MAX_HEADER_BYTES {
                    // Not parseable within bounds; give up silently
                    self.buf = Vec::new();
                    self.state = SniffState::Done;
                    None
                } else {
                    None
                }
            }
            SniffState::Body { target } => {
                self.buf.extend_from_slice(chunk);
                let header_len = self.message.as_ref().map_or(0, |m| m.header_len);
                if self.buf.len() - header_len >= target {
                    let preview = preview_from(&self.buf[header_len..], target);
                    self.state = SniffState::Done;
                    return Some(self.finish(preview));
                }
                None
            }
        }
    }

    /// Flush whatever was gathered when the stream ends early.
    pub fn finish_eof(&mut self) -> Option<ParsedTransaction> {
        if matches!(self.state, SniffState::Done) {
            return None;
        }
        self.state = SniffState::Done;
        let message = self.message.take()?;
        let preview = preview_from(
            &self.buf[message.header_len..],
            MAX_BODY_PREVIEW.min(self.buf.len().saturating_sub(message.header_len)),
        );
        self.buf = Vec::new();
        Some(ParsedTransaction {
            message,
            body_preview: preview,
        })
    }

    fn finish(&mut self, body_preview: Option<String>) -> ParsedTransaction {
        let message = self.message.take().expect("message parsed before finish");
        self.buf = Vec::new();
        ParsedTransaction {
            message,
            body_preview,
        }
    }
}

impl Default for HttpSniffer {
    fn default() -> Self {
        Self::new()
    }
}

fn preview_from(body: &[u8], len: usize) -> Option<String> {
    if len == 0 || body.is_empty() {
        return None;
    }
    let take = len.min(body.len());
    Some(String::from_utf8_lossy(&body[..take]).into_owned())
}
