//! TLS ClientHello sniffing
//!
//! Non-destructive inspection of the first bytes of a connection, similar
//! to how NGINX and HAProxy detect protocols before committing to one.
//! `looks_like_tls` answers the cheap question (is this a TLS handshake
//! record at all); `peek_client_hello` walks the full ClientHello and
//! extracts SNI and ALPN.
//!
//! Sniffing failure must never block a connection: any structural
//! inconsistency yields the best-effort partial result gathered so far,
//! and the input buffer is never consumed or mutated. The same bytes are
//! handed unmodified to the real TLS handshake afterwards.

use std::fmt;

/// TLS record content type for handshake messages
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
/// Handshake message type for ClientHello
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
/// server_name extension
const EXT_SERVER_NAME: u16 = 0x0000;
/// application_layer_protocol_negotiation extension
const EXT_ALPN: u16 = 0x0010;

/// TLS protocol version named by the record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Ssl3,
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    fn from_wire(major: u8, minor: u8) -> Option<Self> {
        match (major, minor) {
            (0x03, 0x00) => Some(TlsVersion::Ssl3),
            (0x03, 0x01) => Some(TlsVersion::Tls10),
            (0x03, 0x02) => Some(TlsVersion::Tls11),
            (0x03, 0x03) => Some(TlsVersion::Tls12),
            (0x03, 0x04) => Some(TlsVersion::Tls13),
            _ => None,
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TlsVersion::Ssl3 => "SSLv3",
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        };
        f.write_str(name)
    }
}

/// Information extracted from a ClientHello without consuming it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHelloInfo {
    pub is_tls: bool,
    pub version: Option<TlsVersion>,
    pub sni: Option<String>,
    pub alpn: Vec<String>,
}

/// Quick record-level check: handshake content type, 3.x version, and a
/// plausible record length.
pub fn looks_like_tls(bytes: &[u8]) -> bool {
    if bytes.len() < 5 {
        return false;
    }
    if bytes[0] != CONTENT_TYPE_HANDSHAKE {
        return false;
    }
    if bytes[1] != 0x03 || bytes[2] > 0x04 {
        return false;
    }
    let record_len = usize::from(u16::from_be_bytes([bytes[3], bytes[4]]));
    (4..=16384).contains(&record_len)
}

/// Walk a ClientHello and extract SNI/ALPN.
///
/// The walk is strict about order (client version, random, session id,
/// cipher suites, compression methods, extensions) but forgiving about
/// truncation: running out of bytes returns whatever was gathered.
pub fn peek_client_hello(bytes: &[u8]) -> ClientHelloInfo {
    let mut info = ClientHelloInfo::default();
    if !looks_like_tls(bytes) {
        return info;
    }
    info.is_tls = true;
    info.version = TlsVersion::from_wire(bytes[1], bytes[2]);

    walk_client_hello(bytes, &mut info);
    info
}

fn walk_client_hello(bytes: &[u8], info: &mut ClientHelloInfo) -> Option<()> {
    let mut cur = Cursor { buf: bytes, pos: 5 };

    if cur.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    cur.skip(3)?; // handshake length
    cur.skip(2)?; // client version
    cur.skip(32)?; // random

    let session_id_len = usize::from(cur.u8()?);
    cur.skip(session_id_len)?;

    let cipher_len = usize::from(cur.u16()?);
    cur.skip(cipher_len)?;

    let compression_len = usize::from(cur.u8()?);
    cur.skip(compression_len)?;

    let extensions_len = usize::from(cur.u16()?);
    let extensions_end = cur.pos.checked_add(extensions_len)?;

    while cur.pos + 4 <= extensions_end.min(bytes.len()) {
        let ext_type = cur.u16()?;
        let ext_len = usize::from(cur.u16()?);
        let ext_data = cur.take(ext_len)?;

        match ext_type {
            EXT_SERVER_NAME => parse_server_name(ext_data, info),
            EXT_ALPN => parse_alpn(ext_data, info),
            _ => {}
        }
    }

    Some(())
}

/// server_name extension: a list of (type, length, name) entries; only the
/// first host_name entry matters.
fn parse_server_name(data: &[u8], info: &mut ClientHelloInfo) {
    let mut cur = Cursor { buf: data, pos: 0 };
    let Some(list_len) = cur.u16() else { return };
    let end = usize::from(list_len).min(data.len());

    while cur.pos + 3 <= end {
        let Some(name_type) = cur.u8() else { return };
        let Some(name_len) = cur.u16() else { return };
        let Some(name) = cur.take(usize::from(name_len)) else { return };
        if name_type == 0 {
            info.sni = Some(String::from_utf8_lossy(name).into_owned());
            return;
        }
    }
}

/// ALPN extension: a 2-byte list length, then 1-byte-length-prefixed
/// protocol names in client preference order.
fn parse_alpn(data: &[u8], info: &mut ClientHelloInfo) {
    let mut cur = Cursor { buf: data, pos: 0 };
    let Some(list_len) = cur.u16() else { return };
    let end = (2 + usize::from(list_len)).min(data.len());

    while cur.pos < end {
        let Some(proto_len) = cur.u8() else { return };
        let Some(proto) = cur.take(usize::from(proto_len)) else { return };
        info.alpn.push(String::from_utf8_lossy(proto).into_owned());
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.buf.len() {
            return None;
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }
}
