//! pcap capture encoding
//!
//! Byte-level encoders for the classic pcap format: a global header (magic
//! 0xA1B2C3D4, version 2.4, snaplen 65535, linktype 101 = raw IP) followed
//! by per-packet records. The engine exposes captured raw frames through an
//! optional tap; whether and where the records are written is the caller's
//! concern, not this crate's.

use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

pub const MAGIC: u32 = 0xA1B2_C3D4;
pub const VERSION_MAJOR: u16 = 2;
pub const VERSION_MINOR: u16 = 4;
pub const SNAPLEN: u32 = 65535;
/// LINKTYPE_RAW: packets begin with the IP header
pub const LINKTYPE_RAW_IP: u32 = 101;

/// One raw IP datagram as read from or written to the tun device
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub timestamp: SystemTime,
    pub data: Vec<u8>,
}

/// Sender half of the engine's frame tap
pub type FrameSender = mpsc::UnboundedSender<CapturedFrame>;
/// Receiver half kept by the caller's writer
pub type FrameReceiver = mpsc::UnboundedReceiver<CapturedFrame>;

/// Create a frame tap channel pair.
pub fn frame_tap() -> (FrameSender, FrameReceiver) {
    mpsc::unbounded_channel()
}

/// The 24-byte pcap global header.
pub fn file_header() -> [u8; 24] {
    let mut header = [0u8; 24];
    header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    header[4..6].copy_from_slice(&VERSION_MAJOR.to_le_bytes());
    header[6..8].copy_from_slice(&VERSION_MINOR.to_le_bytes());
    // thiszone and sigfigs stay zero
    header[16..20].copy_from_slice(&SNAPLEN.to_le_bytes());
    header[20..24].copy_from_slice(&LINKTYPE_RAW_IP.to_le_bytes());
    header
}

/// A per-packet record: ts_sec, ts_usec, caplen, origlen, then the bytes
/// truncated to the snap length.
pub fn packet_record(frame: &CapturedFrame) -> Vec<u8> {
    let elapsed = frame
        .timestamp
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let caplen = frame.data.len().min(SNAPLEN as usize);

    let mut record = Vec::with_capacity(16 + caplen);
    record.extend_from_slice(&(elapsed.as_secs() as u32).to_le_bytes());
    record.extend_from_slice(&elapsed.subsec_micros().to_le_bytes());
    record.extend_from_slice(&(caplen as u32).to_le_bytes());
    record.extend_from_slice(&(frame.data.len() as u32).to_le_bytes());
    record.extend_from_slice(&frame.data[..caplen]);
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_file_header_layout() {
        let header = file_header();
        assert_eq!(&header[0..4], &[0xD4, 0xC3, 0xB2, 0xA1]); // LE magic
        assert_eq!(u16::from_le_bytes([header[4], header[5]]), 2);
        assert_eq!(u16::from_le_bytes([header[6], header[7]]), 4);
        assert_eq!(
            u32::from_le_bytes([header[16], header[17], header[18], header[19]]),
            65535
        );
        assert_eq!(
            u32::from_le_bytes([header[20], header[21], header[22], header[23]]),
            101
        );
    }

    #[test]
    fn test_packet_record_layout() {
        let frame = CapturedFrame {
            timestamp: UNIX_EPOCH + Duration::new(1_000, 250_000_000),
            data: vec![0x45, 0x00, 0x00, 0x14],
        };
        let record = packet_record(&frame);

        assert_eq!(u32::from_le_bytes(record[0..4].try_into().unwrap()), 1_000);
        assert_eq!(
            u32::from_le_bytes(record[4..8].try_into().unwrap()),
            250_000
        );
        assert_eq!(u32::from_le_bytes(record[8..12].try_into().unwrap()), 4);
        assert_eq!(u32::from_le_bytes(record[12..16].try_into().unwrap()), 4);
        assert_eq!(&record[16..], &frame.data[..]);
    }

    #[test]
    fn test_packet_record_truncates_to_snaplen() {
        let frame = CapturedFrame {
            timestamp: UNIX_EPOCH,
            data: vec![0u8; SNAPLEN as usize + 100],
        };
        let record = packet_record(&frame);

        let caplen = u32::from_le_bytes(record[8..12].try_into().unwrap());
        let origlen = u32::from_le_bytes(record[12..16].try_into().unwrap());
        assert_eq!(caplen, SNAPLEN);
        assert_eq!(origlen, SNAPLEN + 100);
        assert_eq!(record.len(), 16 + SNAPLEN as usize);
    }
}
