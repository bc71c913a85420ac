//! RTP frame view for the media-encryption path.
//!
//! RTP header format (RFC 3550):
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The encryption layer needs a *mutable* view: the payload region is
//! rewritten in place (and resized — padded ciphertext is longer than
//! the plaintext), the padding bit is flipped to signal PKCS padding
//! on the wire, and the 6 bytes starting at the sequence-number field
//! seed the per-frame IV.

use anyhow::{bail, Result};

/// Minimum RTP header size in bytes (no CSRC, no extension).
pub const RTP_HEADER_SIZE: usize = 12;

/// Length of the IV seed region: sequence number + timestamp.
const IV_SEED_LEN: usize = 6;

/// Compute the full RTP header length from raw packet bytes.
///
/// Accounts for CSRC entries and header extensions (RFC 3550 §5.3.1).
/// Returns `None` if the packet is too short.
pub fn full_header_len(data: &[u8]) -> Option<usize> {
    if data.len() < RTP_HEADER_SIZE {
        return None;
    }
    let csrc_count = (data[0] & 0x0F) as usize;
    let has_extension = (data[0] >> 4) & 0x01 != 0;
    let mut len = RTP_HEADER_SIZE + csrc_count * 4;
    if data.len() < len {
        return None;
    }
    if has_extension {
        // Extension header: 2 bytes profile + 2 bytes length (in 32-bit words)
        if data.len() < len + 4 {
            return None;
        }
        let ext_words = u16::from_be_bytes([data[len + 2], data[len + 3]]) as usize;
        len += 4 + ext_words * 4;
        if data.len() < len {
            return None;
        }
    }
    Some(len)
}

/// An owned RTP packet with mutable payload access.
#[derive(Debug, Clone)]
pub struct RtpFrame {
    data: Vec<u8>,
    header_len: usize,
}

impl RtpFrame {
    /// Build a frame with a minimal fixed header.
    pub fn new(payload_type: u8, seq: u16, timestamp: u32, ssrc: u32, payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(RTP_HEADER_SIZE + payload.len());

        // Byte 0: V=2, P=0, X=0, CC=0 -> 0x80
        data.push(0x80);
        // Byte 1: M=0, PT
        data.push(payload_type & 0x7F);
        data.extend_from_slice(&seq.to_be_bytes());
        data.extend_from_slice(&timestamp.to_be_bytes());
        data.extend_from_slice(&ssrc.to_be_bytes());
        data.extend_from_slice(payload);

        Self {
            data,
            header_len: RTP_HEADER_SIZE,
        }
    }

    /// Adopt raw packet bytes, validating version and header length.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() < RTP_HEADER_SIZE {
            bail!("RTP packet too short: {} bytes", data.len());
        }
        let version = (data[0] >> 6) & 0x03;
        if version != 2 {
            bail!("Unsupported RTP version: {}", version);
        }
        let Some(header_len) = full_header_len(&data) else {
            bail!("RTP packet truncated inside the header");
        };
        Ok(Self { data, header_len })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn sequence_number(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    /// The RTP padding bit.
    pub fn padding(&self) -> bool {
        self.data[0] & 0x20 != 0
    }

    pub fn set_padding(&mut self, on: bool) {
        if on {
            self.data[0] |= 0x20;
        } else {
            self.data[0] &= !0x20;
        }
    }

    /// The 6 bytes starting at the sequence-number field, in wire
    /// order: `seq_hi, seq_lo, ts_0, ts_1, ts_2, ts_3`.
    pub fn iv_seed(&self) -> [u8; IV_SEED_LEN] {
        let mut seed = [0u8; IV_SEED_LEN];
        seed.copy_from_slice(&self.data[2..2 + IV_SEED_LEN]);
        seed
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.header_len..]
    }

    /// Replace the payload region, growing or shrinking the packet.
    pub fn set_payload(&mut self, payload: &[u8]) {
        self.data.truncate(self.header_len);
        self.data.extend_from_slice(payload);
    }
}
