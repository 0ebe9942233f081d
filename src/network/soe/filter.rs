//! Per-session packet filter: optional zlib compression and a seeded CRC footer.
//!
//! Outbound layout: `[opcode][body][compressed flag?][crc footer?]`. The
//! flag byte is present only when compression is negotiated; the footer is
//! the low `crc_length` bytes of the seeded CRC, big-endian.

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::network::crc::memcrc_seeded;

/// Largest body inflate will produce; guards against zlib bombs.
const MAX_DECOMPRESSED_SIZE: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("Packet too short: len={len}, need at least {needed}")]
    TooShort { len: usize, needed: usize },

    #[error("CRC mismatch: expected={expected:#x}, actual={actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Decompression failed")]
    Decompression,
}

/// Negotiated filter parameters. The default is a pass-through filter,
/// which is what a session uses until its handshake completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterParams {
    pub crc_seed: u32,
    pub crc_length: u8,
    pub compression: bool,
    pub compression_threshold: usize,
}

impl FilterParams {
    /// Bytes the filter adds to every packet at most.
    pub fn overhead(&self) -> usize {
        self.crc_length as usize + usize::from(self.compression)
    }

    fn crc_footer(&self, packet: &[u8]) -> u32 {
        let crc = memcrc_seeded(packet, self.crc_seed);
        match self.crc_length {
            0 => 0,
            len if len >= 4 => crc,
            len => crc & ((1u32 << (len as u32 * 8)) - 1),
        }
    }
}

fn deflate(body: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(body.len()), Compression::default());
    encoder.write_all(body).ok()?;
    encoder.finish().ok()
}

/// Inflate `body`, rejecting anything that expands past the cap.
fn inflate(body: &[u8]) -> Result<Vec<u8>, FilterError> {
    let mut out = Vec::with_capacity(body.len() * 2);
    ZlibDecoder::new(body)
        .take(MAX_DECOMPRESSED_SIZE + 1)
        .read_to_end(&mut out)
        .map_err(|_| FilterError::Decompression)?;
    if out.len() as u64 > MAX_DECOMPRESSED_SIZE {
        return Err(FilterError::Decompression);
    }
    Ok(out)
}

/// Apply compression and the CRC footer to an outbound packet.
pub fn encode(packet: &[u8], params: &FilterParams) -> Bytes {
    let mut out = BytesMut::with_capacity(packet.len() + params.overhead());

    if params.compression && packet.len() > 2 {
        let (opcode, body) = packet.split_at(2);
        out.put_slice(opcode);

        let compressed = if body.len() >= params.compression_threshold {
            deflate(body).filter(|c| c.len() < body.len())
        } else {
            None
        };

        match compressed {
            Some(compressed) => {
                out.put_slice(&compressed);
                out.put_u8(1);
            }
            None => {
                out.put_slice(body);
                out.put_u8(0);
            }
        }
    } else {
        out.put_slice(packet);
    }

    if params.crc_length > 0 {
        let footer = params.crc_footer(&out).to_be_bytes();
        let len = (params.crc_length as usize).min(4);
        out.put_slice(&footer[4 - len..]);
    }

    out.freeze()
}

/// Verify the CRC footer and undo compression.
pub fn decode(packet: &[u8], params: &FilterParams) -> Result<Bytes, FilterError> {
    let crc_length = (params.crc_length as usize).min(4);
    let needed = 2 + crc_length;
    if packet.len() < needed {
        return Err(FilterError::TooShort { len: packet.len(), needed });
    }

    let (packet, footer) = packet.split_at(packet.len() - crc_length);
    if crc_length > 0 {
        let actual = footer.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32);
        let expected = params.crc_footer(packet);
        if expected != actual {
            return Err(FilterError::CrcMismatch { expected, actual });
        }
    }

    if !params.compression || packet.len() == 2 {
        return Ok(Bytes::copy_from_slice(packet));
    }

    let (opcode, rest) = packet.split_at(2);
    let Some((&flag, body)) = rest.split_last() else {
        return Ok(Bytes::copy_from_slice(opcode));
    };

    let mut out = BytesMut::with_capacity(packet.len() * 2);
    out.put_slice(opcode);
    if flag == 1 {
        out.put_slice(&inflate(body)?);
    } else {
        out.put_slice(body);
    }
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(crc_length: u8, compression: bool) -> FilterParams {
        FilterParams {
            crc_seed: 0xDEAD_BEEF,
            crc_length,
            compression,
            compression_threshold: 16,
        }
    }

    #[test]
    fn test_passthrough_without_negotiation() {
        let packet = [0x00, 0x09, 0x00, 0x01, 0xAA];
        let encoded = encode(&packet, &FilterParams::default());
        assert_eq!(&encoded[..], &packet);
        assert_eq!(&decode(&encoded, &FilterParams::default()).unwrap()[..], &packet);
    }

    #[test]
    fn test_crc_footer_is_appended_and_checked() {
        let p = params(2, false);
        let packet = [0x00, 0x06];
        let encoded = encode(&packet, &p);
        assert_eq!(encoded.len(), 4);
        assert_eq!(&decode(&encoded, &p).unwrap()[..], &packet);

        let mut corrupted = encoded.to_vec();
        corrupted[3] ^= 0xFF;
        assert!(matches!(decode(&corrupted, &p), Err(FilterError::CrcMismatch { .. })));
    }

    #[test]
    fn test_small_body_is_flagged_uncompressed() {
        let p = params(0, true);
        let packet = [0x00, 0x15, 0x00, 0x03];
        let encoded = encode(&packet, &p);
        assert_eq!(&encoded[..], &[0x00, 0x15, 0x00, 0x03, 0x00]);
        assert_eq!(&decode(&encoded, &p).unwrap()[..], &packet);
    }

    #[test]
    fn test_compressible_body_round_trips() {
        let p = params(2, true);
        let mut packet = vec![0x00, 0x09, 0x00, 0x00];
        packet.extend(std::iter::repeat(0x41).take(400));

        let encoded = encode(&packet, &p);
        assert!(encoded.len() < packet.len());
        assert_eq!(encoded[encoded.len() - 3], 1);
        assert_eq!(&decode(&encoded, &p).unwrap()[..], &packet[..]);
    }

    #[test]
    fn test_truncated_packet_rejected() {
        assert!(matches!(
            decode(&[0x00], &params(2, false)),
            Err(FilterError::TooShort { .. })
        ));
    }

    #[test]
    fn test_garbage_compressed_body_rejected() {
        let p = params(0, true);
        let packet = [0x00, 0x09, 0x12, 0x34, 0x56, 0x01];
        assert_eq!(decode(&packet, &p), Err(FilterError::Decompression));
    }

    #[test]
    fn test_oversized_inflate_rejected() {
        let p = params(2, true);
        let mut packet = vec![0x00, 0x09, 0x00, 0x00];
        packet.extend(std::iter::repeat(0x41).take(100_000));

        let encoded = encode(&packet, &p);
        assert!(encoded.len() < 1024);
        assert_eq!(decode(&encoded, &p), Err(FilterError::Decompression));
    }

    #[test]
    fn test_inflate_at_cap_accepted() {
        let p = params(0, true);
        let mut packet = vec![0x00, 0x09];
        packet.extend(std::iter::repeat(0x42).take(MAX_DECOMPRESSED_SIZE as usize));

        let decoded = decode(&encode(&packet, &p), &p).unwrap();
        assert_eq!(decoded.len(), packet.len());
    }
}
