//! CRC-32 checksums used by the SOE transport.
//!
//! `memcrc` is the MSB-first variant used for endpoint hashes and message
//! name hashes. `memcrc_seeded` is the reflected IEEE variant keyed by the
//! per-session seed, used for packet footers.

const MSB_POLYNOMIAL: u32 = 0x04C1_1DB7;
const REFLECTED_POLYNOMIAL: u32 = 0xEDB8_8320;

const MSB_TABLE: [u32; 256] = build_msb_table();
const REFLECTED_TABLE: [u32; 256] = build_reflected_table();

const fn build_msb_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ MSB_POLYNOMIAL
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn build_reflected_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ REFLECTED_POLYNOMIAL
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// MSB-first CRC-32 of `data`.
pub fn memcrc(data: impl AsRef<[u8]>) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data.as_ref() {
        crc = MSB_TABLE[(((crc >> 24) as u8) ^ byte) as usize] ^ (crc << 8);
    }
    !crc
}

fn reflected_step(crc: u32, byte: u8) -> u32 {
    REFLECTED_TABLE[((crc as u8) ^ byte) as usize] ^ (crc >> 8)
}

/// Reflected CRC-32 of `data`, primed with the little-endian bytes of `seed`.
pub fn memcrc_seeded(data: &[u8], seed: u32) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for byte in seed.to_le_bytes() {
        crc = reflected_step(crc, byte);
    }
    for &byte in data {
        crc = reflected_step(crc, byte);
    }
    !crc
}
