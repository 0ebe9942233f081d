//! Network layer: binary buffers, checksums, the SOE transport and the
//! application message dispatch registry.

pub mod byte_buffer;
pub mod crc;
pub mod dispatch;
pub mod soe;
