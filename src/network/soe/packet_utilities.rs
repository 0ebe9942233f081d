//! Stateless builders and splitters for SOE data-channel payloads.

use std::net::SocketAddr;

use super::{DATA_CHANNEL, FRAGMENTED_DATA_CHANNEL, MULTI_MESSAGE, SIZE_PREFIX_SENTINEL};
use crate::network::byte_buffer::{BufferError, ByteBuffer};
use crate::network::crc::memcrc;

/// Misuse of a packet utility.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// `[0x0009][sequence]`, both big-endian.
pub fn build_data_channel_header(sequence: u16) -> ByteBuffer {
    let mut header = ByteBuffer::with_capacity(4);
    header.write_be(DATA_CHANNEL);
    header.write_be(sequence);
    header
}

/// `[0x000D][sequence]`, both big-endian.
pub fn build_fragmented_data_channel_header(sequence: u16) -> ByteBuffer {
    let mut header = ByteBuffer::with_capacity(4);
    header.write_be(FRAGMENTED_DATA_CHANNEL);
    header.write_be(sequence);
    header
}

/// Bytes a size prefix for a message of `len` bytes occupies.
pub fn size_prefix_len(len: usize) -> usize {
    if len >= SIZE_PREFIX_SENTINEL as usize {
        3
    } else {
        1
    }
}

/// Write the 1-byte / `0xFF`+u16 size prefix shared by the multi-message and
/// multi-packet containers.
///
/// A length of exactly 255 takes the long form so the sentinel byte is never
/// a literal length.
pub fn write_size_prefix(buffer: &mut ByteBuffer, len: usize) -> Result<(), PacketError> {
    if len >= SIZE_PREFIX_SENTINEL as usize {
        let len = u16::try_from(len).map_err(|_| {
            PacketError::InvalidArgument(format!("message of {} bytes exceeds a u16 size prefix", len))
        })?;
        buffer.write(SIZE_PREFIX_SENTINEL);
        buffer.write_be(len);
    } else {
        buffer.write(len as u8);
    }
    Ok(())
}

pub fn read_size_prefix(buffer: &mut ByteBuffer) -> Result<usize, BufferError> {
    let short = buffer.read::<u8>()?;
    if short == SIZE_PREFIX_SENTINEL {
        Ok(buffer.read_be::<u16>()? as usize)
    } else {
        Ok(short as usize)
    }
}

/// Pack application messages into one data-channel payload.
///
/// A single message is returned as-is. Otherwise the result is `0x0019`
/// followed by each message behind its size prefix.
pub fn pack_data_channel_messages(mut messages: Vec<ByteBuffer>) -> Result<ByteBuffer, PacketError> {
    if messages.len() == 1 {
        return Ok(messages.remove(0));
    }

    let total: usize = messages.iter().map(|m| size_prefix_len(m.size()) + m.size()).sum();
    let mut output = ByteBuffer::with_capacity(2 + total);
    output.write_be(MULTI_MESSAGE);

    for message in messages {
        write_size_prefix(&mut output, message.size())?;
        output.append(message);
    }

    Ok(output)
}

/// Inverse of [`pack_data_channel_messages`].
///
/// A payload that does not start with `0x0019` is a single message. Every
/// application message starts with a little-endian opcount, so a leading
/// `0x00 0x19` never occurs in an unpacked message.
pub fn unpack_data_channel_messages(mut payload: ByteBuffer) -> Result<Vec<ByteBuffer>, BufferError> {
    if payload.size() < 2 || payload.peek_be::<u16>()? != MULTI_MESSAGE {
        return Ok(vec![payload]);
    }
    payload.skip(2)?;

    let mut messages = Vec::new();
    while !payload.is_empty() {
        let len = read_size_prefix(&mut payload)?;
        messages.push(ByteBuffer::from(payload.read_bytes(len)?));
    }
    Ok(messages)
}

/// Split an oversized message into fragments of at most `max_size` bytes.
///
/// Fragment 0 begins with the big-endian u32 total message size and carries
/// `max_size - 4` payload bytes; later fragments carry payload only. The
/// fragments hold `message.size() + 4` bytes in total.
pub fn split_data_channel_message(message: ByteBuffer, max_size: u32) -> Result<Vec<ByteBuffer>, PacketError> {
    let message_size = message.size();
    let max_size = max_size as usize;

    if message_size <= max_size {
        return Err(PacketError::InvalidArgument(format!(
            "message of {} bytes does not exceed max size {}",
            message_size, max_size
        )));
    }
    if max_size <= 4 {
        return Err(PacketError::InvalidArgument(format!(
            "max size {} leaves no room for the fragment size prefix",
            max_size
        )));
    }
    let total = u32::try_from(message_size).map_err(|_| {
        PacketError::InvalidArgument(format!("message of {} bytes exceeds a u32 size prefix", message_size))
    })?;

    let data = message.data();
    let mut fragments = Vec::with_capacity(message_size / max_size + 2);
    let mut offset = 0usize;

    while offset < message_size {
        let mut fragment = ByteBuffer::with_capacity(max_size);
        let mut chunk = (message_size - offset).min(max_size);

        if offset == 0 {
            chunk -= 4;
            fragment.write_be(total);
        }

        fragment.write_bytes(&data[offset..offset + chunk]);
        fragments.push(fragment);
        offset += chunk;
    }

    Ok(fragments)
}

/// Checksum of `"<address>:<port>"`.
///
/// Suitable for logs and compact keys only; identity is the endpoint itself.
pub fn create_endpoint_hash(endpoint: &SocketAddr) -> u32 {
    memcrc(format!("{}:{}", endpoint.ip(), endpoint.port()))
}
