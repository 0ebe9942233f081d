//! Growable binary buffer with a read cursor
//!
//! Every wire structure in the server is built and parsed through
//! [`ByteBuffer`]. Writes append at the end, reads consume from the read
//! cursor. Integers default to little-endian (the client's native order);
//! protocol headers use the explicit `_be` forms.

use bytes::{BufMut, Bytes, BytesMut};

/// Errors raised while parsing a buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("Buffer underflow: requested={requested}, available={available}")]
    Underflow { requested: usize, available: usize },

    #[error("Invalid string: {len} bytes are not valid UTF-8")]
    InvalidString { len: usize },

    #[error("Invalid wide string: {len} code units are not valid UTF-16")]
    InvalidWideString { len: usize },
}

/// Fixed-width values that can be written to and read from a [`ByteBuffer`].
pub trait Primitive: Copy + Sized {
    const SIZE: usize;

    fn put_le(self, out: &mut BytesMut);
    fn put_be(self, out: &mut BytesMut);
    /// `bytes` is exactly `SIZE` long.
    fn from_le(bytes: &[u8]) -> Self;
    /// `bytes` is exactly `SIZE` long.
    fn from_be(bytes: &[u8]) -> Self;
}

macro_rules! impl_primitive {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Primitive for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn put_le(self, out: &mut BytesMut) {
                    out.put_slice(&self.to_le_bytes());
                }

                #[inline]
                fn put_be(self, out: &mut BytesMut) {
                    out.put_slice(&self.to_be_bytes());
                }

                #[inline]
                fn from_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }

                #[inline]
                fn from_be(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_be_bytes(raw)
                }
            }
        )*
    };
}

impl_primitive!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Binary read/write cursor over a contiguous byte sequence.
///
/// Invariant: `read_position <= data.len()`. Everything before the read
/// cursor has been consumed; [`ByteBuffer::size`] is the unread remainder.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ByteBuffer {
    data: BytesMut,
    read_position: usize,
}

impl std::fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("read_position", &self.read_position)
            .field("unread", &hex::encode(self.data()))
            .finish()
    }
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            read_position: 0,
        }
    }

    /// Number of unread bytes (write position minus read position).
    pub fn size(&self) -> usize {
        self.data.len() - self.read_position
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Bytes consumed so far.
    pub fn read_position(&self) -> usize {
        self.read_position
    }

    /// Total bytes written.
    pub fn write_position(&self) -> usize {
        self.data.len()
    }

    /// The unread bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[self.read_position..]
    }

    /// Consume the buffer, returning only the unread bytes.
    pub fn into_bytes(mut self) -> Bytes {
        self.data.split_off(self.read_position).freeze()
    }

    // ── writes ──────────────────────────────────────────────────────────────

    /// Append `value` in little-endian order.
    pub fn write<T: Primitive>(&mut self, value: T) {
        value.put_le(&mut self.data);
    }

    /// Append `value` in big-endian (network) order.
    pub fn write_be<T: Primitive>(&mut self, value: T) {
        value.put_be(&mut self.data);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }

    /// Append a `u16` length-prefixed narrow string.
    ///
    /// Strings longer than `u16::MAX` bytes are truncated to fit the prefix.
    pub fn write_string(&mut self, value: &str) {
        let bytes = value.as_bytes();
        let len = bytes.len().min(u16::MAX as usize);
        self.write(len as u16);
        self.write_bytes(&bytes[..len]);
    }

    /// Append a wide string: `u32` code-unit count followed by UTF-16LE units.
    pub fn write_wide_string(&mut self, value: &str) {
        let units: Vec<u16> = value.encode_utf16().collect();
        self.write(units.len() as u32);
        for unit in units {
            self.write(unit);
        }
    }

    /// Move `other`'s unread bytes onto the end of this buffer.
    ///
    /// When this buffer is empty the storage is taken over without copying;
    /// otherwise `BytesMut::unsplit` avoids the copy when the two regions are
    /// contiguous.
    pub fn append(&mut self, mut other: ByteBuffer) {
        let tail = other.data.split_off(other.read_position);
        if self.data.is_empty() {
            self.data = tail;
            self.read_position = 0;
        } else {
            self.data.unsplit(tail);
        }
    }

    // ── reads ───────────────────────────────────────────────────────────────

    fn take(&mut self, len: usize) -> Result<&[u8], BufferError> {
        let available = self.size();
        if len > available {
            return Err(BufferError::Underflow {
                requested: len,
                available,
            });
        }
        let start = self.read_position;
        self.read_position += len;
        Ok(&self.data[start..start + len])
    }

    /// Consume a little-endian `T`.
    pub fn read<T: Primitive>(&mut self) -> Result<T, BufferError> {
        self.take(T::SIZE).map(T::from_le)
    }

    /// Consume a big-endian `T`.
    pub fn read_be<T: Primitive>(&mut self) -> Result<T, BufferError> {
        self.take(T::SIZE).map(T::from_be)
    }

    /// Read a big-endian `T` without consuming it.
    pub fn peek_be<T: Primitive>(&self) -> Result<T, BufferError> {
        let available = self.size();
        if T::SIZE > available {
            return Err(BufferError::Underflow {
                requested: T::SIZE,
                available,
            });
        }
        Ok(T::from_be(&self.data()[..T::SIZE]))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, BufferError> {
        self.take(len).map(Bytes::copy_from_slice)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), BufferError> {
        self.take(len).map(|_| ())
    }

    pub fn read_string(&mut self) -> Result<String, BufferError> {
        let len = self.read::<u16>()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| BufferError::InvalidString { len })
    }

    pub fn read_wide_string(&mut self) -> Result<String, BufferError> {
        let len = self.read::<u32>()? as usize;
        let bytes = self.take(len.saturating_mul(2))?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).map_err(|_| BufferError::InvalidWideString { len })
    }

    /// Consume everything that is left.
    pub fn read_remaining(&mut self) -> Bytes {
        let rest = Bytes::copy_from_slice(self.data());
        self.read_position = self.data.len();
        rest
    }
}

impl From<&[u8]> for ByteBuffer {
    fn from(bytes: &[u8]) -> Self {
        Self {
            data: BytesMut::from(bytes),
            read_position: 0,
        }
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            data: BytesMut::from(&bytes[..]),
            read_position: 0,
        }
    }
}

impl From<Bytes> for ByteBuffer {
    fn from(bytes: Bytes) -> Self {
        Self {
            data: BytesMut::from(&bytes[..]),
            read_position: 0,
        }
    }
}
