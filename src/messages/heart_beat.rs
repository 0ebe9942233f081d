use super::SwgMessage;
use crate::network::byte_buffer::{BufferError, ByteBuffer};

/// Client keepalive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartBeat;

impl SwgMessage for HeartBeat {
    const OPCOUNT: u16 = 1;
    const OPCODE: u32 = 0xA16C_F9AF;

    fn on_serialize(&self, _buffer: &mut ByteBuffer) {}

    fn on_deserialize(_buffer: &mut ByteBuffer) -> Result<Self, BufferError> {
        Ok(Self)
    }
}
