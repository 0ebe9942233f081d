use super::SwgMessage;
use crate::network::byte_buffer::{BufferError, ByteBuffer};

/// Client finished loading the zone; the server echoes it back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CmdSceneReady;

impl SwgMessage for CmdSceneReady {
    const OPCOUNT: u16 = 1;
    const OPCODE: u32 = 0x43FD_1C22;

    fn on_serialize(&self, _buffer: &mut ByteBuffer) {}

    fn on_deserialize(_buffer: &mut ByteBuffer) -> Result<Self, BufferError> {
        Ok(Self)
    }
}
