//! SWG application messages
//!
//! Every message travels as `[u16 opcount][u32 opcode][body]`, little-endian.
//! The opcode is the dispatch id.

mod client_id_msg;
mod client_permissions_message;
mod cmd_scene_ready;
mod heart_beat;

pub use client_id_msg::ClientIdMsg;
pub use client_permissions_message::ClientPermissionsMessage;
pub use cmd_scene_ready::CmdSceneReady;
pub use heart_beat::HeartBeat;

use crate::network::byte_buffer::{BufferError, ByteBuffer};

/// Bytes taken by the opcount + opcode header.
pub const MESSAGE_HEADER_LEN: usize = 6;

/// A typed application message.
pub trait SwgMessage: Sized + Send + 'static {
    const OPCOUNT: u16;
    const OPCODE: u32;

    fn on_serialize(&self, buffer: &mut ByteBuffer);

    /// Parse the body; the header has already been consumed.
    fn on_deserialize(buffer: &mut ByteBuffer) -> Result<Self, BufferError>;

    fn serialize(&self) -> ByteBuffer {
        let mut buffer = ByteBuffer::with_capacity(MESSAGE_HEADER_LEN + 16);
        buffer.write(Self::OPCOUNT);
        buffer.write(Self::OPCODE);
        self.on_serialize(&mut buffer);
        buffer
    }

    /// Parse a complete message including its header.
    fn deserialize(mut buffer: ByteBuffer) -> Result<Self, BufferError> {
        read_header(&mut buffer)?;
        Self::on_deserialize(&mut buffer)
    }
}

/// Consume the message header, returning `(opcount, opcode)`.
pub fn read_header(buffer: &mut ByteBuffer) -> Result<(u16, u32), BufferError> {
    let opcount = buffer.read::<u16>()?;
    let opcode = buffer.read::<u32>()?;
    Ok((opcount, opcode))
}
