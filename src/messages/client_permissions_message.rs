use super::SwgMessage;
use crate::network::byte_buffer::{BufferError, ByteBuffer};

/// Sent once a ClientIdMsg has been accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientPermissionsMessage {
    pub galaxy_available: u8,
    pub available_character_slots: u8,
    pub unlimited_characters: u8,
}

impl SwgMessage for ClientPermissionsMessage {
    const OPCOUNT: u16 = 4;
    const OPCODE: u32 = 0xE007_30E5;

    fn on_serialize(&self, buffer: &mut ByteBuffer) {
        buffer.write(self.galaxy_available);
        buffer.write(self.available_character_slots);
        buffer.write(self.unlimited_characters);
    }

    fn on_deserialize(buffer: &mut ByteBuffer) -> Result<Self, BufferError> {
        Ok(Self {
            galaxy_available: buffer.read()?,
            available_character_slots: buffer.read()?,
            unlimited_characters: buffer.read()?,
        })
    }
}
