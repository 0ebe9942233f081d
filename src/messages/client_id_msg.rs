use super::SwgMessage;
use crate::network::byte_buffer::{BufferError, ByteBuffer};

/// First message a client sends to the connection server: the session key
/// issued by the login server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdMsg {
    pub gamebits: u32,
    pub session_hash: String,
    pub version: String,
}

impl SwgMessage for ClientIdMsg {
    const OPCOUNT: u16 = 3;
    const OPCODE: u32 = 0xD589_9226;

    fn on_serialize(&self, buffer: &mut ByteBuffer) {
        buffer.write(self.gamebits);
        buffer.write(self.session_hash.len() as u32);
        buffer.write_bytes(self.session_hash.as_bytes());
        buffer.write_string(&self.version);
    }

    fn on_deserialize(buffer: &mut ByteBuffer) -> Result<Self, BufferError> {
        let gamebits = buffer.read::<u32>()?;
        let key_len = buffer.read::<u32>()? as usize;
        let key = buffer.read_bytes(key_len)?;
        let session_hash = String::from_utf8(key.to_vec())
            .map_err(|_| BufferError::InvalidString { len: key_len })?;
        let version = buffer.read_string()?;
        Ok(Self {
            gamebits,
            session_hash,
            version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_msg_layout() {
        let msg = ClientIdMsg {
            gamebits: 0,
            session_hash: "abc".into(),
            version: "20050408-18:00".into(),
        };
        let buffer = msg.serialize();
        let raw = buffer.data();
        assert_eq!(&raw[..2], &[0x03, 0x00]);
        assert_eq!(&raw[2..6], &0xD589_9226u32.to_le_bytes());
        assert_eq!(&raw[10..14], &[0x03, 0x00, 0x00, 0x00]);
        assert_eq!(&raw[14..17], b"abc");

        assert_eq!(ClientIdMsg::deserialize(buffer).unwrap(), msg);
    }

    #[test]
    fn test_client_id_msg_key_length_past_end() {
        let mut buffer = ByteBuffer::new();
        buffer.write(ClientIdMsg::OPCOUNT);
        buffer.write(ClientIdMsg::OPCODE);
        buffer.write(0u32);
        buffer.write(500u32);
        buffer.write_bytes(b"short");
        assert!(matches!(
            ClientIdMsg::deserialize(buffer),
            Err(BufferError::Underflow { requested: 500, .. })
        ));
    }
}
