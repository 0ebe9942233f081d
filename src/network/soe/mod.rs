//! SOE reliable UDP transport
//!
//! Sessions are keyed by remote endpoint. Each session runs its own
//! handshake, sequencing, acknowledgement and fragment reassembly; the
//! [`server::SoeServer`] feeds it datagrams, drives its timers and hands
//! the reassembled application messages to the dispatch registry.

pub mod filter;
pub mod packet_utilities;
pub mod server;
pub mod session;
pub mod session_table;

// SOE packet opcodes (big-endian u16 at the start of every packet)
pub const SESSION_REQUEST: u16 = 0x0001;
pub const SESSION_RESPONSE: u16 = 0x0002;
pub const MULTI_PACKET: u16 = 0x0003;
pub const DISCONNECT: u16 = 0x0005;
pub const PING: u16 = 0x0006;
pub const DATA_CHANNEL: u16 = 0x0009;
pub const FRAGMENTED_DATA_CHANNEL: u16 = 0x000D;
pub const OUT_OF_ORDER: u16 = 0x0011;
pub const ACKNOWLEDGEMENT: u16 = 0x0015;

/// Leading pair of a data-channel payload that packs several messages.
pub const MULTI_MESSAGE: u16 = 0x0019;

/// Short size prefixes run 0..=254; this byte announces a u16 length.
pub const SIZE_PREFIX_SENTINEL: u8 = 0xFF;

/// Sequenced packet header: opcode + sequence.
pub const DATA_CHANNEL_HEADER_LEN: usize = 4;

/// Reason code carried by a Disconnect packet.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    None = 0,
    Timeout = 2,
    OtherSideTerminated = 3,
    Application = 6,
    UnacknowledgedTimeout = 8,
    NewConnectionAttempt = 9,
    ProtocolViolation = 11,
}

pub use packet_utilities::{
    build_data_channel_header, build_fragmented_data_channel_header, create_endpoint_hash,
    pack_data_channel_messages, split_data_channel_message, unpack_data_channel_messages, PacketError,
};
pub use server::{SessionListener, SoeServer};
pub use session::{Datagram, Session, SessionError, SessionState};
pub use session_table::SessionTable;
