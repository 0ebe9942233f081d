//! Per-endpoint SOE session: handshake, sequencing, acknowledgement,
//! fragment reassembly and outbound packing.
//!
//! All mutable protocol state (sequence counters, resend queue, reassembly
//! buffers) lives behind one per-session mutex; every mutation goes through
//! it, so the counters are plain integers. The lock is never held across an
//! `.await` and never while calling into the dispatch layer.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::filter::{self, FilterParams};
use super::packet_utilities::{
    build_data_channel_header, build_fragmented_data_channel_header, pack_data_channel_messages,
    read_size_prefix, size_prefix_len, split_data_channel_message, unpack_data_channel_messages,
};
use super::{
    DisconnectReason, ACKNOWLEDGEMENT, DATA_CHANNEL, DATA_CHANNEL_HEADER_LEN, DISCONNECT,
    FRAGMENTED_DATA_CHANNEL, MULTI_PACKET, OUT_OF_ORDER, PING, SESSION_REQUEST, SESSION_RESPONSE,
};
use crate::config::ProtocolConfig;
use crate::messages::SwgMessage;
use crate::network::byte_buffer::ByteBuffer;

/// Size of the CRC seed announced in SessionResponse.
const CRC_SEED_SIZE: u8 = 4;

/// Upper bound on the buffer reserved from a peer-supplied fragment total.
const MAX_REASSEMBLY_PREALLOC: usize = 64 * 1024;

/// Error types for session operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Maximum sessions exceeded (limit: {limit})")]
    MaxSessionsExceeded { limit: usize },

    #[error("Protocol violation from {endpoint}: {reason}")]
    ProtocolViolation { endpoint: SocketAddr, reason: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Server is already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Handshaking,
    Connected,
    Disconnecting,
    Closed,
}

/// One outbound UDP datagram, already filtered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub endpoint: SocketAddr,
    pub data: Bytes,
}

/// Outcome of a maintenance tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionUpdate {
    Alive,
    TimedOut,
    ResendExhausted,
    Disconnecting,
    Closed,
}

/// `(connection_id, max_udp_size)` of a SessionRequest, opcode included.
fn parse_session_request(packet: &[u8]) -> Option<(u32, u32)> {
    let mut buffer = ByteBuffer::from(packet);
    if buffer.read_be::<u16>().ok()? != SESSION_REQUEST {
        return None;
    }
    let _crc_length = buffer.read_be::<u32>().ok()?;
    let connection_id = buffer.read_be::<u32>().ok()?;
    let max_udp_size = buffer.read_be::<u32>().ok()?;
    Some((connection_id, max_udp_size))
}

/// Signed distance from `from` to `to` in u16 sequence space.
pub fn sequence_distance(from: u16, to: u16) -> i16 {
    to.wrapping_sub(from) as i16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelKind {
    Data,
    Fragment,
}

struct SentPacket {
    sequence: u16,
    /// Framed but unfiltered; the filter runs on every (re)send.
    data: Bytes,
    sent_at: Instant,
    resend_count: u32,
}

struct FragmentAssembly {
    total: usize,
    data: BytesMut,
}

struct SessionInner {
    state: SessionState,
    connection_id: u32,
    filter: FilterParams,
    max_udp_size: u32,

    next_client_sequence: u16,
    next_server_sequence: u16,
    out_of_order: HashMap<u16, (ChannelKind, Bytes)>,
    fragment: Option<FragmentAssembly>,

    outgoing_messages: VecDeque<ByteBuffer>,
    /// Fragments of a split message still waiting for window space.
    pending_fragments: VecDeque<ByteBuffer>,
    sent_unacked: VecDeque<SentPacket>,

    last_activity: Instant,
}

/// Stateful record of one peer's reliable connection.
pub struct Session {
    endpoint: SocketAddr,
    endpoint_hash: u32,
    config: ProtocolConfig,
    outbound: mpsc::UnboundedSender<Datagram>,
    /// Kept outside the state mutex so the session table can scan it
    /// without taking per-session locks.
    player_id: AtomicU64,
    account_id: AtomicU32,
    closing: AtomicBool,
    removing: AtomicBool,
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("player_id", &self.player_id())
            .finish()
    }
}

impl Session {
    pub fn new(
        endpoint: SocketAddr,
        config: ProtocolConfig,
        outbound: mpsc::UnboundedSender<Datagram>,
    ) -> Self {
        let max_udp_size = config.max_udp_size;
        Self {
            endpoint,
            endpoint_hash: super::create_endpoint_hash(&endpoint),
            config,
            outbound,
            player_id: AtomicU64::new(0),
            account_id: AtomicU32::new(0),
            closing: AtomicBool::new(false),
            removing: AtomicBool::new(false),
            inner: Mutex::new(SessionInner {
                state: SessionState::Uninitialized,
                connection_id: 0,
                filter: FilterParams::default(),
                max_udp_size,
                next_client_sequence: 0,
                next_server_sequence: 0,
                out_of_order: HashMap::new(),
                fragment: None,
                outgoing_messages: VecDeque::new(),
                pending_fragments: VecDeque::new(),
                sent_unacked: VecDeque::new(),
                last_activity: Instant::now(),
            }),
        }
    }

    // ── accessors ───────────────────────────────────────────────────────────

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn endpoint_hash(&self) -> u32 {
        self.endpoint_hash
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn connection_id(&self) -> u32 {
        self.inner.lock().connection_id
    }

    pub fn player_id(&self) -> u64 {
        self.player_id.load(Ordering::Acquire)
    }

    pub fn account_id(&self) -> u32 {
        self.account_id.load(Ordering::Acquire)
    }

    /// True once the session has started shutting down. Lock-free.
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// True if `packet` is a SessionRequest opening a different connection
    /// than the one this session already negotiated.
    pub fn is_superseded_by(&self, packet: &[u8]) -> bool {
        let Some((connection_id, _)) = parse_session_request(packet) else {
            return false;
        };
        let inner = self.inner.lock();
        inner.filter != FilterParams::default() && inner.connection_id != connection_id
    }

    pub fn last_activity(&self) -> Instant {
        self.inner.lock().last_activity
    }

    /// Packets sent and not yet acknowledged.
    pub fn unacknowledged(&self) -> usize {
        self.inner.lock().sent_unacked.len()
    }

    /// Application messages waiting for the next flush.
    pub fn queued_messages(&self) -> usize {
        self.inner.lock().outgoing_messages.len()
    }

    // ── lifecycle ───────────────────────────────────────────────────────────

    /// Promote to `Connected` after the login handshake was validated.
    pub fn connect(&self, account_id: u32, player_id: u64) -> bool {
        let mut inner = self.inner.lock();
        if matches!(inner.state, SessionState::Disconnecting | SessionState::Closed) {
            return false;
        }
        self.account_id.store(account_id, Ordering::Release);
        self.player_id.store(player_id, Ordering::Release);
        inner.state = SessionState::Connected;
        tracing::info!(
            "[soe] [session_connected] endpoint={} account_id={} player_id={}",
            self.endpoint,
            account_id,
            player_id
        );
        true
    }

    /// Send a Disconnect to the peer and move to `Disconnecting`.
    ///
    /// Returns false if the session was already shutting down.
    pub fn close(&self, reason: DisconnectReason) -> bool {
        let mut inner = self.inner.lock();
        if matches!(inner.state, SessionState::Disconnecting | SessionState::Closed) {
            return false;
        }

        let mut packet = ByteBuffer::with_capacity(8);
        packet.write_be(DISCONNECT);
        packet.write_be(inner.connection_id);
        packet.write_be(reason as u16);
        self.transmit(&inner, packet.data());

        self.enter_disconnecting(&mut inner);
        tracing::info!(
            "[soe] [session_closing] endpoint={} reason={:?}",
            self.endpoint,
            reason
        );
        true
    }

    /// Claim the right to run removal; true for exactly one caller.
    pub(crate) fn begin_removal(&self) -> bool {
        !self.removing.swap(true, Ordering::AcqRel)
    }

    fn enter_disconnecting(&self, inner: &mut SessionInner) {
        inner.state = SessionState::Disconnecting;
        inner.outgoing_messages.clear();
        inner.pending_fragments.clear();
        inner.sent_unacked.clear();
        self.closing.store(true, Ordering::Release);
    }

    /// Final state once the owning table has dropped the session.
    pub(crate) fn mark_closed(&self) {
        let mut inner = self.inner.lock();
        self.enter_disconnecting(&mut inner);
        inner.state = SessionState::Closed;
        inner.out_of_order.clear();
        inner.fragment = None;
    }

    // ── outbound ────────────────────────────────────────────────────────────

    /// Queue a typed message for reliable delivery.
    pub fn send<M: SwgMessage>(&self, message: &M) -> bool {
        self.queue_message(message.serialize())
    }

    /// Queue a serialized application message; sent on the next update.
    pub fn queue_message(&self, message: ByteBuffer) -> bool {
        let mut inner = self.inner.lock();
        if matches!(inner.state, SessionState::Disconnecting | SessionState::Closed) {
            return false;
        }
        inner.outgoing_messages.push_back(message);
        true
    }

    fn transmit(&self, inner: &SessionInner, packet: &[u8]) {
        let data = filter::encode(packet, &inner.filter);
        tracing::trace!(
            "[soe] [packet_out] endpoint={} data={}",
            self.endpoint,
            hex::encode(&data)
        );
        if self
            .outbound
            .send(Datagram {
                endpoint: self.endpoint,
                data,
            })
            .is_err()
        {
            tracing::debug!("[soe] [outbound_closed] endpoint={}", self.endpoint);
        }
    }

    fn send_control(&self, inner: &SessionInner, opcode: u16, sequence: u16) {
        let mut packet = ByteBuffer::with_capacity(4);
        packet.write_be(opcode);
        packet.write_be(sequence);
        self.transmit(inner, packet.data());
    }

    fn send_reliable(&self, inner: &mut SessionInner, mut header: ByteBuffer, payload: ByteBuffer, now: Instant) {
        header.append(payload);
        let sequence = inner.next_server_sequence;
        inner.next_server_sequence = sequence.wrapping_add(1);

        let data = header.into_bytes();
        self.transmit(inner, &data);
        inner.sent_unacked.push_back(SentPacket {
            sequence,
            data,
            sent_at: now,
            resend_count: 0,
        });
    }

    /// Payload bytes a single sequenced packet can carry.
    fn data_budget(inner: &SessionInner) -> usize {
        (inner.max_udp_size as usize)
            .saturating_sub(DATA_CHANNEL_HEADER_LEN + inner.filter.overhead())
    }

    /// Frame queued messages into sequenced packets.
    ///
    /// Oversized messages are fragmented; the rest are greedily packed so
    /// each packet fits the budget. Every sequenced packet, fragments
    /// included, takes a send window slot; the flush stops once it is full.
    fn flush(&self, inner: &mut SessionInner, now: Instant) {
        let budget = Self::data_budget(inner);
        let window = self.config.window_size as usize;

        let mut group: Vec<ByteBuffer> = Vec::new();
        let mut group_size = 2usize;

        while inner.sent_unacked.len() < window {
            if let Some(fragment) = inner.pending_fragments.pop_front() {
                let header = build_fragmented_data_channel_header(inner.next_server_sequence);
                self.send_reliable(inner, header, fragment, now);
                continue;
            }

            let Some(message) = inner.outgoing_messages.pop_front() else {
                break;
            };

            let oversized = message.size() > budget;
            let cost = size_prefix_len(message.size()) + message.size();
            if !group.is_empty() && (oversized || group_size + cost > budget) {
                self.flush_group(inner, &mut group, &mut group_size, now);
                if inner.sent_unacked.len() >= window {
                    inner.outgoing_messages.push_front(message);
                    break;
                }
            }

            if oversized {
                match split_data_channel_message(message, budget as u32) {
                    Ok(fragments) => inner.pending_fragments.extend(fragments),
                    Err(e) => tracing::error!("[soe] [split_failed] endpoint={} error={}", self.endpoint, e),
                }
                continue;
            }

            group.push(message);
            group_size += cost;
        }

        self.flush_group(inner, &mut group, &mut group_size, now);
    }

    fn flush_group(&self, inner: &mut SessionInner, group: &mut Vec<ByteBuffer>, group_size: &mut usize, now: Instant) {
        if group.is_empty() {
            return;
        }
        *group_size = 2;
        match pack_data_channel_messages(std::mem::take(group)) {
            Ok(payload) => {
                let header = build_data_channel_header(inner.next_server_sequence);
                self.send_reliable(inner, header, payload, now);
            }
            Err(e) => tracing::error!("[soe] [pack_failed] endpoint={} error={}", self.endpoint, e),
        }
    }

    /// Periodic maintenance: liveness check, resends and outbound flush.
    pub fn update(&self, now: Instant) -> SessionUpdate {
        let mut inner = self.inner.lock();

        match inner.state {
            SessionState::Closed => return SessionUpdate::Closed,
            SessionState::Disconnecting => return SessionUpdate::Disconnecting,
            _ => {}
        }

        if now.saturating_duration_since(inner.last_activity) > self.config.timeout() {
            return SessionUpdate::TimedOut;
        }

        let resend_delay = self.config.resend_delay();
        let max_resends = self.config.max_resends;
        let mut due = Vec::new();
        for packet in inner.sent_unacked.iter_mut() {
            if now.saturating_duration_since(packet.sent_at) >= resend_delay {
                if packet.resend_count >= max_resends {
                    return SessionUpdate::ResendExhausted;
                }
                packet.resend_count += 1;
                packet.sent_at = now;
                due.push(packet.data.clone());
            }
        }
        for data in &due {
            tracing::debug!("[soe] [resend] endpoint={} len={}", self.endpoint, data.len());
            self.transmit(&inner, data);
        }

        self.flush(&mut inner, now);
        SessionUpdate::Alive
    }

    // ── inbound ─────────────────────────────────────────────────────────────

    /// Process one raw datagram.
    ///
    /// Returns the application messages that became deliverable, in send
    /// order. An `Err` is a protocol violation the owner should answer by
    /// closing the session; malformed-but-harmless packets are dropped.
    pub fn handle_packet(&self, packet: &[u8], now: Instant) -> Result<Vec<ByteBuffer>, SessionError> {
        let mut inner = self.inner.lock();
        if matches!(inner.state, SessionState::Disconnecting | SessionState::Closed) {
            return Ok(Vec::new());
        }
        if packet.len() < 2 {
            tracing::debug!("[soe] [runt_packet] endpoint={} len={}", self.endpoint, packet.len());
            return Ok(Vec::new());
        }

        tracing::trace!(
            "[soe] [packet_in] endpoint={} data={}",
            self.endpoint,
            hex::encode(packet)
        );

        if inner.state == SessionState::Uninitialized {
            inner.state = SessionState::Handshaking;
        }

        let opcode = u16::from_be_bytes([packet[0], packet[1]]);
        if opcode == SESSION_REQUEST {
            self.handle_session_request(&mut inner, packet, now);
            return Ok(Vec::new());
        }

        let decoded = match filter::decode(packet, &inner.filter) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!("[soe] [filter_drop] endpoint={} error={}", self.endpoint, e);
                return Ok(Vec::new());
            }
        };
        inner.last_activity = now;

        let mut messages = Vec::new();
        let mut advanced = false;
        self.handle_soe_packet(&mut inner, decoded, &mut messages, &mut advanced)?;

        if advanced {
            let acked = inner.next_client_sequence.wrapping_sub(1);
            self.send_control(&inner, ACKNOWLEDGEMENT, acked);
        }

        Ok(messages)
    }

    fn handle_session_request(&self, inner: &mut SessionInner, packet: &[u8], now: Instant) {
        let Some((connection_id, client_udp_size)) = parse_session_request(packet) else {
            tracing::debug!("[soe] [bad_session_request] endpoint={}", self.endpoint);
            return;
        };
        inner.last_activity = now;

        // A repeated request for the same connection reuses the seed so the
        // client can still verify our earlier packets.
        if inner.connection_id != connection_id || inner.filter == FilterParams::default() {
            inner.connection_id = connection_id;
            inner.filter = FilterParams {
                crc_seed: rand::random::<u32>(),
                crc_length: self.config.crc_length,
                compression: self.config.compression,
                compression_threshold: self.config.compression_threshold,
            };
            inner.max_udp_size = client_udp_size.min(self.config.max_udp_size).max(crate::config::MIN_UDP_SIZE);
        }

        let mut response = ByteBuffer::with_capacity(17);
        response.write_be(SESSION_RESPONSE);
        response.write_be(connection_id);
        response.write_be(inner.filter.crc_seed);
        response.write(inner.filter.crc_length);
        response.write(u8::from(inner.filter.compression));
        response.write(CRC_SEED_SIZE);
        response.write_be(inner.max_udp_size);

        // SessionResponse is never filtered
        if self
            .outbound
            .send(Datagram {
                endpoint: self.endpoint,
                data: response.into_bytes(),
            })
            .is_err()
        {
            tracing::debug!("[soe] [outbound_closed] endpoint={}", self.endpoint);
        }

        tracing::info!(
            "[soe] [session_request] endpoint={} connection_id={} max_udp_size={}",
            self.endpoint,
            connection_id,
            inner.max_udp_size
        );
    }

    fn handle_soe_packet(
        &self,
        inner: &mut SessionInner,
        packet: Bytes,
        messages: &mut Vec<ByteBuffer>,
        advanced: &mut bool,
    ) -> Result<(), SessionError> {
        let mut buffer = ByteBuffer::from(packet);
        let Ok(opcode) = buffer.read_be::<u16>() else {
            return Ok(());
        };

        match opcode {
            MULTI_PACKET => {
                while !buffer.is_empty() {
                    let inner_packet = read_size_prefix(&mut buffer).and_then(|len| buffer.read_bytes(len));
                    match inner_packet {
                        Ok(inner_packet) => self.handle_soe_packet(inner, inner_packet, messages, advanced)?,
                        Err(e) => {
                            tracing::warn!("[soe] [bad_multi_packet] endpoint={} error={}", self.endpoint, e);
                            break;
                        }
                    }
                }
            }
            DISCONNECT => {
                let connection_id = buffer.read_be::<u32>().unwrap_or(0);
                if connection_id == inner.connection_id {
                    self.enter_disconnecting(inner);
                    tracing::info!("[soe] [peer_disconnect] endpoint={}", self.endpoint);
                } else {
                    tracing::debug!(
                        "[soe] [disconnect_ignored] endpoint={} connection_id={}",
                        self.endpoint,
                        connection_id
                    );
                }
            }
            PING => {
                let mut ping = ByteBuffer::with_capacity(2);
                ping.write_be(PING);
                self.transmit(inner, ping.data());
            }
            DATA_CHANNEL | FRAGMENTED_DATA_CHANNEL => {
                let Ok(sequence) = buffer.read_be::<u16>() else {
                    return Ok(());
                };
                let kind = if opcode == DATA_CHANNEL {
                    ChannelKind::Data
                } else {
                    ChannelKind::Fragment
                };
                self.handle_sequenced(inner, sequence, kind, buffer.into_bytes(), messages, advanced)?;
            }
            ACKNOWLEDGEMENT => {
                if let Ok(sequence) = buffer.read_be::<u16>() {
                    Self::handle_ack(inner, sequence);
                }
            }
            OUT_OF_ORDER => {
                if let Ok(sequence) = buffer.read_be::<u16>() {
                    self.handle_out_of_order(inner, sequence);
                }
            }
            other => {
                tracing::debug!("[soe] [unknown_opcode] endpoint={} opcode={:04X}", self.endpoint, other);
            }
        }

        Ok(())
    }

    fn handle_sequenced(
        &self,
        inner: &mut SessionInner,
        sequence: u16,
        kind: ChannelKind,
        payload: Bytes,
        messages: &mut Vec<ByteBuffer>,
        advanced: &mut bool,
    ) -> Result<(), SessionError> {
        let distance = sequence_distance(inner.next_client_sequence, sequence);

        if distance < 0 {
            // Already delivered; the peer missed our ack.
            self.send_control(inner, ACKNOWLEDGEMENT, inner.next_client_sequence.wrapping_sub(1));
            return Ok(());
        }

        if distance > 0 {
            if distance as u16 >= self.config.window_size {
                tracing::debug!(
                    "[soe] [outside_window] endpoint={} sequence={} expected={}",
                    self.endpoint,
                    sequence,
                    inner.next_client_sequence
                );
                return Ok(());
            }
            inner.out_of_order.insert(sequence, (kind, payload));
            self.send_control(inner, OUT_OF_ORDER, sequence);
            return Ok(());
        }

        self.process_channel_item(inner, kind, payload, messages)?;
        inner.next_client_sequence = inner.next_client_sequence.wrapping_add(1);
        *advanced = true;

        while let Some((kind, payload)) = inner.out_of_order.remove(&inner.next_client_sequence) {
            self.process_channel_item(inner, kind, payload, messages)?;
            inner.next_client_sequence = inner.next_client_sequence.wrapping_add(1);
        }

        Ok(())
    }

    fn process_channel_item(
        &self,
        inner: &mut SessionInner,
        kind: ChannelKind,
        payload: Bytes,
        messages: &mut Vec<ByteBuffer>,
    ) -> Result<(), SessionError> {
        match kind {
            ChannelKind::Data => self.unpack_payload(ByteBuffer::from(payload), messages),
            ChannelKind::Fragment => {
                if let Some(complete) = self.assemble_fragment(inner, payload)? {
                    self.unpack_payload(ByteBuffer::from(complete), messages);
                }
            }
        }
        Ok(())
    }

    fn unpack_payload(&self, payload: ByteBuffer, messages: &mut Vec<ByteBuffer>) {
        match unpack_data_channel_messages(payload) {
            Ok(unpacked) => messages.extend(unpacked.into_iter().filter(|m| !m.is_empty())),
            Err(e) => tracing::warn!("[soe] [bad_payload] endpoint={} error={}", self.endpoint, e),
        }
    }

    fn assemble_fragment(&self, inner: &mut SessionInner, payload: Bytes) -> Result<Option<Bytes>, SessionError> {
        let violation = |reason: String| SessionError::ProtocolViolation {
            endpoint: self.endpoint,
            reason,
        };

        if let Some(assembly) = inner.fragment.as_mut() {
            assembly.data.extend_from_slice(&payload);
        } else {
            if payload.len() < 4 {
                return Err(violation("first fragment shorter than its size prefix".into()));
            }
            let total = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
            if total == 0 {
                return Err(violation("fragment total size is zero".into()));
            }
            let mut data = BytesMut::with_capacity(total.min(MAX_REASSEMBLY_PREALLOC));
            data.extend_from_slice(&payload[4..]);
            inner.fragment = Some(FragmentAssembly { total, data });
        }

        let Some(assembly) = inner.fragment.as_mut() else {
            return Ok(None);
        };

        if assembly.data.len() > assembly.total {
            let reason = format!(
                "fragments carry {} bytes for a {} byte message",
                assembly.data.len(),
                assembly.total
            );
            inner.fragment = None;
            return Err(violation(reason));
        }

        if assembly.data.len() == assembly.total {
            let complete = std::mem::take(&mut assembly.data).freeze();
            inner.fragment = None;
            return Ok(Some(complete));
        }

        Ok(None)
    }

    fn handle_ack(inner: &mut SessionInner, sequence: u16) {
        while let Some(front) = inner.sent_unacked.front() {
            if sequence_distance(front.sequence, sequence) >= 0 {
                inner.sent_unacked.pop_front();
            } else {
                break;
            }
        }
    }

    fn handle_out_of_order(&self, inner: &mut SessionInner, sequence: u16) {
        inner.sent_unacked.retain(|p| p.sequence != sequence);

        let now = Instant::now();
        let mut due = Vec::new();
        for packet in inner.sent_unacked.iter_mut() {
            if sequence_distance(packet.sequence, sequence) > 0 {
                packet.sent_at = now;
                packet.resend_count += 1;
                due.push(packet.data.clone());
            }
        }
        for data in &due {
            self.transmit(inner, data);
        }
    }
}
