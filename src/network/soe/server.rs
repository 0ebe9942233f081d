//! UDP server driving the SOE session engine.
//!
//! One receive loop feeds datagrams to sessions, a writer task owns all
//! socket sends, and a maintenance task ticks every live session on a
//! fixed interval.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};

use super::session::{Datagram, Session, SessionError, SessionUpdate};
use super::session_table::SessionTable;
use super::DisconnectReason;
use crate::config::ProtocolConfig;
use crate::network::dispatch::{DispatchError, Dispatcher};

/// Largest datagram the receive loop accepts.
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Notified when a session leaves the table.
///
/// Runs on the I/O path; implementations hand slow work (persistence,
/// simulation cleanup) to another context.
pub trait SessionListener: Send + Sync {
    fn session_removed(&self, session: &Arc<Session>);
}

pub struct SoeServer {
    config: ProtocolConfig,
    sessions: SessionTable,
    dispatcher: Dispatcher,
    outbound_tx: mpsc::UnboundedSender<Datagram>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Datagram>>>,
    listener: RwLock<Option<Arc<dyn SessionListener>>>,
}

impl SoeServer {
    pub fn new(config: ProtocolConfig, max_sessions: usize) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            sessions: SessionTable::new(max_sessions),
            dispatcher: Dispatcher::new(),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            listener: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn set_listener(&self, listener: Arc<dyn SessionListener>) {
        *self.listener.write() = Some(listener);
    }

    pub fn create_session(&self, endpoint: SocketAddr) -> Result<Arc<Session>, SessionError> {
        self.sessions.create_session(endpoint, || {
            let session = Session::new(endpoint, self.config.clone(), self.outbound_tx.clone());
            tracing::info!(
                "[soe] [session_created] endpoint={} hash={:08X}",
                endpoint,
                session.endpoint_hash()
            );
            session
        })
    }

    pub fn get_session(&self, endpoint: &SocketAddr) -> Option<Arc<Session>> {
        self.sessions.get_session(endpoint)
    }

    pub fn find_session_by_player_id(&self, player_id: u64) -> Option<Arc<Session>> {
        self.sessions.find_session_by_player_id(player_id)
    }

    /// Tear a session down: notify the listener, erase it from the table,
    /// then mark it closed. Only the first caller does any work.
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        if !session.begin_removal() {
            return false;
        }
        session.close(DisconnectReason::Application);

        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.session_removed(session);
        }

        let removed = self.sessions.remove_session(session);
        session.mark_closed();
        tracing::info!(
            "[soe] [session_removed] endpoint={} player_id={} sessions={}",
            session.endpoint(),
            session.player_id(),
            self.sessions.len()
        );
        removed
    }

    /// Send a Disconnect with `reason`, then remove the session.
    pub fn close_session(&self, session: &Arc<Session>, reason: DisconnectReason) -> bool {
        session.close(reason);
        self.remove_session(session)
    }

    /// Process one inbound datagram and dispatch whatever it completes.
    ///
    /// A SessionRequest carrying a new connection id means the client
    /// restarted on the same endpoint; the old session is removed and the
    /// request starts a fresh one.
    pub fn handle_datagram(&self, endpoint: SocketAddr, data: &[u8]) {
        let existing = match self.get_session(&endpoint) {
            Some(stale) if stale.is_superseded_by(data) => {
                tracing::info!(
                    "[soe] [session_restarted] endpoint={} old_connection_id={}",
                    endpoint,
                    stale.connection_id()
                );
                self.remove_session(&stale);
                None
            }
            other => other,
        };

        let session = match existing {
            Some(session) => session,
            None => match self.create_session(endpoint) {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!("[soe] [session_rejected] endpoint={} error={}", endpoint, e);
                    return;
                }
            },
        };

        let messages = match session.handle_packet(data, Instant::now()) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!("[soe] [protocol_violation] endpoint={} error={}", endpoint, e);
                self.close_session(&session, DisconnectReason::ProtocolViolation);
                return;
            }
        };

        for message in messages {
            match self.dispatcher.dispatch_message(&session, message) {
                Ok(()) => {}
                Err(DispatchError::UnidentifiedMessageReceived(opcode)) => {
                    tracing::debug!(
                        "[soe] [unidentified_message] endpoint={} opcode={:#010x}",
                        endpoint,
                        opcode
                    );
                }
                Err(DispatchError::SessionClosed(_)) => break,
                Err(e) => tracing::warn!("[soe] [dispatch_failed] endpoint={} error={}", endpoint, e),
            }
        }

        if session.is_closed() {
            self.remove_session(&session);
        }
    }

    /// One maintenance pass over a snapshot of the live sessions.
    pub fn update_sessions(&self, now: Instant) {
        for session in self.sessions.snapshot() {
            match session.update(now) {
                SessionUpdate::Alive => {}
                SessionUpdate::TimedOut => {
                    tracing::info!("[soe] [session_timeout] endpoint={}", session.endpoint());
                    self.close_session(&session, DisconnectReason::Timeout);
                }
                SessionUpdate::ResendExhausted => {
                    tracing::info!("[soe] [resend_exhausted] endpoint={}", session.endpoint());
                    self.close_session(&session, DisconnectReason::UnacknowledgedTimeout);
                }
                SessionUpdate::Disconnecting | SessionUpdate::Closed => {
                    self.remove_session(&session);
                }
            }
        }
    }

    /// Close every session, e.g. at shutdown.
    pub fn close_all_sessions(&self) {
        for session in self.sessions.snapshot() {
            self.close_session(&session, DisconnectReason::Application);
        }
    }

    /// Serve `socket` until `shutdown` turns true or its sender is dropped.
    ///
    /// Can only be called once per server.
    pub async fn run(self: Arc<Self>, socket: UdpSocket, mut shutdown: watch::Receiver<bool>) -> Result<(), SessionError> {
        let mut outbound_rx = self.outbound_rx.lock().take().ok_or(SessionError::AlreadyRunning)?;
        let socket = Arc::new(socket);
        tracing::info!("[soe] [listening] addr={}", socket.local_addr()?);

        // Writer: every outbound datagram goes through here
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let writer_socket = Arc::clone(&socket);
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    datagram = outbound_rx.recv() => match datagram {
                        Some(datagram) => send_datagram(&writer_socket, datagram).await,
                        None => break,
                    },
                    _ = &mut stop_rx => {
                        while let Ok(datagram) = outbound_rx.try_recv() {
                            send_datagram(&writer_socket, datagram).await;
                        }
                        break;
                    }
                }
            }
        });

        let maintenance_server = Arc::clone(&self);
        let maintenance = tokio::spawn(async move {
            let mut ticker = interval(maintenance_server.config.update_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                maintenance_server.update_sessions(Instant::now());
            }
        });

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, endpoint)) => self.handle_datagram(endpoint, &buf[..len]),
                    // ICMP port-unreachable surfaces here on some platforms
                    Err(e) => tracing::debug!("[soe] [recv_error] error={}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("[soe] [shutdown] sessions={}", self.sessions.len());
        maintenance.abort();
        self.close_all_sessions();

        let _ = stop_tx.send(());
        if writer.await.is_err() {
            tracing::warn!("[soe] [writer_failed]");
        }
        Ok(())
    }
}

async fn send_datagram(socket: &UdpSocket, datagram: Datagram) {
    if let Err(e) = socket.send_to(&datagram.data, datagram.endpoint).await {
        tracing::warn!("[soe] [send_failed] endpoint={} error={}", datagram.endpoint, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{HeartBeat, SwgMessage};
    use crate::network::soe::{build_data_channel_header, SessionState};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn plain_server(max_sessions: usize) -> Arc<SoeServer> {
        let config = ProtocolConfig {
            crc_length: 0,
            compression: false,
            ..ProtocolConfig::default()
        };
        SoeServer::new(config, max_sessions)
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    struct CountingListener(AtomicUsize);

    impl SessionListener for CountingListener {
        fn session_removed(&self, session: &Arc<Session>) {
            assert_ne!(session.state(), SessionState::Closed);
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_maintenance_tick_with_no_sessions() {
        let server = plain_server(4);
        server.update_sessions(Instant::now());
        assert!(server.sessions().is_empty());
    }

    #[test]
    fn test_first_packet_creates_session() {
        let server = plain_server(4);
        server.handle_datagram(addr(1), &[0x00, 0x06]);

        let session = server.get_session(&addr(1)).unwrap();
        assert_eq!(session.state(), SessionState::Handshaking);
    }

    #[test]
    fn test_full_table_drops_new_endpoints() {
        let server = plain_server(1);
        server.handle_datagram(addr(1), &[0x00, 0x06]);
        server.handle_datagram(addr(2), &[0x00, 0x06]);

        assert_eq!(server.sessions().len(), 1);
        assert!(server.get_session(&addr(2)).is_none());
    }

    #[test]
    fn test_data_is_dispatched() {
        let server = plain_server(4);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        server
            .dispatcher()
            .register::<HeartBeat, _>(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let mut packet = build_data_channel_header(0);
        packet.append(HeartBeat.serialize());
        server.handle_datagram(addr(1), packet.data());

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_message_keeps_session() {
        let server = plain_server(4);
        let mut packet = build_data_channel_header(0);
        packet.write(1u16);
        packet.write(0x0BAD_F00Du32);
        server.handle_datagram(addr(1), packet.data());

        let session = server.get_session(&addr(1)).unwrap();
        assert!(!session.is_closed());
    }

    #[test]
    fn test_peer_disconnect_removes_session_once() {
        let server = plain_server(4);
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        server.set_listener(listener.clone());

        server.handle_datagram(addr(1), &[0x00, 0x06]);
        let session = server.get_session(&addr(1)).unwrap();
        server.handle_datagram(addr(1), &[0x00, 0x05, 0, 0, 0, 0, 0, 3]);

        assert!(server.get_session(&addr(1)).is_none());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!server.remove_session(&session));
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_idle_session_is_reaped() {
        let server = plain_server(4);
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        server.set_listener(listener.clone());

        server.handle_datagram(addr(1), &[0x00, 0x06]);
        server.update_sessions(Instant::now() + Duration::from_secs(61));

        assert!(server.sessions().is_empty());
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fragment_violation_closes_session() {
        let server = plain_server(4);
        let mut packet = vec![0x00, 0x0D, 0x00, 0x00];
        packet.extend_from_slice(&0u32.to_be_bytes());
        server.handle_datagram(addr(1), &packet);

        assert!(server.get_session(&addr(1)).is_none());
    }

    fn session_request(connection_id: u32) -> Vec<u8> {
        let mut request = vec![0x00, 0x01];
        request.extend_from_slice(&0u32.to_be_bytes());
        request.extend_from_slice(&connection_id.to_be_bytes());
        request.extend_from_slice(&496u32.to_be_bytes());
        request
    }

    fn heartbeat(sequence: u16) -> Vec<u8> {
        let mut packet = build_data_channel_header(sequence);
        packet.append(HeartBeat.serialize());
        packet.data().to_vec()
    }

    #[test]
    fn test_restarted_client_gets_fresh_session() {
        let server = plain_server(4);
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        server.set_listener(listener.clone());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        server
            .dispatcher()
            .register::<HeartBeat, _>(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        server.handle_datagram(addr(1), &session_request(1));
        for sequence in 0..3 {
            server.handle_datagram(addr(1), &heartbeat(sequence));
        }
        let old = server.get_session(&addr(1)).unwrap();
        assert!(old.connect(7, 700));
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        server.handle_datagram(addr(1), &session_request(2));
        let new = server.get_session(&addr(1)).unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(old.state(), SessionState::Closed);
        assert_eq!(new.state(), SessionState::Handshaking);
        assert_eq!(new.connection_id(), 2);
        assert_eq!(new.player_id(), 0);
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);

        server.handle_datagram(addr(1), &heartbeat(0));
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_repeated_session_request_keeps_session() {
        let server = plain_server(4);
        server.handle_datagram(addr(1), &session_request(1));
        let first = server.get_session(&addr(1)).unwrap();

        server.handle_datagram(addr(1), &session_request(1));
        let second = server.get_session(&addr(1)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(server.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let server = plain_server(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let handle = tokio::spawn(Arc::clone(&server).run(socket, shutdown_rx.clone()));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let result = Arc::clone(&server).run(second, shutdown_rx).await;
        assert!(matches!(result, Err(SessionError::AlreadyRunning)));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
