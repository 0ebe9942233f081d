//! Connection server
//!
//! Accepts SOE sessions from game clients, validates the login session key
//! carried by `ClientIdMsg` and promotes the session to a connected player.

pub mod memory;
pub mod ping;
pub mod providers;

use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::config::ServerConfig;
use crate::messages::{ClientIdMsg, ClientPermissionsMessage, CmdSceneReady, HeartBeat};
use crate::network::dispatch::DispatchError;
use crate::network::soe::{DisconnectReason, Session, SessionError, SessionListener, SoeServer};
use providers::{AccountProvider, CharacterProvider, SessionProvider, SimulationService};

/// The collaborators a [`ConnectionService`] is wired to.
#[derive(Clone)]
pub struct Providers {
    pub accounts: Arc<dyn AccountProvider>,
    pub sessions: Arc<dyn SessionProvider>,
    pub characters: Arc<dyn CharacterProvider>,
    pub simulation: Arc<dyn SimulationService>,
}

impl Providers {
    /// Wire every collaborator to one in-memory provider.
    pub fn in_memory(providers: Arc<memory::MemoryProviders>) -> Self {
        Self {
            accounts: providers.clone(),
            sessions: providers.clone(),
            characters: providers.clone(),
            simulation: providers,
        }
    }
}

pub struct ConnectionService {
    config: ServerConfig,
    server: Arc<SoeServer>,
    providers: Providers,
}

impl ConnectionService {
    pub fn new(config: ServerConfig, providers: Providers) -> Arc<Self> {
        let server = SoeServer::new(config.protocol.clone(), config.max_sessions);
        Arc::new(Self {
            config,
            server,
            providers,
        })
    }

    pub fn server(&self) -> &Arc<SoeServer> {
        &self.server
    }

    /// Register message handlers and the session removal hook.
    pub fn startup(self: &Arc<Self>) -> Result<(), DispatchError> {
        let dispatcher = self.server.dispatcher();

        let service = Arc::downgrade(self);
        dispatcher.register::<ClientIdMsg, _>(move |session, message| {
            if let Some(service) = Weak::upgrade(&service) {
                service.handle_client_id_msg(session, message);
            }
        })?;

        let service = Arc::downgrade(self);
        dispatcher.register::<CmdSceneReady, _>(move |session, _| {
            if let Some(service) = Weak::upgrade(&service) {
                service.handle_cmd_scene_ready(session);
            }
        })?;

        // Liveness is refreshed by the transport on every packet.
        dispatcher.register::<HeartBeat, _>(|session, _| {
            tracing::trace!("[connection] [heartbeat] endpoint={}", session.endpoint());
        })?;

        self.server.set_listener(Arc::new(RemovalHook {
            sessions: Arc::clone(&self.providers.sessions),
            simulation: Arc::clone(&self.providers.simulation),
        }));

        tracing::info!(
            "[connection] [started] handlers={}",
            self.server.dispatcher().handler_count()
        );
        Ok(())
    }

    /// Bind the configured game and ping ports and serve until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let bind = format!("{}:{}", self.config.listen_address, self.config.listen_port);
        let socket = UdpSocket::bind(&bind)
            .await
            .with_context(|| format!("Cannot bind connection port: {}", bind))?;

        let ping_bind = format!("{}:{}", self.config.listen_address, self.config.ping_port);
        let ping_socket = UdpSocket::bind(&ping_bind)
            .await
            .with_context(|| format!("Cannot bind ping port: {}", ping_bind))?;

        self.serve(socket, Some(ping_socket), shutdown).await
    }

    /// Serve on already-bound sockets.
    pub async fn serve(
        self: Arc<Self>,
        socket: UdpSocket,
        ping_socket: Option<UdpSocket>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let ping = ping_socket.map(|s| tokio::spawn(ping::run_ping_server(s, shutdown.clone())));

        let result = Arc::clone(&self.server)
            .run(socket, shutdown)
            .await
            .context("Connection server failed");

        if let Some(ping) = ping {
            ping.abort();
        }
        tracing::info!("[connection] [stopped]");
        result
    }

    /// Resolve the login session key to `(account_id, player_id)`.
    fn authorize(&self, message: &ClientIdMsg) -> Result<(u32, u64), SessionError> {
        let account_id = self
            .providers
            .accounts
            .get_account_by_session_key(&message.session_hash)
            .ok_or_else(|| SessionError::Unauthorized("unknown session key".into()))?;

        let player_id = self
            .providers
            .sessions
            .get_player_id(account_id)
            .ok_or_else(|| SessionError::Unauthorized(format!("no player for account {}", account_id)))?;

        Ok((account_id, player_id))
    }

    fn handle_client_id_msg(&self, session: &Arc<Session>, message: ClientIdMsg) {
        tracing::debug!("[connection] [client_id_msg] endpoint={}", session.endpoint());

        // Unauthorized clients get no reply and are reaped by the idle timeout.
        let (account_id, player_id) = match self.authorize(&message) {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!("[connection] [unauthorized] endpoint={} error={}", session.endpoint(), e);
                return;
            }
        };

        if let Some(existing) = self.server.find_session_by_player_id(player_id) {
            if !Arc::ptr_eq(&existing, session) {
                tracing::info!(
                    "[connection] [evict_previous] player_id={} old={} new={}",
                    player_id,
                    existing.endpoint(),
                    session.endpoint()
                );
                self.server
                    .close_session(&existing, DisconnectReason::NewConnectionAttempt);
            }
        }

        if !self
            .providers
            .sessions
            .create_game_session(player_id, session.connection_id())
        {
            tracing::warn!(
                "[connection] [game_session_failed] player_id={} connection_id={}",
                player_id,
                session.connection_id()
            );
        }

        if !session.connect(account_id, player_id) {
            return;
        }

        let max_characters = self.providers.characters.get_max_characters(account_id);
        session.send(&ClientPermissionsMessage {
            galaxy_available: self.config.galaxy_status,
            available_character_slots: u8::try_from(max_characters).unwrap_or(u8::MAX),
            unlimited_characters: 0,
        });
    }

    fn handle_cmd_scene_ready(&self, session: &Arc<Session>) {
        let player_id = session.player_id();
        if player_id == 0 {
            tracing::warn!(
                "[connection] [scene_ready_unauthenticated] endpoint={}",
                session.endpoint()
            );
            return;
        }

        session.send(&CmdSceneReady);
        self.providers.simulation.object_ready(player_id);
    }
}

/// Runs collaborator cleanup when a session leaves the table.
struct RemovalHook {
    sessions: Arc<dyn SessionProvider>,
    simulation: Arc<dyn SimulationService>,
}

impl SessionListener for RemovalHook {
    fn session_removed(&self, session: &Arc<Session>) {
        let player_id = session.player_id();
        if player_id == 0 {
            return;
        }

        // Keyed by connection so a late end never drops a replacement
        // session's game session.
        self.sessions.end_game_session(player_id, session.connection_id());
        self.simulation.player_removed(player_id);

        let simulation = Arc::clone(&self.simulation);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || simulation.persist_related_objects(player_id));
            }
            Err(_) => simulation.persist_related_objects(player_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{MemoryProviders, SimulationEvent};
    use super::*;
    use crate::config::DevAccount;
    use crate::messages::SwgMessage;
    use crate::network::byte_buffer::ByteBuffer;
    use crate::network::soe::{build_data_channel_header, SessionState};
    use std::net::SocketAddr;

    fn config() -> ServerConfig {
        let mut config = ServerConfig::from_str(
            r#"
listen_address: "127.0.0.1"
protocol:
  crc_length: 0
  compression: false
"#,
        )
        .unwrap();
        config.dev_accounts.push(DevAccount {
            session_key: "valid".into(),
            account_id: 5,
            player_id: 500,
            max_characters: 3,
        });
        config
    }

    fn service() -> (Arc<ConnectionService>, Arc<MemoryProviders>) {
        let config = config();
        let providers = Arc::new(MemoryProviders::new(&config.dev_accounts));
        let service = ConnectionService::new(config, Providers::in_memory(providers.clone()));
        service.startup().unwrap();
        (service, providers)
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn data_packet<M: SwgMessage>(sequence: u16, message: &M) -> ByteBuffer {
        let mut packet = build_data_channel_header(sequence);
        packet.append(message.serialize());
        packet
    }

    fn session_request(connection_id: u32) -> ByteBuffer {
        let mut request = ByteBuffer::new();
        request.write_be(0x0001u16);
        request.write_be(0u32);
        request.write_be(connection_id);
        request.write_be(496u32);
        request
    }

    fn client_id(key: &str) -> ClientIdMsg {
        ClientIdMsg {
            session_hash: key.into(),
            version: "20050408-18:00".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_startup_twice_fails() {
        let (service, _) = service();
        assert!(matches!(
            service.startup(),
            Err(DispatchError::HandlerAlreadyDefined(_))
        ));
    }

    #[test]
    fn test_valid_client_id_connects() {
        let (service, providers) = service();
        let server = service.server();
        server.handle_datagram(addr(1), data_packet(0, &client_id("valid")).data());

        let session = server.get_session(&addr(1)).unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.player_id(), 500);
        assert_eq!(session.account_id(), 5);
        assert_eq!(session.queued_messages(), 1);
        assert_eq!(providers.game_session(500), Some(session.connection_id()));
    }

    #[test]
    fn test_invalid_client_id_stays_handshaking() {
        let (service, providers) = service();
        let server = service.server();
        server.handle_datagram(addr(1), data_packet(0, &client_id("forged")).data());

        let session = server.get_session(&addr(1)).unwrap();
        assert_eq!(session.state(), SessionState::Handshaking);
        assert_eq!(session.queued_messages(), 0);
        assert_eq!(providers.game_session(500), None);
    }

    #[test]
    fn test_reconnect_evicts_previous_session() {
        let (service, providers) = service();
        let server = service.server();
        server.handle_datagram(addr(1), data_packet(0, &client_id("valid")).data());
        let old = server.get_session(&addr(1)).unwrap();

        server.handle_datagram(addr(2), data_packet(0, &client_id("valid")).data());

        assert_eq!(old.state(), SessionState::Closed);
        assert!(server.get_session(&addr(1)).is_none());
        let new = server.find_session_by_player_id(500).unwrap();
        assert_eq!(new.endpoint(), addr(2));
        assert!(providers.game_session(500).is_some());
        assert!(providers.events().contains(&SimulationEvent::PlayerRemoved(500)));
    }

    #[test]
    fn test_scene_ready_requires_connection() {
        let (service, providers) = service();
        let server = service.server();

        server.handle_datagram(addr(1), data_packet(0, &CmdSceneReady).data());
        assert!(providers.events().is_empty());

        server.handle_datagram(addr(1), data_packet(1, &client_id("valid")).data());
        server.handle_datagram(addr(1), data_packet(2, &CmdSceneReady).data());
        assert_eq!(providers.events(), vec![SimulationEvent::ObjectReady(500)]);
    }

    #[test]
    fn test_removal_runs_cleanup() {
        let (service, providers) = service();
        let server = service.server();
        server.handle_datagram(addr(1), data_packet(0, &client_id("valid")).data());
        let session = server.get_session(&addr(1)).unwrap();

        server.close_session(&session, DisconnectReason::Application);

        assert_eq!(providers.game_session(500), None);
        assert_eq!(
            providers.events(),
            vec![SimulationEvent::PlayerRemoved(500), SimulationEvent::Persisted(500)]
        );
    }

    #[test]
    fn test_late_removal_keeps_replacement_game_session() {
        let (service, providers) = service();
        let server = service.server();

        server.handle_datagram(addr(1), session_request(1).data());
        server.handle_datagram(addr(1), data_packet(0, &client_id("valid")).data());
        let old = server.get_session(&addr(1)).unwrap();
        assert_eq!(providers.game_session(500), Some(1));

        // timed out but not yet removed
        old.close(DisconnectReason::Timeout);

        server.handle_datagram(addr(2), session_request(2).data());
        server.handle_datagram(addr(2), data_packet(0, &client_id("valid")).data());
        assert_eq!(providers.game_session(500), Some(2));

        server.remove_session(&old);
        assert_eq!(providers.game_session(500), Some(2));
        assert_eq!(
            server.find_session_by_player_id(500).unwrap().endpoint(),
            addr(2)
        );
    }
}
