//! Message dispatch registry
//!
//! Maps application opcodes to handlers. Each handler owns the knowledge of
//! how to parse its message type, so the registry only routes raw bytes.
//! Handlers are registered at startup; a second registration for the same
//! opcode is rejected and the first handler stays in place.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::messages::{self, SwgMessage};
use crate::network::byte_buffer::{BufferError, ByteBuffer};
use crate::network::soe::Session;

/// Error types for dispatch operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Unidentified message received: opcode={0:#010x}")]
    UnidentifiedMessageReceived(u32),

    #[error("Handler already defined for opcode {0:#010x}")]
    HandlerAlreadyDefined(u32),

    #[error("Malformed message header: {0}")]
    MalformedHeader(BufferError),

    #[error("Failed to deserialize opcode {opcode:#010x}: {source}")]
    Deserialize { opcode: u32, source: BufferError },

    #[error("Session {0} is closed")]
    SessionClosed(std::net::SocketAddr),
}

/// Type-erased handler: parses the message body and invokes the callback.
pub trait MessageHandler: Send + Sync {
    /// `body` is positioned just past the opcount/opcode header.
    fn handle(&self, session: &Arc<Session>, body: ByteBuffer) -> Result<(), DispatchError>;
}

/// Binds a [`SwgMessage`] type to a callback.
struct TypedHandler<M, F> {
    callback: F,
    _message: PhantomData<fn() -> M>,
}

impl<M, F> MessageHandler for TypedHandler<M, F>
where
    M: SwgMessage,
    F: Fn(&Arc<Session>, M) + Send + Sync,
{
    fn handle(&self, session: &Arc<Session>, mut body: ByteBuffer) -> Result<(), DispatchError> {
        let message = M::on_deserialize(&mut body).map_err(|source| DispatchError::Deserialize {
            opcode: M::OPCODE,
            source,
        })?;
        (self.callback)(session, message);
        Ok(())
    }
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<u32, Arc<dyn MessageHandler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an erased handler for `opcode`.
    pub fn register_handler(&self, opcode: u32, handler: Arc<dyn MessageHandler>) -> Result<(), DispatchError> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&opcode) {
            return Err(DispatchError::HandlerAlreadyDefined(opcode));
        }
        handlers.insert(opcode, handler);
        tracing::debug!("[dispatch] [handler_registered] opcode={:#010x}", opcode);
        Ok(())
    }

    /// Register a typed callback for `M::OPCODE`.
    pub fn register<M, F>(&self, callback: F) -> Result<(), DispatchError>
    where
        M: SwgMessage,
        F: Fn(&Arc<Session>, M) + Send + Sync + 'static,
    {
        self.register_handler(
            M::OPCODE,
            Arc::new(TypedHandler {
                callback,
                _message: PhantomData,
            }),
        )
    }

    pub fn has_handler(&self, opcode: u32) -> bool {
        self.handlers.read().contains_key(&opcode)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Route one message body to the handler for `opcode`.
    pub fn dispatch(&self, session: &Arc<Session>, opcode: u32, body: ByteBuffer) -> Result<(), DispatchError> {
        // Clone out so the registry lock is not held while the handler runs.
        let handler = self
            .handlers
            .read()
            .get(&opcode)
            .cloned()
            .ok_or(DispatchError::UnidentifiedMessageReceived(opcode))?;

        if session.is_closed() {
            return Err(DispatchError::SessionClosed(session.endpoint()));
        }

        handler.handle(session, body)
    }

    /// Read the opcount/opcode header from `message` and dispatch the rest.
    pub fn dispatch_message(&self, session: &Arc<Session>, mut message: ByteBuffer) -> Result<(), DispatchError> {
        let (_opcount, opcode) = messages::read_header(&mut message).map_err(DispatchError::MalformedHeader)?;
        self.dispatch(session, opcode, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::messages::{ClientIdMsg, HeartBeat};
    use crate::network::soe::DisconnectReason;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn session() -> Arc<Session> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Session::new(
            "127.0.0.1:6000".parse().unwrap(),
            ProtocolConfig::default(),
            tx,
        ))
    }

    #[test]
    fn test_register_and_dispatch() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        dispatcher
            .register::<ClientIdMsg, _>(move |_, msg| {
                assert_eq!(msg.session_hash, "key");
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(dispatcher.has_handler(ClientIdMsg::OPCODE));
        let msg = ClientIdMsg {
            session_hash: "key".into(),
            ..Default::default()
        };
        dispatcher.dispatch_message(&session(), msg.serialize()).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let first = Arc::clone(&seen);
        dispatcher
            .register::<HeartBeat, _>(move |_, _| {
                first.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let result = dispatcher.register::<HeartBeat, _>(|_, _| panic!("replaced handler ran"));
        assert_eq!(result, Err(DispatchError::HandlerAlreadyDefined(HeartBeat::OPCODE)));

        dispatcher.dispatch_message(&session(), HeartBeat.serialize()).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.handler_count(), 1);
    }

    #[test]
    fn test_unknown_opcode_leaves_session_intact() {
        let dispatcher = Dispatcher::new();
        let session = session();

        let mut message = ByteBuffer::new();
        message.write(1u16);
        message.write(0xDEAD_BEEFu32);
        let result = dispatcher.dispatch_message(&session, message);

        assert_eq!(result, Err(DispatchError::UnidentifiedMessageReceived(0xDEAD_BEEF)));
        assert!(!session.is_closed());
    }

    #[test]
    fn test_malformed_body_is_reported() {
        let dispatcher = Dispatcher::new();
        dispatcher.register::<ClientIdMsg, _>(|_, _| {}).unwrap();

        let mut message = ByteBuffer::new();
        message.write(ClientIdMsg::OPCOUNT);
        message.write(ClientIdMsg::OPCODE);
        message.write(1u32);

        let result = dispatcher.dispatch_message(&session(), message);
        assert!(matches!(result, Err(DispatchError::Deserialize { .. })));
    }

    #[test]
    fn test_short_header_is_reported() {
        let dispatcher = Dispatcher::new();
        let result = dispatcher.dispatch_message(&session(), ByteBuffer::from(vec![1, 0, 2]));
        assert!(matches!(result, Err(DispatchError::MalformedHeader(_))));
    }

    #[test]
    fn test_closed_session_is_skipped() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register::<HeartBeat, _>(|_, _| panic!("handler ran on a closed session"))
            .unwrap();

        let session = session();
        session.close(DisconnectReason::Application);
        let result = dispatcher.dispatch_message(&session, HeartBeat.serialize());
        assert!(matches!(result, Err(DispatchError::SessionClosed(_))));
    }
}
