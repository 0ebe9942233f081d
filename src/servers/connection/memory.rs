//! In-memory providers backed by the `dev_accounts` config section.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use super::providers::{AccountProvider, CharacterProvider, SessionProvider, SimulationService};
use crate::config::DevAccount;

/// Most recent simulation events kept for inspection.
const MAX_RECORDED_EVENTS: usize = 256;

/// Something the simulation hooks were asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationEvent {
    ObjectReady(u64),
    PlayerRemoved(u64),
    Persisted(u64),
}

#[derive(Default)]
pub struct MemoryProviders {
    by_session_key: HashMap<String, u32>,
    accounts: HashMap<u32, DevAccount>,
    game_sessions: Mutex<HashMap<u64, u32>>,
    events: Mutex<VecDeque<SimulationEvent>>,
}

impl MemoryProviders {
    pub fn new(accounts: &[DevAccount]) -> Self {
        let mut providers = Self::default();
        for account in accounts {
            providers
                .by_session_key
                .insert(account.session_key.clone(), account.account_id);
            providers.accounts.insert(account.account_id, account.clone());
        }
        providers
    }

    /// Connection id of the player's current game session.
    pub fn game_session(&self, player_id: u64) -> Option<u32> {
        self.game_sessions.lock().get(&player_id).copied()
    }

    /// The latest simulation events, oldest first.
    pub fn events(&self) -> Vec<SimulationEvent> {
        self.events.lock().iter().copied().collect()
    }

    fn record(&self, event: SimulationEvent) {
        tracing::debug!("[connection] [simulation] event={:?}", event);
        let mut events = self.events.lock();
        if events.len() == MAX_RECORDED_EVENTS {
            events.pop_front();
        }
        events.push_back(event);
    }
}

impl AccountProvider for MemoryProviders {
    fn get_account_by_session_key(&self, session_key: &str) -> Option<u32> {
        self.by_session_key.get(session_key).copied()
    }
}

impl SessionProvider for MemoryProviders {
    fn get_player_id(&self, account_id: u32) -> Option<u64> {
        self.accounts
            .get(&account_id)
            .map(|a| a.player_id)
            .filter(|&id| id != 0)
    }

    fn create_game_session(&self, player_id: u64, connection_id: u32) -> bool {
        self.game_sessions.lock().insert(player_id, connection_id);
        true
    }

    fn end_game_session(&self, player_id: u64, connection_id: u32) -> bool {
        let mut sessions = self.game_sessions.lock();
        if sessions.get(&player_id) != Some(&connection_id) {
            return false;
        }
        sessions.remove(&player_id);
        true
    }
}

impl CharacterProvider for MemoryProviders {
    fn get_max_characters(&self, account_id: u32) -> u32 {
        self.accounts.get(&account_id).map_or(0, |a| a.max_characters)
    }
}

impl SimulationService for MemoryProviders {
    fn object_ready(&self, object_id: u64) {
        self.record(SimulationEvent::ObjectReady(object_id));
    }

    fn player_removed(&self, player_id: u64) {
        self.record(SimulationEvent::PlayerRemoved(player_id));
    }

    fn persist_related_objects(&self, object_id: u64) {
        self.record(SimulationEvent::Persisted(object_id));
    }
}
