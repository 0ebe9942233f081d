//! Collaborators the connection service consults.
//!
//! Calls made from packet handlers run on the I/O path and must return
//! quickly. [`SimulationService::persist_related_objects`] is always run on
//! the blocking pool.

/// Resolves login session keys issued by the login server.
pub trait AccountProvider: Send + Sync {
    fn get_account_by_session_key(&self, session_key: &str) -> Option<u32>;
}

/// Tracks which player is in game on which connection.
pub trait SessionProvider: Send + Sync {
    fn get_player_id(&self, account_id: u32) -> Option<u64>;

    /// Returns false if no game session could be recorded.
    fn create_game_session(&self, player_id: u64, connection_id: u32) -> bool;

    /// End the game session only if it still belongs to `connection_id`.
    fn end_game_session(&self, player_id: u64, connection_id: u32) -> bool;
}

pub trait CharacterProvider: Send + Sync {
    fn get_max_characters(&self, account_id: u32) -> u32;
}

/// Game-world hooks driven by connection events.
pub trait SimulationService: Send + Sync {
    /// The client finished loading the scene for `object_id`.
    fn object_ready(&self, object_id: u64);

    fn player_removed(&self, player_id: u64);

    /// Flush the player's object graph to storage. May block.
    fn persist_related_objects(&self, object_id: u64);
}
