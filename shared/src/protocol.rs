use crate::entry::Entry;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 1235;

/// Identity of a participant within a game
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionInfo {
    pub game_id: String,
    pub player_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Join {
        protocol_version: u32,
        game_id: Option<String>,
        credential: Option<String>,
    },
    Auth {
        credential: String,
    },
    Leave,

    /// Accepted join. `authenticated` is the relay's verdict on the
    /// credential sent with `Join`. Later joiners get the game state in
    /// `snapshot`; it replaces every topic's cache before the topics see
    /// the session.
    Joined {
        session: SessionInfo,
        is_first: bool,
        authenticated: bool,
        credential: Option<String>,
        snapshot: Vec<Entry>,
    },
    AuthResult {
        authenticated: bool,
    },
    Disconnected {
        reason: String,
    },

    /// Entry batch, sent in both directions. `full` replaces the cache of
    /// every receiving topic.
    Update {
        entries: Vec<Entry>,
        full: bool,
    },
}
