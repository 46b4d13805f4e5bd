//! Connection registry of the relay
//!
//! Every accepted TCP connection is a [`Participant`]. It starts out
//! unattached and joins exactly one game after a successful `Join`. The
//! manager enforces the relay's capacity and routes outbound packets to
//! the writer task of each connection.

use log::{debug, info, warn};
use shared::{Packet, SessionInfo};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;

pub type ConnId = u32;

/// One connection to the relay
#[derive(Debug)]
pub struct Participant {
    pub conn_id: ConnId,
    pub addr: SocketAddr,
    /// Set once the participant joined a game
    pub session: Option<SessionInfo>,
    /// Whether this participant may write to write-protected topics
    pub authenticated: bool,
    sender: mpsc::UnboundedSender<Packet>,
}

impl Participant {
    pub fn new(conn_id: ConnId, addr: SocketAddr, sender: mpsc::UnboundedSender<Packet>) -> Self {
        Self {
            conn_id,
            addr,
            session: None,
            authenticated: false,
            sender,
        }
    }

    pub fn game_id(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.game_id.as_str())
    }

    pub fn player_id(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.player_id.as_str())
    }

    /// Queues a packet for the connection's writer task. Returns false if
    /// the connection is already gone.
    pub fn send(&self, packet: Packet) -> bool {
        self.sender.send(packet).is_ok()
    }
}

/// All open connections, indexed by connection id
pub struct ParticipantManager {
    participants: HashMap<ConnId, Participant>,
    next_conn_id: ConnId,
    max_participants: usize,
}

impl ParticipantManager {
    pub fn new(max_participants: usize) -> Self {
        Self {
            participants: HashMap::new(),
            next_conn_id: 1,
            max_participants,
        }
    }

    /// Registers a new connection, or returns `None` if the relay is full
    pub fn add(&mut self, addr: SocketAddr, sender: mpsc::UnboundedSender<Packet>) -> Option<ConnId> {
        if self.participants.len() >= self.max_participants {
            return None;
        }

        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;

        info!("Connection {} opened from {}", conn_id, addr);
        self.participants
            .insert(conn_id, Participant::new(conn_id, addr, sender));
        Some(conn_id)
    }

    pub fn remove(&mut self, conn_id: ConnId) -> Option<Participant> {
        let participant = self.participants.remove(&conn_id)?;
        info!("Connection {} closed", conn_id);
        Some(participant)
    }

    pub fn get(&self, conn_id: ConnId) -> Option<&Participant> {
        self.participants.get(&conn_id)
    }

    pub fn get_mut(&mut self, conn_id: ConnId) -> Option<&mut Participant> {
        self.participants.get_mut(&conn_id)
    }

    /// Attaches a connection to a game
    pub fn join(&mut self, conn_id: ConnId, session: SessionInfo, authenticated: bool) -> bool {
        match self.participants.get_mut(&conn_id) {
            Some(participant) => {
                debug!(
                    "Connection {} is player {} in game {}",
                    conn_id, session.player_id, session.game_id
                );
                participant.session = Some(session);
                participant.authenticated = authenticated;
                true
            }
            None => false,
        }
    }

    /// Connections attached to a game
    pub fn in_game(&self, game_id: &str) -> Vec<ConnId> {
        let mut members: Vec<ConnId> = self
            .participants
            .values()
            .filter(|participant| participant.game_id() == Some(game_id))
            .map(|participant| participant.conn_id)
            .collect();
        members.sort_unstable();
        members
    }

    pub fn send(&self, conn_id: ConnId, packet: Packet) {
        if let Some(participant) = self.participants.get(&conn_id) {
            if !participant.send(packet) {
                warn!("Connection {} is gone, dropping packet", conn_id);
            }
        }
    }

    /// Sends a packet to every member of a game except `exclude`
    pub fn broadcast(&self, game_id: &str, packet: &Packet, exclude: Option<ConnId>) {
        for conn_id in self.in_game(game_id) {
            if Some(conn_id) != exclude {
                self.send(conn_id, packet.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
