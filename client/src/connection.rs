//! The connection seen by topic engines
//!
//! Engines only need to know whether a session is live and to hand off
//! outbound batches. Transport concerns (framing, retries, reconnects) stay
//! with the implementation.

use log::{debug, warn};
use shared::{Entry, Packet, SessionInfo};
use std::cell::{Cell, RefCell};
use tokio::sync::mpsc;

pub trait Connection {
    /// True while a session is established with the relay
    fn connected(&self) -> bool;

    /// Best-effort send of one batch. No acknowledgment is reported.
    fn transmit(&self, entries: Vec<Entry>);
}

/// Connection state shared between the [`SyncClient`](crate::network::SyncClient)
/// event loop and every topic engine.
///
/// Outbound packets are queued on an unbounded channel drained by the event
/// loop, so transmitting never blocks the caller.
pub struct Link {
    connected: Cell<bool>,
    authenticated: Cell<bool>,
    session: RefCell<Option<SessionInfo>>,
    outbound: mpsc::UnboundedSender<Packet>,
}

impl Link {
    pub fn new(outbound: mpsc::UnboundedSender<Packet>) -> Self {
        Self {
            connected: Cell::new(false),
            authenticated: Cell::new(false),
            session: RefCell::new(None),
            outbound,
        }
    }

    pub fn session(&self) -> Option<SessionInfo> {
        self.session.borrow().clone()
    }

    /// This participant's id within the current game
    pub fn player_id(&self) -> Option<String> {
        self.session
            .borrow()
            .as_ref()
            .map(|session| session.player_id.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.get()
    }

    /// Asks the relay to grant write access to write-protected topics.
    /// The answer arrives asynchronously and updates [`Link::is_authenticated`].
    pub fn authenticate(&self, credential: impl Into<String>) {
        self.send(Packet::Auth {
            credential: credential.into(),
        });
    }

    pub(crate) fn establish(&self, session: SessionInfo, authenticated: bool) {
        *self.session.borrow_mut() = Some(session);
        self.authenticated.set(authenticated);
        self.connected.set(true);
    }

    /// Marks the link as down and returns the session that was active
    pub(crate) fn teardown(&self) -> Option<SessionInfo> {
        self.connected.set(false);
        self.authenticated.set(false);
        self.session.borrow_mut().take()
    }

    pub(crate) fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.set(authenticated);
    }

    fn send(&self, packet: Packet) {
        if !self.connected.get() {
            debug!("Dropping outbound packet while disconnected");
            return;
        }
        if let Err(e) = self.outbound.send(packet) {
            warn!("Failed to queue outbound packet: {}", e);
        }
    }
}

impl Connection for Link {
    fn connected(&self) -> bool {
        self.connected.get()
    }

    fn transmit(&self, entries: Vec<Entry>) {
        if entries.is_empty() {
            return;
        }
        self.send(Packet::Update {
            entries,
            full: false,
        });
    }
}
