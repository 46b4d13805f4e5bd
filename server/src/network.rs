//! Relay network layer: TCP connections and the single event loop

use crate::game::Game;
use crate::participants::{ConnId, ParticipantManager};
use crate::utils::{random_id, GAME_ID_LENGTH};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{Entry, Packet, PacketCodec, SessionInfo, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

/// Messages sent from connection tasks to the main loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { conn_id: ConnId, packet: Packet },
    ConnectionClosed { conn_id: ConnId },
}

/// Relay keeping the authoritative state of every game
pub struct Server {
    listener: TcpListener,
    participants: ParticipantManager,
    games: HashMap<String, Game>,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    pub async fn new(addr: &str, max_participants: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Ok(Server {
            listener,
            participants: ParticipantManager::new(max_participants),
            games: HashMap::new(),
            server_tx,
            server_rx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of games currently open
    pub fn game_count(&self) -> usize {
        self.games.len()
    }

    /// Main loop: accepts connections and processes their packets in order
    pub async fn run(&mut self) {
        info!("Relay started successfully");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.accept(stream, addr),
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },

                Some(message) = self.server_rx.recv() => match message {
                    ServerMessage::PacketReceived { conn_id, packet } => {
                        self.handle_packet(conn_id, packet);
                    }
                    ServerMessage::ConnectionClosed { conn_id } => {
                        self.handle_disconnect(conn_id);
                    }
                },
            }
        }
    }

    fn accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        match self.participants.add(addr, out_tx) {
            Some(conn_id) => self.spawn_connection(conn_id, stream, out_rx),
            None => {
                warn!("Rejecting {}: relay full", addr);
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, PacketCodec::new());
                    let _ = framed
                        .send(Packet::Disconnected {
                            reason: "Server full".to_string(),
                        })
                        .await;
                });
            }
        }
    }

    /// Spawns the task owning one connection. It forwards inbound packets
    /// to the main loop and writes queued outbound packets until the
    /// participant is removed or the peer goes away.
    fn spawn_connection(
        &self,
        conn_id: ConnId,
        stream: TcpStream,
        mut out_rx: mpsc::UnboundedReceiver<Packet>,
    ) {
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut framed = Framed::new(stream, PacketCodec::new());

            loop {
                tokio::select! {
                    outbound = out_rx.recv() => match outbound {
                        Some(packet) => {
                            if let Err(e) = framed.send(packet).await {
                                warn!("Failed to send to connection {}: {}", conn_id, e);
                                break;
                            }
                        }
                        None => break,
                    },

                    inbound = framed.next() => match inbound {
                        Some(Ok(packet)) => {
                            if server_tx.send(ServerMessage::PacketReceived { conn_id, packet }).is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!("Dropping connection {}: {}", conn_id, e);
                            break;
                        }
                        None => break,
                    },
                }
            }

            let _ = server_tx.send(ServerMessage::ConnectionClosed { conn_id });
        });
    }

    fn handle_packet(&mut self, conn_id: ConnId, packet: Packet) {
        match packet {
            Packet::Join {
                protocol_version,
                game_id,
                credential,
            } => self.handle_join(conn_id, protocol_version, game_id, credential),

            Packet::Auth { credential } => {
                let Some(session) = self.session_of(conn_id) else {
                    warn!("Auth from connection {} before joining", conn_id);
                    return;
                };
                let authenticated = self
                    .games
                    .get(&session.game_id)
                    .map_or(false, |game| game.check_credential(&credential));
                if let Some(participant) = self.participants.get_mut(conn_id) {
                    participant.authenticated = authenticated;
                }
                info!(
                    "Player {} authentication {}",
                    session.player_id,
                    if authenticated { "accepted" } else { "refused" }
                );
                self.participants
                    .send(conn_id, Packet::AuthResult { authenticated });
            }

            Packet::Update { entries, full } => {
                if full {
                    debug!("Ignoring full flag from connection {}", conn_id);
                }
                self.handle_update(conn_id, entries);
            }

            Packet::Leave => self.handle_disconnect(conn_id),

            other => {
                warn!("Unexpected packet from connection {}: {:?}", conn_id, other);
            }
        }
    }

    fn handle_join(
        &mut self,
        conn_id: ConnId,
        protocol_version: u32,
        game_id: Option<String>,
        credential: Option<String>,
    ) {
        if self.session_of(conn_id).is_some() {
            warn!("Connection {} tried to join twice", conn_id);
            return;
        }

        if protocol_version != PROTOCOL_VERSION {
            warn!(
                "Connection {} uses protocol {} (expected {})",
                conn_id, protocol_version, PROTOCOL_VERSION
            );
            self.participants.send(
                conn_id,
                Packet::Disconnected {
                    reason: format!("Unsupported protocol version {}", protocol_version),
                },
            );
            self.participants.remove(conn_id);
            return;
        }

        let game_id = game_id.unwrap_or_else(|| loop {
            let id = random_id(GAME_ID_LENGTH);
            if !self.games.contains_key(&id) {
                break id;
            }
        });

        let is_first = !self.games.contains_key(&game_id);
        let game = self.games.entry(game_id.clone()).or_insert_with(|| {
            info!("Game {} created", game_id);
            Game::new(game_id.clone())
        });

        let player_id = game.add_player();
        let authenticated =
            is_first || credential.map_or(false, |credential| game.check_credential(&credential));
        let session = SessionInfo {
            game_id: game_id.clone(),
            player_id,
        };

        let snapshot = if is_first { Vec::new() } else { game.snapshot() };
        debug!(
            "Sending {} snapshot entries of game {} to connection {}",
            snapshot.len(),
            game_id,
            conn_id
        );

        self.participants
            .join(conn_id, session.clone(), authenticated);
        self.participants.send(
            conn_id,
            Packet::Joined {
                session,
                is_first,
                authenticated,
                credential: is_first.then(|| game.credential().to_string()),
                snapshot,
            },
        );
    }

    fn handle_update(&mut self, conn_id: ConnId, entries: Vec<Entry>) {
        let Some(participant) = self.participants.get(conn_id) else {
            return;
        };
        let authenticated = participant.authenticated;
        let Some(session) = participant.session.clone() else {
            warn!("Update from connection {} before joining", conn_id);
            return;
        };
        let Some(game) = self.games.get_mut(&session.game_id) else {
            return;
        };

        if let Err(e) = game.apply(&entries, authenticated) {
            warn!("Rejected batch from player {}: {}", session.player_id, e);
            let restored = game.restore(&entries);
            if !restored.is_empty() {
                self.participants.send(
                    conn_id,
                    Packet::Update {
                        entries: restored,
                        full: false,
                    },
                );
            }
            return;
        }

        let echo: Vec<Entry> = entries
            .iter()
            .filter(|entry| matches!(entry, Entry::Data(_)) && game.is_write_protected(entry.topic()))
            .cloned()
            .collect();

        self.participants.broadcast(
            &session.game_id,
            &Packet::Update {
                entries,
                full: false,
            },
            Some(conn_id),
        );
        if !echo.is_empty() {
            self.participants.send(
                conn_id,
                Packet::Update {
                    entries: echo,
                    full: false,
                },
            );
        }
    }

    fn handle_disconnect(&mut self, conn_id: ConnId) {
        let Some(participant) = self.participants.remove(conn_id) else {
            return;
        };
        let Some(session) = participant.session else {
            return;
        };
        let Some(game) = self.games.get_mut(&session.game_id) else {
            return;
        };

        let retracted = game.remove_player(&session.player_id);
        if game.is_empty() {
            info!("Game {} closed", session.game_id);
            self.games.remove(&session.game_id);
            return;
        }

        if !retracted.is_empty() {
            self.participants.broadcast(
                &session.game_id,
                &Packet::Update {
                    entries: retracted,
                    full: false,
                },
                None,
            );
        }
    }

    fn session_of(&self, conn_id: ConnId) -> Option<SessionInfo> {
        self.participants
            .get(conn_id)
            .and_then(|participant| participant.session.clone())
    }
}
