//! TCP session with the relay and the client event loop

use crate::connection::{Connection, Link};
use crate::dispatcher::Dispatcher;
use crate::observer::{IdSource, Registry, SubscriptionId};
use crate::topic::{Topic, TopicKey, TopicValue};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{CodecError, Entry, Packet, PacketCodec, SessionInfo, TopicPolicy, PROTOCOL_VERSION};
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::codec::Framed;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("rejected by relay: {0}")]
    Rejected(String),
    #[error("unexpected packet during handshake: {0}")]
    UnexpectedPacket(String),
    #[error("connection closed by relay")]
    ConnectionClosed,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay address, `host:port`
    pub server: String,
    /// Game to join. A fresh id is assigned by the relay if unset.
    pub game_id: Option<String>,
    /// Game credential granting write access to write-protected topics
    pub credential: Option<String>,
    /// Delay before reconnecting after the session is lost. `None` ends
    /// [`SyncClient::run`] on the first disconnect.
    pub reconnect_delay: Option<Duration>,
}

impl ClientConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            game_id: None,
            credential: None,
            reconnect_delay: None,
        }
    }
}

type PacketStream = Framed<TcpStream, PacketCodec>;

/// Relay's answer to a successful join
struct Handshake {
    framed: PacketStream,
    session: SessionInfo,
    is_first: bool,
    authenticated: bool,
    credential: Option<String>,
    snapshot: Vec<Entry>,
}

/// Why a session ended
enum SessionEnd {
    Shutdown,
    Lost,
}

/// Owns the connection to the relay and drives every registered topic.
///
/// Topics are created with [`SyncClient::topic`] before (or between)
/// sessions. The client and its topics are `!Send`; run them inside a
/// [`tokio::task::LocalSet`].
pub struct SyncClient {
    config: ClientConfig,
    link: Rc<Link>,
    outbound_rx: mpsc::UnboundedReceiver<Packet>,
    dispatcher: Rc<RefCell<Dispatcher>>,
    credential: Option<String>,
    ids: IdSource,
    joined: Registry<SessionInfo>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let credential = config.credential.clone();
        Self {
            config,
            link: Rc::new(Link::new(outbound_tx)),
            outbound_rx,
            dispatcher: Rc::new(RefCell::new(Dispatcher::new())),
            credential,
            ids: IdSource::new(),
            joined: Registry::new(),
        }
    }

    pub fn link(&self) -> Rc<Link> {
        Rc::clone(&self.link)
    }

    /// Credential received from or accepted by the relay in the last session
    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    /// Creates the engine for a topic and registers it for inbound delivery
    pub fn topic<K: TopicKey, V: TopicValue>(&self, name: &str, policy: TopicPolicy) -> Topic<K, V> {
        let topic = Topic::new(name, policy, self.link.clone());
        self.dispatcher
            .borrow_mut()
            .register(Rc::new(topic.clone()));
        topic
    }

    /// Registers a handler run after every topic has seen a new session.
    /// Later joiners have already applied the game snapshot at that point.
    pub fn on_joined(&self, handler: impl Fn(&SessionInfo) + 'static) -> SubscriptionId {
        let id = self.ids.next();
        self.joined.subscribe(id, Rc::new(handler));
        id
    }

    /// Runs sessions until `shutdown` resolves, or until the first session
    /// ends when no reconnect delay is configured.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<(), ClientError> {
        tokio::pin!(shutdown);

        loop {
            let result = self.session(shutdown.as_mut()).await;
            self.end_session();

            match result {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::Lost) => warn!("Session with {} lost", self.config.server),
                Err(e) => {
                    error!("Session with {} failed: {}", self.config.server, e);
                    if self.config.reconnect_delay.is_none() {
                        return Err(e);
                    }
                }
            }

            let Some(delay) = self.config.reconnect_delay else {
                return Ok(());
            };
            info!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = sleep(delay) => {},
                _ = shutdown.as_mut() => return Ok(()),
            }
        }
    }

    async fn session<F>(&mut self, mut shutdown: Pin<&mut F>) -> Result<SessionEnd, ClientError>
    where
        F: Future<Output = ()>,
    {
        let handshake = Self::handshake(&self.config, self.credential.clone());
        let Handshake {
            mut framed,
            session,
            is_first,
            authenticated,
            credential,
            snapshot,
        } = tokio::select! {
            joined = handshake => joined?,
            _ = shutdown.as_mut() => return Ok(SessionEnd::Shutdown),
        };
        info!(
            "Joined game {} as {}{}",
            session.game_id,
            session.player_id,
            if is_first { " (first participant)" } else { "" }
        );

        // Packets queued during the previous session are not replayed
        while self.outbound_rx.try_recv().is_ok() {}

        if let Some(credential) = credential {
            info!("Game credential: {}", credential);
            self.credential = Some(credential);
        } else if !authenticated && self.credential.take().is_some() {
            warn!("Credential refused by relay");
        }
        self.config.game_id = Some(session.game_id.clone());

        if !is_first {
            debug!("Applying snapshot of {} entries", snapshot.len());
            self.dispatcher.borrow().dispatch(snapshot, true);
        }
        self.link.establish(session.clone(), authenticated);
        self.dispatcher.borrow().connect(&session, is_first);
        self.joined.emit(&session);

        loop {
            tokio::select! {
                frame = framed.next() => match frame {
                    Some(Ok(packet)) => {
                        if !self.handle_packet(packet) {
                            return Ok(SessionEnd::Lost);
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(SessionEnd::Lost),
                },

                Some(packet) = self.outbound_rx.recv() => {
                    framed.send(packet).await?;
                },

                _ = shutdown.as_mut() => {
                    let _ = framed.send(Packet::Leave).await;
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }

    async fn handshake(
        config: &ClientConfig,
        credential: Option<String>,
    ) -> Result<Handshake, ClientError> {
        info!("Connecting to {}...", config.server);
        let stream = TcpStream::connect(&config.server).await?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, PacketCodec::new());

        framed
            .send(Packet::Join {
                protocol_version: PROTOCOL_VERSION,
                game_id: config.game_id.clone(),
                credential,
            })
            .await?;

        match framed.next().await {
            Some(Ok(Packet::Joined {
                session,
                is_first,
                authenticated,
                credential,
                snapshot,
            })) => Ok(Handshake {
                framed,
                session,
                is_first,
                authenticated,
                credential,
                snapshot,
            }),
            Some(Ok(Packet::Disconnected { reason })) => Err(ClientError::Rejected(reason)),
            Some(Ok(other)) => Err(ClientError::UnexpectedPacket(format!("{:?}", other))),
            Some(Err(e)) => Err(e.into()),
            None => Err(ClientError::ConnectionClosed),
        }
    }

    /// Returns false if the relay ended the session
    fn handle_packet(&self, packet: Packet) -> bool {
        match packet {
            Packet::Update { entries, full } => {
                debug!("Received {} entries (full: {})", entries.len(), full);
                self.dispatcher.borrow().dispatch(entries, full);
            }
            Packet::AuthResult { authenticated } => {
                info!("Authentication {}", if authenticated { "accepted" } else { "refused" });
                self.link.set_authenticated(authenticated);
            }
            Packet::Disconnected { reason } => {
                warn!("Disconnected by relay: {}", reason);
                return false;
            }
            other => warn!("Unexpected packet from relay: {:?}", other),
        }
        true
    }

    fn end_session(&mut self) {
        if !self.link.connected() && self.link.session().is_none() {
            return;
        }
        let session = self.link.teardown();
        self.dispatcher.borrow().disconnect(session.as_ref());
    }
}
