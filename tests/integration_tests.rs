//! Integration tests for the relay and sync clients
//!
//! These tests run a real relay on loopback and drive real clients against
//! it, checking what every participant ends up seeing.

use client::{ClientConfig, ClientError, Connection, Link, SyncClient, Topic};
use serde::{Deserialize, Serialize};
use server::network::Server;
use shared::{PolicyOption, TopicPolicy};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, LocalSet};
use tokio::time::sleep;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SeatInfo {
    seat: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThingInfo {
    slot_name: String,
}

/// One participant's topics plus its running client
struct Peer {
    link: Rc<Link>,
    things: Topic<u32, ThingInfo>,
    seats: Topic<String, SeatInfo>,
    nicks: Topic<String, String>,
    mouse: Topic<String, (i32, i32)>,
    spectators: Topic<String, String>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), ClientError>>>,
}

impl Peer {
    fn new(addr: SocketAddr, game: &str) -> (SyncClient, Peer) {
        Peer::with_credential(addr, game, None)
    }

    fn with_credential(addr: SocketAddr, game: &str, credential: Option<&str>) -> (SyncClient, Peer) {
        let mut config = ClientConfig::new(addr.to_string());
        config.game_id = Some(game.to_string());
        config.credential = credential.map(str::to_string);
        let client = SyncClient::new(config);

        let peer = Peer {
            link: client.link(),
            things: client.topic(
                "things",
                TopicPolicy::new().unique_key("slotName").send_on_connect(),
            ),
            seats: client.topic("seats", TopicPolicy::new().unique_key("seat").per_participant()),
            nicks: client.topic("nicks", TopicPolicy::new().per_participant()),
            mouse: client.topic(
                "mouse",
                TopicPolicy::new()
                    .rate_limit(Duration::from_millis(50))
                    .per_participant(),
            ),
            spectators: client.topic("spectators", TopicPolicy::new().per_participant()),
            stop: None,
            task: None,
        };
        (client, peer)
    }

    /// Starts the client and waits until it joined the game
    async fn launch(mut self, mut client: SyncClient) -> Peer {
        let (stop, stopped) = oneshot::channel::<()>();
        self.stop = Some(stop);
        self.task = Some(tokio::task::spawn_local(async move {
            client
                .run(async move {
                    let _ = stopped.await;
                })
                .await
        }));

        let link = Rc::clone(&self.link);
        wait_until("join", move || link.player_id().is_some()).await;
        self
    }

    fn id(&self) -> String {
        self.link.player_id().expect("peer is not connected")
    }

    async fn leave(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let result = task.await.expect("client task panicked");
            assert!(result.is_ok(), "client ended with {:?}", result);
        }
    }
}

async fn start_relay() -> SocketAddr {
    let mut server = Server::new("127.0.0.1:0", 16).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move { server.run().await });
    addr
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(10)).await;
    }
}

fn thing(slot_name: &str) -> Option<ThingInfo> {
    Some(ThingInfo {
        slot_name: slot_name.to_string(),
    })
}

/// BOOTSTRAP TESTS
mod bootstrap_tests {
    use super::*;

    /// The first participant seeds the relay; a later joiner receives it
    #[tokio::test]
    async fn first_participant_seeds_later_joiners() {
        LocalSet::new()
            .run_until(async {
                let addr = start_relay().await;

                let (client, alice) = Peer::new(addr, "bootstrap");
                alice.things.set(1, thing("wall.0"));
                alice.things.set(2, thing("wall.1"));
                let mut alice = alice.launch(client).await;

                let (client, bob) = Peer::new(addr, "bootstrap");
                bob.things.set(9, thing("stale"));
                let mut bob = bob.launch(client).await;

                let things = bob.things.clone();
                wait_until("snapshot", move || things.len() == 2).await;
                assert_eq!(bob.things.get(&1), thing("wall.0"));
                assert_eq!(bob.things.get(&2), thing("wall.1"));
                assert_eq!(bob.things.get(&9), None);

                bob.leave().await;
                alice.leave().await;
            })
            .await;
    }

    /// Writes made while joining are kept after the snapshot is applied
    #[tokio::test]
    async fn joined_handlers_survive_the_snapshot() {
        LocalSet::new()
            .run_until(async {
                let addr = start_relay().await;

                let (client, alice) = Peer::new(addr, "nick");
                alice.things.set(1, thing("wall.0"));
                let mut alice = alice.launch(client).await;

                let (client, bob) = Peer::new(addr, "nick");
                let nicks = bob.nicks.clone();
                client.on_joined(move |session| {
                    nicks.set(session.player_id.clone(), Some("bob".to_string()));
                });
                let mut bob = bob.launch(client).await;

                assert_eq!(bob.things.get(&1), thing("wall.0"));
                sleep(Duration::from_millis(100)).await;
                assert_eq!(bob.nicks.get(&bob.id()), Some("bob".to_string()));

                let nicks = alice.nicks.clone();
                let bob_id = bob.id();
                wait_until("bob's nick", move || nicks.get(&bob_id) == Some("bob".to_string())).await;

                bob.leave().await;
                alice.leave().await;
            })
            .await;
    }

    /// Different games never see each other's state
    #[tokio::test]
    async fn games_are_isolated() {
        LocalSet::new()
            .run_until(async {
                let addr = start_relay().await;

                let (client, alice) = Peer::new(addr, "one");
                let mut alice = alice.launch(client).await;
                let (client, bob) = Peer::new(addr, "two");
                let mut bob = bob.launch(client).await;
                let (client, carol) = Peer::new(addr, "one");
                let mut carol = carol.launch(client).await;

                bob.nicks.set(bob.id(), Some("bob".to_string()));
                alice.nicks.set(alice.id(), Some("alice".to_string()));

                let nicks = carol.nicks.clone();
                let alice_id = alice.id();
                wait_until("alice's nick", move || nicks.get(&alice_id).is_some()).await;
                assert_eq!(carol.nicks.len(), 1);

                carol.leave().await;
                bob.leave().await;
                alice.leave().await;
            })
            .await;
    }
}

/// LIVE UPDATE TESTS
mod update_tests {
    use super::*;

    /// Writes are applied optimistically and relayed to others
    #[tokio::test]
    async fn updates_reach_other_participants() {
        LocalSet::new()
            .run_until(async {
                let addr = start_relay().await;
                let (client, alice) = Peer::new(addr, "updates");
                let mut alice = alice.launch(client).await;
                let (client, bob) = Peer::new(addr, "updates");
                let mut bob = bob.launch(client).await;

                alice.nicks.set(alice.id(), Some("alice".to_string()));
                assert_eq!(alice.nicks.get(&alice.id()), Some("alice".to_string()));

                let nicks = bob.nicks.clone();
                let alice_id = alice.id();
                wait_until("nick", move || nicks.get(&alice_id) == Some("alice".to_string())).await;

                alice.nicks.set(alice.id(), None);
                let nicks = bob.nicks.clone();
                wait_until("deletion", move || nicks.is_empty()).await;

                bob.leave().await;
                alice.leave().await;
            })
            .await;
    }

    /// Rate-limited topics still deliver the last write
    #[tokio::test]
    async fn rate_limited_topic_delivers_last_write() {
        LocalSet::new()
            .run_until(async {
                let addr = start_relay().await;
                let (client, alice) = Peer::new(addr, "mouse");
                let mut alice = alice.launch(client).await;
                let (client, bob) = Peer::new(addr, "mouse");
                let mut bob = bob.launch(client).await;

                assert!(alice.mouse.is_flush_timer_active());
                for x in 0..20 {
                    alice.mouse.set(alice.id(), Some((x, -x)));
                }

                let mouse = bob.mouse.clone();
                let alice_id = alice.id();
                wait_until("last mouse position", move || {
                    mouse.get(&alice_id) == Some((19, -19))
                })
                .await;

                bob.leave().await;
                alice.leave().await;
                assert!(!alice.mouse.is_flush_timer_active());
            })
            .await;
    }
}

/// POLICY ENFORCEMENT TESTS
mod policy_tests {
    use super::*;

    /// Write-protected topics only change once the relay echoes the write
    #[tokio::test]
    async fn write_protected_writes_are_echoed() {
        LocalSet::new()
            .run_until(async {
                let addr = start_relay().await;
                let (client, alice) = Peer::new(addr, "protected");
                let mut alice = alice.launch(client).await;
                let (client, bob) = Peer::new(addr, "protected");
                let mut bob = bob.launch(client).await;

                assert!(alice.link.is_authenticated());
                assert!(!bob.link.is_authenticated());

                assert_eq!(
                    alice
                        .spectators
                        .set_policy_option(PolicyOption::WriteProtected(true)),
                    Ok(true)
                );
                let spectators = bob.spectators.clone();
                wait_until("protection", move || spectators.policy().is_write_protected()).await;

                alice.spectators.set(alice.id(), Some("alice".to_string()));
                let spectators = alice.spectators.clone();
                let alice_id = alice.id();
                wait_until("echo", move || spectators.get(&alice_id).is_some()).await;

                let spectators = bob.spectators.clone();
                let alice_id = alice.id();
                wait_until("relay", move || spectators.get(&alice_id).is_some()).await;

                // Not authenticated: never applied locally, refused upstream
                bob.spectators.set(bob.id(), Some("bob".to_string()));
                assert_eq!(bob.spectators.get(&bob.id()), None);
                sleep(Duration::from_millis(100)).await;
                assert_eq!(alice.spectators.get(&bob.id()), None);
                assert_eq!(bob.spectators.get(&bob.id()), None);

                bob.leave().await;
                alice.leave().await;
            })
            .await;
    }

    /// Only a credential the relay accepts authenticates a later joiner
    #[tokio::test]
    async fn join_credential_is_checked_by_the_relay() {
        LocalSet::new()
            .run_until(async {
                let addr = start_relay().await;
                let (client, alice) = Peer::new(addr, "credential");
                let mut alice = alice.launch(client).await;
                assert!(alice.link.is_authenticated());

                let (client, mallory) = Peer::with_credential(addr, "credential", Some("wrong"));
                let mut mallory = mallory.launch(client).await;
                assert!(!mallory.link.is_authenticated());

                // The relay refuses the toggle and restores the declared policy
                assert_eq!(
                    mallory
                        .spectators
                        .set_policy_option(PolicyOption::WriteProtected(true)),
                    Ok(true)
                );
                let spectators = mallory.spectators.clone();
                wait_until("policy restored", move || !spectators.policy().is_write_protected()).await;
                assert!(!alice.spectators.policy().is_write_protected());

                mallory.leave().await;
                alice.leave().await;
            })
            .await;
    }

    /// A taken unique value is refused and the sender is corrected
    #[tokio::test]
    async fn unique_collision_is_rolled_back() {
        LocalSet::new()
            .run_until(async {
                let addr = start_relay().await;
                let (client, alice) = Peer::new(addr, "unique");
                let mut alice = alice.launch(client).await;
                let (client, bob) = Peer::new(addr, "unique");
                let mut bob = bob.launch(client).await;

                alice.seats.set(alice.id(), Some(SeatInfo { seat: Some(0) }));
                let seats = bob.seats.clone();
                let alice_id = alice.id();
                wait_until("alice seated", move || seats.get(&alice_id).is_some()).await;

                bob.seats.set(bob.id(), Some(SeatInfo { seat: Some(0) }));
                assert!(bob.seats.get(&bob.id()).is_some());

                let seats = bob.seats.clone();
                let bob_id = bob.id();
                wait_until("rollback", move || seats.get(&bob_id).is_none()).await;
                assert_eq!(alice.seats.get(&bob.id()), None);

                bob.seats.set(bob.id(), Some(SeatInfo { seat: Some(1) }));
                let seats = alice.seats.clone();
                let bob_id = bob.id();
                wait_until("bob seated", move || {
                    seats.get(&bob_id) == Some(SeatInfo { seat: Some(1) })
                })
                .await;

                bob.leave().await;
                alice.leave().await;
            })
            .await;
    }
}

/// LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;

    /// Leaving retracts per-participant keys everywhere
    #[tokio::test]
    async fn leaving_retracts_per_participant_keys() {
        LocalSet::new()
            .run_until(async {
                let addr = start_relay().await;
                let (client, alice) = Peer::new(addr, "leave");
                let mut alice = alice.launch(client).await;
                let (client, bob) = Peer::new(addr, "leave");
                let mut bob = bob.launch(client).await;
                let bob_id = bob.id();

                bob.things.set(7, thing("hand.1"));
                bob.nicks.set(bob_id.clone(), Some("bob".to_string()));
                let nicks = alice.nicks.clone();
                let id = bob_id.clone();
                wait_until("bob's nick", move || nicks.get(&id).is_some()).await;

                bob.leave().await;

                assert!(bob.nicks.is_empty());
                assert_eq!(bob.nicks.last_offline(), Some((bob_id.clone(), "bob".to_string())));
                assert!(!bob.link.connected());

                let nicks = alice.nicks.clone();
                wait_until("retraction", move || nicks.is_empty()).await;
                // Shared topics keep what the participant wrote
                assert_eq!(alice.things.get(&7), thing("hand.1"));

                alice.leave().await;
            })
            .await;
    }

    /// A game closes with its last participant; the next joiner seeds it anew
    #[tokio::test]
    async fn empty_game_starts_fresh() {
        LocalSet::new()
            .run_until(async {
                let addr = start_relay().await;
                let (client, alice) = Peer::new(addr, "fresh");
                alice.things.set(1, thing("wall.0"));
                let mut alice = alice.launch(client).await;
                alice.leave().await;
                sleep(Duration::from_millis(200)).await;

                let (client, bob) = Peer::new(addr, "fresh");
                let mut bob = bob.launch(client).await;
                // First participant again: authenticated, and nothing left over
                assert!(bob.link.is_authenticated());
                sleep(Duration::from_millis(50)).await;
                assert!(bob.things.is_empty());

                bob.leave().await;
            })
            .await;
    }

    /// A client pointed at a closed port reports the failure
    #[tokio::test]
    async fn unreachable_relay() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = SyncClient::new(ClientConfig::new(addr.to_string()));
        let result = client.run(std::future::pending()).await;

        assert!(matches!(result, Err(ClientError::Io(_))));
    }
}
