//! # Table Sync Client Library
//!
//! This library provides the client side of the multi-topic state sync
//! engine. A single connection to the relay carries many named topics, each
//! with its own delivery policy, and every participant of a game sees the
//! same keyed state for every topic.
//!
//! ## Architecture Overview
//!
//! ### Topic Engines
//! Each named topic is driven by a [`Topic`] engine that owns the local
//! cache, a coalescing buffer of pending writes and the topic's
//! [`TopicPolicy`](shared::TopicPolicy). Local writes are applied
//! optimistically unless the topic is write-protected, in which case the
//! cache only changes once the relay echoes the write back.
//!
//! ### Rate Limiting
//! Topics with a rate limit buffer writes between flushes. A per-topic
//! flush timer runs while the session is live and is cancelled as soon as
//! the session ends, so nothing is ever flushed against a dead connection.
//!
//! ### Dispatch
//! Inbound batches may mix entries for several topics. The [`Dispatcher`]
//! splits them per topic (keeping order within a topic) and hands each
//! group to the matching engine. It also fans connect and disconnect
//! events out to every engine.
//!
//! ### Lifecycle
//! When this participant is the first one in a game it seeds the relay with
//! policy declarations and, for send-on-connect topics, its local cache.
//! On disconnect, per-participant topics retract every key and report this
//! participant's last value as an offline marker.
//!
//! ## Module Organization
//!
//! - `connection`: the [`Connection`] seen by engines and the TCP-backed [`Link`]
//! - `topic`: the [`Topic`] engine, its key/value traits and notifications
//! - `dispatcher`: inbound fan-out and lifecycle fan-out
//! - `network`: the [`SyncClient`] event loop talking to the relay
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::{ClientConfig, SyncClient, Topic};
//! use shared::TopicPolicy;
//!
//! # async fn demo() -> Result<(), client::ClientError> {
//! let mut client = SyncClient::new(ClientConfig::new("127.0.0.1:1235"));
//! let nicks: Topic<String, String> =
//!     client.topic("nicks", TopicPolicy::new().per_participant());
//!
//! nicks.on_update(|update| {
//!     for (player, nick) in &update.entries {
//!         println!("{} is now {:?}", player, nick);
//!     }
//! });
//!
//! client.run(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Engines and the client are single-threaded (`Rc` based) and must run on
//! a [`tokio::task::LocalSet`] when rate-limited topics are used.

pub mod connection;
pub mod dispatcher;
pub mod network;
mod observer;
pub mod topic;

pub use connection::{Connection, Link};
pub use dispatcher::Dispatcher;
pub use network::{ClientConfig, ClientError, SyncClient};
pub use observer::SubscriptionId;
pub use topic::{Topic, TopicError, TopicKey, TopicSink, TopicUpdate, TopicValue};
