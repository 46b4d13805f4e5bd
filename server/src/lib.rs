//! # Table Sync Relay Library
//!
//! This library provides the authoritative relay for the multi-topic state
//! sync engine. Participants connect over TCP, join a game and exchange
//! entry batches; the relay keeps the canonical state of every game and
//! fans changes out to the other participants.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative State
//! Every game stores the last value of each non-ephemeral key together with
//! the policies its participants declared. Joining participants receive the
//! whole state as a full snapshot inside their `Joined` reply.
//!
//! ### Policy Enforcement
//! Topic policies are declared by the first participant of a game. The relay
//! enforces them on every batch:
//! - Writes to write-protected topics require the game credential
//! - Values of topics with a unique field may not share that field
//! - Ephemeral topics are relayed but never stored
//! - Per-participant keys are retracted when their owner leaves
//!
//! A batch violating any of these is rejected as a whole, and the sender
//! receives the authoritative values of the keys it touched.
//!
//! ### Participant Management
//! Handles the lifecycle of connections: capacity limits, game membership,
//! authentication and cleanup when a connection goes away.
//!
//! ## Architecture Design
//!
//! ### Single Event Loop
//! Each connection is owned by its own task that only moves packets between
//! the socket and channels. All state changes happen sequentially in one
//! event loop, so games need no locking and every participant observes
//! batches in the order the relay applied them.
//!
//! ### Framing
//! Packets are bincode encoded inside length-delimited frames (see
//! `shared::codec`), so batches are delivered whole and in order.
//!
//! ## Module Organization
//!
//! - `participants`: connection registry and outbound routing
//! - `game`: per-game state, validation and snapshots
//! - `network`: listener, connection tasks and the event loop
//! - `utils`: id and credential helpers
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Relay on the default port accepting up to 64 connections
//!     let mut server = Server::new("127.0.0.1:1235", 64).await?;
//!     server.run().await;
//!     Ok(())
//! }
//! ```

pub mod game;
pub mod network;
pub mod participants;
pub mod utils;
