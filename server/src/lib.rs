//! # State Sync Server Library
//!
//! Authoritative server for a shared 3D world. Clients send intent (sequenced
//! movement inputs), the server owns every position, and the resulting world
//! is pushed back to all endpoints as throttled JSON snapshots over UDP.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Movement
//! Inputs are integrated with a fixed step, clamped to the world bounds and
//! rejected when stale, too frequent or issued during a server authority
//! window (right after a teleport).
//!
//! ### Session Management
//! Each UDP endpoint gets a session on first contact. A session controls at
//! most one entity and is dropped after a period of silence.
//!
//! ### Bots
//! Server-owned bots run a small behavior machine (Idle, Random, Follow,
//! Patrol) on a fixed timer, with a per-tick cap on how many are advanced.
//!
//! ### State Broadcasting
//! Snapshots go out at most once per throttle interval, which widens as the
//! world grows. Above a safety ceiling only named entities are sent.
//!
//! ### Administration
//! Admin clients can spawn NPCs and bots, steer bots, teleport and kick
//! entities, and run benchmark spawns.
//!
//! ## Module Organization
//!
//! - `entity`, `entity_store`: entity records and the concurrent store
//! - `session`: endpoint sessions and liveness
//! - `movement`: input validation and integration
//! - `bots`: bot behaviors and the bot tick
//! - `broadcast`: throttling, snapshot building and metrics
//! - `admin`: privileged commands
//! - `game`: the service tying everything together and routing messages
//! - `transport`, `network`: outbound delivery and the UDP tasks
//! - `config`, `error`: tunables, CLI arguments and error types
//!
//! ## Concurrency
//!
//! Entities and sessions live in sharded concurrent maps. Receive workers,
//! the bot loop and the timeout checker all run as tokio tasks sharing one
//! [`game::Game`]. Socket writes happen on a dedicated sender task, never
//! while entity or session state is locked.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), server::error::ServerError> {
//!     let config = ServerConfig {
//!         bind_addr: "0.0.0.0:8080".to_string(),
//!         ..ServerConfig::default()
//!     };
//!     Server::new(config).await?.run().await
//! }
//! ```

pub mod admin;
pub mod bots;
pub mod broadcast;
pub mod config;
pub mod entity;
pub mod entity_store;
pub mod error;
pub mod game;
pub mod movement;
pub mod network;
pub mod session;
pub mod transport;
