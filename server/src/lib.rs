//! # Position/Chat Synchronization Server
//!
//! This library implements the real-time core that keeps connected browser
//! clients informed of a shared world's mutable state: user positions and
//! chat. The surrounding web application (login, page rendering, asset
//! delivery) lives elsewhere; this crate only trusts the session-to-user
//! binding that application establishes and the user records it stores.
//!
//! ## Core Responsibilities
//!
//! ### Differential Broadcasting
//! Every accepted position update bumps a global version clock and stamps
//! the user with the new value. Each session keeps a per-user cursor of the
//! last version it was sent; the broadcast tick only pushes users whose
//! stored version is ahead of the cursor, so idle users cost no bandwidth.
//!
//! ### Minimal WebSocket Transport
//! Clients speak a deliberately small WebSocket subset: single unfragmented
//! text frames carrying one JSON object each. The handshake, framing and
//! message layers are isolated per module so a standard-conformant library
//! could replace the codec without touching dispatch.
//!
//! ### Best-Effort Persistence
//! Positions are periodically pulled from and pushed to the collaborator
//! datastore through a dedicated worker task, so datastore latency and
//! per-record failures never stall broadcasting or liveness probing.
//!
//! ## Architecture Design
//!
//! The reactor task exclusively owns the connection registry, the session
//! directory and the world state; nothing else touches them, so no locking
//! exists anywhere in the state path. Per-socket read and write tasks and
//! the store worker communicate with the reactor over bounded channels
//! only. A write that cannot be queued is treated as a disconnect.
//!
//! ## Module Organization
//!
//! - [`handshake`] — HTTP upgrade parsing, accept-token derivation and
//!   session cookie extraction.
//! - [`frame`] — the single-text-frame WebSocket codec.
//! - [`registry`] — live connections and their ephemeral state.
//! - [`directory`] — session bindings and per-session broadcast cursors.
//! - [`world`] — the authoritative user cache, global version clock and
//!   dirty tracking.
//! - [`store`] — the datastore contract, its Postgres and in-memory
//!   implementations, and the persistence worker.
//! - [`server`] — the reactor loop tying everything together.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use server::server::{ServerConfig, SyncServer};
//! use server::store::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = SyncServer::bind(
//!         "127.0.0.1:8080",
//!         ServerConfig::default(),
//!         Arc::new(MemoryStore::new()),
//!     )
//!     .await?;
//!
//!     // Runs the reactor: accepts sockets, dispatches messages and drives
//!     // the broadcast, keepalive and persistence ticks until killed.
//!     server.run().await
//! }
//! ```

pub mod directory;
pub mod frame;
pub mod handshake;
pub mod registry;
pub mod server;
pub mod store;
pub mod world;
