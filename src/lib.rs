//! Authoritative server for a turnless real-time strategy game.
//!
//! Clients connect over raw TCP (length-prefixed binary frames) or
//! WebSocket (JSON text frames), join a lobby, and start a game on a
//! procedurally generated map. From then on they issue actions against
//! their units; every unit runs its queued actions through a serialized
//! pipeline that pays resource costs up front, works in real time, and
//! reports each lifecycle step back to the owning client.
//!
//! The crate splits along those seams:
//! - [`api`]: the wire wrappers and the two serialization schemas.
//! - [`net`]: framing and the TCP/WebSocket client adapters.
//! - [`server`]: the client set, broadcast, and the two protocol phases.
//! - [`game`]: map, players, economy and the per-unit action pipeline.
//! - [`rules`]: the immutable type catalog and the action executors.
//! - [`generator`]: noise-driven map construction.

pub mod api;
pub mod game;
pub mod generator;
pub mod net;
pub mod rules;
pub mod server;
pub mod util;
