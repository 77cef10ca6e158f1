//! Multi-client line chat relay over plain TCP.
//!
//! Clients send a nickname as their first line, then chat lines that are
//! relayed to everyone else, whispers addressed to one nickname, or the quit
//! command. Each module focuses on a concrete responsibility:
//!
//! - [`connection`] frames a socket into lines and serializes writes to it.
//! - [`registry`] is the shared directory of registered connections and the
//!   only state touched by more than one task.
//! - [`protocol`] parses client lines and formats server lines.
//! - [`relay`] fans messages out (broadcast, whisper) and evicts dead peers.
//! - [`session`] runs one connection from nickname to teardown.
//! - [`server`] accepts connections and spawns a session for each.
//! - [`client`] is a small terminal front end; [`cli`] parses arguments for
//!   both modes.

pub mod cli;
pub mod client;
pub mod connection;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
