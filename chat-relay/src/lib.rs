//! Line-oriented chat relay over TCP.
//!
//! Clients connect, pick a display name, and every line one of them sends is
//! relayed to everyone else currently connected. See `README.md` for usage
//! and the wire protocol.
//!
//! - [`registry`] tracks who is currently joined.
//! - [`broadcast`] fans a line out to a registry snapshot, skipping the sender
//!   and isolating per-recipient failures.
//! - [`session`] is the per-connection state machine: name negotiation, the
//!   relay loop, and a single teardown path.
//! - [`connection`] holds connection identity and the per-connection writer
//!   task that serializes socket writes.
//! - [`server`] accepts TCP connections and spawns one session per socket.
//! - [`client`] is the terminal client.
//! - [`message`] has the line framing and the text of every notice.
//! - [`cli`] parses the command line.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod connection;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
