//! Network gateways for environment migration.
//!
//! A node runs both halves: the client gateway ships suspended local
//! environments to a peer and forwards IPC that names a leased destination;
//! the server gateway reconstitutes incoming environments, arms them, and
//! reports completions back to the origin. One request travels per TCP
//! connection; the codec lives in [`wire`].

pub mod client;
pub mod demo;
pub mod node;
pub mod server;
pub mod wire;

/// Server-side lease capacity.
pub const SLEASES: usize = 5;

/// Client-side lease capacity.
pub const CLEASES: usize = 5;

/// Protocol retry budget for transient failures.
pub const RETRIES: u32 = 5;

/// Lease TTL in milliseconds; `BUSY` entries older than this are collected.
pub const GCTIME: u32 = 300_000;

/// Default server gateway port.
pub const SPORT: u16 = 7;

/// MTU-sized request buffer bound; every frame must fit.
pub const BUFFSIZE: usize = 1518;

/// Listen backlog.
pub const MAXPENDING: usize = 5;

pub use node::{Node, NodeConfig};
