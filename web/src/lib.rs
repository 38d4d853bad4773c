//! The web front door: session table, RSA login handshake, per-agent
//! connection workers and the HTTP dispatcher.

pub mod connection;
pub mod crypto;
pub mod server;
pub mod session;
