//! Data model and store façade for the copperline control plane.
//!
//! - **models**: agent, client and queue configuration records
//! - **message**: typed API commands, poll events and channel lifecycle
//!   events exchanged between the dispatcher, connection workers, agent
//!   FSMs and the queue layer
//! - **api**: the store façade over the external authentication and
//!   configuration stores, seeded from the service configuration

pub mod api;
pub mod message;
pub mod models;

pub use api::Database;
