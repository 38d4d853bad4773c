//! Cluster-wide queue registry: leader election, per-queue workers and
//! the replicated queue manager consulted by routing and transfers.

pub mod election;
pub mod manager;
pub mod queue;
