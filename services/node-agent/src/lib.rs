//! nave node agent library.
//!
//! The agent runs on each exit node. It registers with the control plane,
//! polls its desired WireGuard configuration, applies it when the content
//! hash changes, and reports status after every cycle.

pub mod client;
pub mod config;
pub mod error;
pub mod reconciler;
pub mod wireguard;
