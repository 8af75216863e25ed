//! # Intercom Core
//!
//! The two delivery modes and what they share.
//!
//! - **registry**: who is connected and how to reach them
//! - **protocol**: JSON control messages on the WebSocket
//! - **broadcast**: live mode, one speaker at a time straight to the player
//! - **queue**: store-and-forward mode, recordings played in arrival order

pub mod broadcast;
pub mod protocol;
pub mod queue;
pub mod registry;
