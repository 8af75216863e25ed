//! # Audio Module
//!
//! Everything that touches sound on the server side.
//!
//! ## Key Components:
//! - **Sink**: drives the external player, either fed live through stdin or on whole files
//! - **Chime**: synthesizes the alert played before each queued message
//! - **Loudnorm**: optional two-pass loudness normalization of recordings
//! - **Store**: temporary directory holding recordings until they are played
//!
//! ## Audio Format:
//! Clients send WebM/Opus as produced by the browser's `MediaRecorder`.
//! The server never decodes it; the player and encoder do.

pub mod chime;
pub mod loudnorm;
pub mod sink;
pub mod store;
