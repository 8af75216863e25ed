//! # Application State
//!
//! Shared by every HTTP handler and WebSocket session through `web::Data`.
//! Configuration is immutable after startup, so it sits behind a plain `Arc`;
//! the mutable pieces (registry, broadcaster, queue) synchronize themselves.

use crate::config::{AppConfig, IntercomMode};
use crate::intercom::broadcast::Broadcaster;
use crate::intercom::queue::QueueService;
use crate::intercom::registry::ConnectionRegistry;
use actix::Addr;
use std::sync::Arc;
use std::time::Instant;

/// The delivery mode chosen at startup, with the handle that drives it.
#[derive(Clone)]
pub enum Intercom {
    Live(Addr<Broadcaster>),
    Queue(QueueService),
}

impl Intercom {
    pub fn mode(&self) -> IntercomMode {
        match self {
            Intercom::Live(_) => IntercomMode::Live,
            Intercom::Queue(_) => IntercomMode::Queue,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ConnectionRegistry>,
    pub intercom: Intercom,
    /// Never changes, so no lock.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, registry: Arc<ConnectionRegistry>, intercom: Intercom) -> Self {
        Self {
            config,
            registry,
            intercom,
            start_time: Instant::now(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
