//! # Live Broadcast Arbitration
//!
//! A single actor owns the one live channel to the speaker. All requests,
//! stops, audio frames and disconnects arrive as messages, so every state
//! change happens in one place and in arrival order.
//!
//! ## Lifecycle:
//! 1. `RequestBroadcast` while idle opens a player stream and arms the timeout
//! 2. `AudioFrame`s from the holder are fed to the player; others are ignored
//! 3. Stop, disconnect, timeout or a broken player pipe end the session
//!
//! Every transition is announced to all clients with a `state_update`.

use crate::audio::sink::{FeedStatus, PlaybackSink, StreamHandle};
use crate::intercom::protocol::{BroadcastState, EndReason, ServerMessage};
use crate::intercom::registry::{ClientId, ConnectionRegistry};
use actix::prelude::*;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const DENIED_BUSY: &str = "another user is broadcasting";
const DENIED_UNAVAILABLE: &str = "audio output unavailable";

/// A client connected; everyone gets the current state.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Join {
    pub client_id: ClientId,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct RequestBroadcast {
    pub client_id: ClientId,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct StopBroadcast {
    pub client_id: ClientId,
}

/// A client disconnected.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Leave {
    pub client_id: ClientId,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct AudioFrame {
    pub client_id: ClientId,
    pub data: Vec<u8>,
}

#[derive(Message)]
#[rtype(result = "BroadcastState")]
pub struct GetState;

/// End whatever is playing; sent at shutdown.
#[derive(Message)]
#[rtype(result = "()")]
pub struct EndBroadcast;

enum Slot {
    Idle,
    Active {
        holder: ClientId,
        started_at: Instant,
        timer: SpawnHandle,
        stream: StreamHandle,
    },
}

pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    sink: PlaybackSink,
    timeout: Duration,
    slot: Slot,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, sink: PlaybackSink, timeout: Duration) -> Self {
        Self {
            registry,
            sink,
            timeout,
            slot: Slot::Idle,
        }
    }

    fn state(&self) -> BroadcastState {
        match &self.slot {
            Slot::Idle => BroadcastState::idle(),
            Slot::Active {
                holder, started_at, ..
            } => {
                let remaining = self.timeout.saturating_sub(started_at.elapsed());
                BroadcastState {
                    is_active: true,
                    active_client: Some(holder.clone()),
                    seconds_remaining: Some(whole_seconds_up(remaining)),
                }
            }
        }
    }

    fn announce_state(&self) {
        self.registry
            .broadcast(&ServerMessage::StateUpdate(self.state()));
    }

    fn is_holder(&self, client_id: &str) -> bool {
        matches!(&self.slot, Slot::Active { holder, .. } if holder == client_id)
    }

    fn end_session(&mut self, reason: EndReason, ctx: &mut Context<Self>) {
        let Slot::Active {
            holder,
            started_at,
            timer,
            mut stream,
        } = mem::replace(&mut self.slot, Slot::Idle)
        else {
            return;
        };

        ctx.cancel_future(timer);
        stream.close();

        info!(
            client_id = %holder,
            reason = reason.as_str(),
            duration_ms = started_at.elapsed().as_millis() as u64,
            bytes = stream.bytes_fed(),
            "Broadcast ended"
        );

        self.registry
            .broadcast(&ServerMessage::BroadcastEnded { reason });
        self.announce_state();
    }
}

/// Remaining time as shown to users: 0.2 s left still reads as 1.
fn whole_seconds_up(remaining: Duration) -> u64 {
    let secs = remaining.as_secs();
    if remaining.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

impl Actor for Broadcaster {
    type Context = Context<Self>;

    fn started(&mut self, _: &mut Self::Context) {
        info!(
            timeout_secs = self.timeout.as_secs(),
            dry_run = self.sink.is_dry_run(),
            "Live broadcaster started"
        );
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        if let Slot::Active { mut stream, .. } = mem::replace(&mut self.slot, Slot::Idle) {
            stream.close();
        }
    }
}

impl Handler<Join> for Broadcaster {
    type Result = ();

    fn handle(&mut self, msg: Join, _: &mut Self::Context) {
        trace!(client_id = %msg.client_id, "Announcing state to new client");
        self.announce_state();
    }
}

impl Handler<RequestBroadcast> for Broadcaster {
    type Result = ();

    fn handle(&mut self, msg: RequestBroadcast, ctx: &mut Self::Context) {
        if let Slot::Active { holder, .. } = &self.slot {
            debug!(client_id = %msg.client_id, holder = %holder, "Broadcast denied");
            self.registry.send_to(
                &msg.client_id,
                &ServerMessage::BroadcastDenied {
                    reason: DENIED_BUSY.to_string(),
                },
            );
            return;
        }

        let stream = match self.sink.open_stream() {
            Ok(stream) => stream,
            Err(err) => {
                error!(client_id = %msg.client_id, error = %err, "Failed to open audio output");
                self.registry.send_to(
                    &msg.client_id,
                    &ServerMessage::BroadcastDenied {
                        reason: DENIED_UNAVAILABLE.to_string(),
                    },
                );
                return;
            }
        };

        let timer = ctx.run_later(self.timeout, |act, ctx| {
            info!("Broadcast time limit reached");
            act.end_session(EndReason::Timeout, ctx);
        });

        self.slot = Slot::Active {
            holder: msg.client_id.clone(),
            started_at: Instant::now(),
            timer,
            stream,
        };

        info!(client_id = %msg.client_id, "Broadcast granted");
        self.registry.broadcast(&ServerMessage::BroadcastGranted {
            client_id: msg.client_id,
        });
        self.announce_state();
    }
}

impl Handler<StopBroadcast> for Broadcaster {
    type Result = ();

    fn handle(&mut self, msg: StopBroadcast, ctx: &mut Self::Context) {
        if self.is_holder(&msg.client_id) {
            self.end_session(EndReason::UserStopped, ctx);
        } else {
            debug!(client_id = %msg.client_id, "Ignoring stop from non-holder");
        }
    }
}

impl Handler<Leave> for Broadcaster {
    type Result = ();

    fn handle(&mut self, msg: Leave, ctx: &mut Self::Context) {
        if self.is_holder(&msg.client_id) {
            info!(client_id = %msg.client_id, "Broadcaster disconnected");
            self.end_session(EndReason::UserStopped, ctx);
        }
    }
}

impl Handler<AudioFrame> for Broadcaster {
    type Result = ();

    fn handle(&mut self, msg: AudioFrame, ctx: &mut Self::Context) {
        let status = match &mut self.slot {
            Slot::Active { holder, stream, .. } if *holder == msg.client_id => {
                stream.feed(msg.data)
            }
            _ => {
                trace!(client_id = %msg.client_id, "Dropping audio from non-holder");
                return;
            }
        };

        if status == FeedStatus::Broken {
            warn!(client_id = %msg.client_id, "Audio output closed unexpectedly");
            self.end_session(EndReason::UserStopped, ctx);
        }
    }
}

impl Handler<GetState> for Broadcaster {
    type Result = MessageResult<GetState>;

    fn handle(&mut self, _: GetState, _: &mut Self::Context) -> Self::Result {
        MessageResult(self.state())
    }
}

impl Handler<EndBroadcast> for Broadcaster {
    type Result = ();

    fn handle(&mut self, _: EndBroadcast, ctx: &mut Self::Context) {
        self.end_session(EndReason::UserStopped, ctx);
    }
}
