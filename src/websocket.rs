//! # Intercom WebSocket
//!
//! One actor per connected client on `/ws`.
//!
//! ## Frames:
//! - **Text**: JSON control messages (`request_broadcast`, `stop_broadcast`)
//! - **Binary**: audio. In live mode each frame is a chunk of the holder's
//!   stream; in queue mode each message (possibly fragmented) is one recording.
//!
//! The session registers itself with the connection registry on start and
//! removes itself on stop, so the live broadcaster and fan-out never see a
//! client that is already gone.

use crate::error::AppError;
use crate::intercom::broadcast::{AudioFrame, Join, Leave, RequestBroadcast, StopBroadcast};
use crate::intercom::protocol::{ClientMessage, ServerMessage};
use crate::intercom::registry::{ClientId, Outbound};
use crate::state::{AppState, Intercom};
use actix::prelude::*;
use actix_http::ws::Item;
use actix_web::web::{Bytes, BytesMut};
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct IntercomSocket {
    state: web::Data<AppState>,
    client_id: Option<ClientId>,
    last_heartbeat: Instant,
    fragments: FrameAssembler,
}

impl IntercomSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self {
            client_id: None,
            last_heartbeat: Instant::now(),
            fragments: FrameAssembler::new(state.config.server.max_frame_bytes),
            state,
        }
    }

    fn send_message(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(error = %err, "Failed to serialize server message"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!(client_id = ?self.client_id, code, "{}", message);
        self.send_message(ctx, &ServerMessage::error(code, message));
    }

    fn handle_control(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "Unparseable control message");
                self.send_error(ctx, "invalid_message", "Unrecognised control message");
                return;
            }
        };

        let Some(client_id) = self.client_id.clone() else {
            return;
        };

        match (&self.state.intercom, message) {
            (Intercom::Live(broadcaster), ClientMessage::RequestBroadcast) => {
                broadcaster.do_send(RequestBroadcast { client_id });
            }
            (Intercom::Live(broadcaster), ClientMessage::StopBroadcast) => {
                broadcaster.do_send(StopBroadcast { client_id });
            }
            (Intercom::Queue(_), _) => {
                self.send_error(
                    ctx,
                    "unsupported",
                    "Live broadcasting is disabled; send a recording instead",
                );
            }
        }
    }

    fn handle_audio(&mut self, data: Bytes, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(client_id) = self.client_id.clone() else {
            return;
        };

        match &self.state.intercom {
            Intercom::Live(broadcaster) => {
                broadcaster.do_send(AudioFrame {
                    client_id,
                    data: data.to_vec(),
                });
            }
            Intercom::Queue(service) => {
                let service = service.clone();
                // `wait` holds further frames until this recording is admitted,
                // keeping one client's recordings in the order they were sent
                ctx.wait(
                    async move { service.submit(client_id, &data).await }
                        .into_actor(self)
                        .map(|reply, act, ctx| act.send_message(ctx, &reply)),
                );
            }
        }
    }
}

impl Actor for IntercomSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let client_id = self.state.registry.register(ctx.address().recipient());
        info!(
            client_id = %client_id,
            connected = self.state.registry.len(),
            "Client connected"
        );

        self.send_message(
            ctx,
            &ServerMessage::Welcome {
                client_id: client_id.clone(),
            },
        );

        if let Intercom::Live(broadcaster) = &self.state.intercom {
            broadcaster.do_send(Join {
                client_id: client_id.clone(),
            });
        }
        self.client_id = Some(client_id);

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(client_id = ?act.client_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        let discarded = self.fragments.discard();
        if discarded > 0 {
            debug!(bytes = discarded, "Discarding incomplete message");
        }

        let Some(client_id) = self.client_id.take() else {
            return;
        };

        self.state.registry.unregister(&client_id);
        if let Intercom::Live(broadcaster) = &self.state.intercom {
            broadcaster.do_send(Leave {
                client_id: client_id.clone(),
            });
        }

        info!(
            client_id = %client_id,
            connected = self.state.registry.len(),
            "Client disconnected"
        );
    }
}

impl Handler<Outbound> for IntercomSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        ctx.text(&*msg.0);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for IntercomSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                error!(client_id = ?self.client_id, error = %err, "WebSocket protocol error");
                ctx.stop();
                return;
            }
        };

        self.last_heartbeat = Instant::now();

        match msg {
            ws::Message::Text(text) => self.handle_control(&text, ctx),
            ws::Message::Binary(data) => self.handle_audio(data, ctx),
            ws::Message::Continuation(item) => match self.fragments.push(item) {
                Ok(Some(data)) => self.handle_audio(data, ctx),
                Ok(None) => {}
                Err(TooLarge(size)) => {
                    self.send_error(
                        ctx,
                        "message_too_large",
                        &format!("Message exceeds {} bytes", self.fragments.limit),
                    );
                    debug!(client_id = ?self.client_id, bytes = size, "Closing oversized message");
                    ctx.close(Some(ws::CloseCode::Size.into()));
                    ctx.stop();
                }
            },
            ws::Message::Ping(data) => ctx.pong(&data),
            ws::Message::Pong(_) => {}
            ws::Message::Close(reason) => {
                debug!(client_id = ?self.client_id, ?reason, "WebSocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Nop => {}
        }
    }
}

/// A fragmented message outgrew the limit; carries the size it reached.
#[derive(Debug, PartialEq, Eq)]
struct TooLarge(usize);

/// Joins fragmented binary messages back together, up to `limit` bytes.
/// Fragmented text is not used by the client and is dropped.
#[derive(Debug)]
struct FrameAssembler {
    limit: usize,
    buffer: Option<BytesMut>,
}

impl FrameAssembler {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            buffer: None,
        }
    }

    fn push(&mut self, item: Item) -> Result<Option<Bytes>, TooLarge> {
        match item {
            Item::FirstBinary(data) => {
                self.buffer = None;
                self.append(BytesMut::new(), &data)?;
                Ok(None)
            }
            Item::FirstText(_) => {
                self.buffer = None;
                Ok(None)
            }
            Item::Continue(data) => {
                if let Some(buffer) = self.buffer.take() {
                    self.append(buffer, &data)?;
                }
                Ok(None)
            }
            Item::Last(data) => {
                let Some(buffer) = self.buffer.take() else {
                    return Ok(None);
                };
                self.append(buffer, &data)?;
                Ok(self.buffer.take().map(BytesMut::freeze))
            }
        }
    }

    /// Grow `buffer` by `data` and keep it, or drop it once past the limit.
    fn append(&mut self, mut buffer: BytesMut, data: &[u8]) -> Result<(), TooLarge> {
        let size = buffer.len() + data.len();
        if size > self.limit {
            return Err(TooLarge(size));
        }
        buffer.extend_from_slice(data);
        self.buffer = Some(buffer);
        Ok(())
    }

    /// Drop a half-received message and report its size.
    fn discard(&mut self) -> usize {
        self.buffer.take().map_or(0, |buffer| buffer.len())
    }
}

/// WebSocket endpoint: upgrades the request and starts an [`IntercomSocket`].
pub async fn intercom_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    debug!(peer = ?req.connection_info().peer_addr(), "New WebSocket connection request");

    let max_frame = state.config.server.max_frame_bytes;
    ws::WsResponseBuilder::new(IntercomSocket::new(state), &req, stream)
        .frame_size(max_frame)
        .start()
        .map_err(|err| AppError::BadRequest(format!("WebSocket handshake failed: {}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sink::PlaybackSink;
    use crate::audio::store::AudioStore;
    use crate::config::{AppConfig, IntercomMode};
    use crate::intercom::broadcast::{Broadcaster, GetState};
    use crate::intercom::queue::{DeliveryQueue, QueueService};
    use crate::intercom::registry::ConnectionRegistry;
    use actix_http::ws::{OpCode, Parser};
    use actix_web::error::PayloadError;
    use futures_util::stream::{self, Stream, StreamExt};
    use serde_json::Value;
    use std::pin::Pin;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    const MESSAGE_LIMIT: usize = 64;

    fn app_state(mode: IntercomMode) -> web::Data<AppState> {
        let mut config = AppConfig::default();
        config.server.max_frame_bytes = MESSAGE_LIMIT;
        config.intercom.mode = mode;
        config.intercom.queue_capacity = 1;
        config.playback.dry_run = true;
        let config = Arc::new(config);

        let registry = Arc::new(ConnectionRegistry::new());
        let intercom = match mode {
            IntercomMode::Live => Intercom::Live(
                Broadcaster::new(
                    registry.clone(),
                    PlaybackSink::new(config.playback.clone()),
                    config.intercom.broadcast_timeout(),
                )
                .start(),
            ),
            // no worker: whatever is queued stays queued
            IntercomMode::Queue => Intercom::Queue(QueueService::new(
                Arc::new(DeliveryQueue::new(config.intercom.queue_capacity)),
                Arc::new(AudioStore::create().unwrap()),
            )),
        };

        web::Data::new(AppState::new(config, registry, intercom))
    }

    /// A browser-side connection: masked frames go in, server frames are
    /// decoded from the session's output.
    struct TestClient {
        input: Option<mpsc::UnboundedSender<Bytes>>,
        output: Pin<Box<dyn Stream<Item = Result<Bytes, actix_web::Error>>>>,
        received: BytesMut,
    }

    impl TestClient {
        fn connect(state: &web::Data<AppState>) -> Self {
            let (input, rx) = mpsc::unbounded_channel::<Bytes>();
            let payload = stream::unfold(rx, |mut rx| async move {
                rx.recv()
                    .await
                    .map(|bytes| (Ok::<_, PayloadError>(bytes), rx))
            });
            let output = ws::WebsocketContext::create(IntercomSocket::new(state.clone()), payload);

            Self {
                input: Some(input),
                output: Box::pin(output),
                received: BytesMut::new(),
            }
        }

        fn send(&self, op: OpCode, payload: &[u8], fin: bool) {
            let mut frame = BytesMut::new();
            Parser::write_message(&mut frame, payload, op, fin, true);
            self.input.as_ref().unwrap().send(frame.freeze()).unwrap();
        }

        fn send_text(&self, text: &str) {
            self.send(OpCode::Text, text.as_bytes(), true);
        }

        /// Next frame from the server, or `None` once the session has ended.
        async fn next_frame(&mut self) -> Option<(OpCode, Bytes)> {
            loop {
                if let Some((_, op, payload)) =
                    Parser::parse(&mut self.received, false, 1 << 20).unwrap()
                {
                    return Some((op, payload.map(BytesMut::freeze).unwrap_or_default()));
                }
                let chunk = tokio::time::timeout(Duration::from_secs(5), self.output.next())
                    .await
                    .expect("session sent nothing")?;
                self.received.extend_from_slice(&chunk.unwrap());
            }
        }

        async fn recv(&mut self) -> Value {
            let (op, payload) = self.next_frame().await.expect("session ended");
            assert_eq!(op, OpCode::Text);
            serde_json::from_slice(&payload).unwrap()
        }

        /// Drop the connection and wait until the session has stopped.
        async fn hang_up(mut self) {
            self.input.take();
            while self.next_frame().await.is_some() {}
        }
    }

    #[test]
    fn test_fragments_are_joined() {
        let mut assembler = FrameAssembler::new(MESSAGE_LIMIT);
        assert_eq!(assembler.push(Item::FirstBinary(Bytes::from_static(b"ab"))), Ok(None));
        assert_eq!(assembler.push(Item::Continue(Bytes::from_static(b"cd"))), Ok(None));
        let joined = assembler.push(Item::Last(Bytes::from_static(b"ef")));
        assert_eq!(joined, Ok(Some(Bytes::from_static(b"abcdef"))));
        assert_eq!(assembler.discard(), 0);
    }

    #[test]
    fn test_stray_fragments_are_ignored() {
        let mut assembler = FrameAssembler::new(MESSAGE_LIMIT);
        assert_eq!(assembler.push(Item::Continue(Bytes::from_static(b"xx"))), Ok(None));
        assert_eq!(assembler.push(Item::Last(Bytes::from_static(b"yy"))), Ok(None));

        assert_eq!(assembler.push(Item::FirstText(Bytes::from_static(b"{"))), Ok(None));
        assert_eq!(assembler.push(Item::Last(Bytes::from_static(b"}"))), Ok(None));
    }

    #[test]
    fn test_partial_message_discarded() {
        let mut assembler = FrameAssembler::new(MESSAGE_LIMIT);
        assembler.push(Item::FirstBinary(Bytes::from_static(b"abc"))).unwrap();
        assembler.push(Item::Continue(Bytes::from_static(b"de"))).unwrap();
        assert_eq!(assembler.discard(), 5);
        assert_eq!(assembler.push(Item::Last(Bytes::from_static(b"f"))), Ok(None));
    }

    #[test]
    fn test_joined_message_is_capped() {
        let chunk = Bytes::from(vec![7u8; 20]);
        let mut assembler = FrameAssembler::new(MESSAGE_LIMIT);

        // exactly at the limit is fine
        assembler.push(Item::FirstBinary(chunk.clone())).unwrap();
        assembler.push(Item::Continue(chunk.clone())).unwrap();
        assembler.push(Item::Continue(chunk.clone())).unwrap();
        let joined = assembler.push(Item::Last(Bytes::from(vec![7u8; 4]))).unwrap();
        assert_eq!(joined.map(|b| b.len()), Some(MESSAGE_LIMIT));

        assembler.push(Item::FirstBinary(chunk.clone())).unwrap();
        assembler.push(Item::Continue(chunk.clone())).unwrap();
        assembler.push(Item::Continue(chunk.clone())).unwrap();
        assert_eq!(assembler.push(Item::Continue(chunk.clone())), Err(TooLarge(80)));
        assert_eq!(assembler.discard(), 0);

        // the rest of the oversized message goes nowhere
        assert_eq!(assembler.push(Item::Continue(chunk.clone())), Ok(None));
        assert_eq!(assembler.push(Item::Last(chunk.clone())), Ok(None));

        // a single oversized first fragment is rejected as well
        let big = Bytes::from(vec![0u8; MESSAGE_LIMIT + 1]);
        assert_eq!(assembler.push(Item::FirstBinary(big)), Err(TooLarge(MESSAGE_LIMIT + 1)));
    }

    #[actix_web::test]
    async fn test_live_session_lifecycle() {
        let state = app_state(IntercomMode::Live);
        let Intercom::Live(broadcaster) = state.intercom.clone() else {
            unreachable!()
        };

        let mut a = TestClient::connect(&state);
        let welcome = a.recv().await;
        assert_eq!(welcome["type"], "welcome");
        let a_id = welcome["client_id"].as_str().unwrap().to_string();
        assert_eq!(a_id.len(), 8);

        let snapshot = a.recv().await;
        assert_eq!(snapshot["type"], "state_update");
        assert_eq!(snapshot["is_active"], false);

        let mut b = TestClient::connect(&state);
        assert_eq!(b.recv().await["type"], "welcome");
        assert_eq!(b.recv().await["type"], "state_update");
        assert_eq!(a.recv().await["type"], "state_update");
        assert_eq!(state.registry.len(), 2);

        a.send_text("not json");
        let error = a.recv().await;
        assert_eq!(error["type"], "error");
        assert_eq!(error["code"], "invalid_message");

        a.send_text(r#"{"type":"request_broadcast"}"#);
        for client in [&mut a, &mut b] {
            let granted = client.recv().await;
            assert_eq!(granted["type"], "broadcast_granted");
            assert_eq!(granted["client_id"], a_id.as_str());
            let update = client.recv().await;
            assert_eq!(update["is_active"], true);
            assert_eq!(update["active_client"], a_id.as_str());
        }

        a.send(OpCode::Binary, b"opus", true);

        // the holder going away frees the channel for everyone
        a.hang_up().await;
        let ended = b.recv().await;
        assert_eq!(ended["type"], "broadcast_ended");
        assert_eq!(ended["reason"], "user_stopped");
        assert_eq!(b.recv().await["is_active"], false);

        assert!(!broadcaster.send(GetState).await.unwrap().is_active);
        assert_eq!(state.registry.len(), 1);

        b.hang_up().await;
        assert_eq!(state.registry.len(), 0);
    }

    #[actix_web::test]
    async fn test_queue_session_replies() {
        let state = app_state(IntercomMode::Queue);
        let Intercom::Queue(service) = state.intercom.clone() else {
            unreachable!()
        };

        let mut client = TestClient::connect(&state);
        assert_eq!(client.recv().await["type"], "welcome");

        client.send_text(r#"{"type":"request_broadcast"}"#);
        let error = client.recv().await;
        assert_eq!(error["type"], "error");
        assert_eq!(error["code"], "unsupported");

        client.send_text(r#"{"type":"dance"}"#);
        assert_eq!(client.recv().await["code"], "invalid_message");

        client.send(OpCode::Binary, b"first recording", true);
        let queued = client.recv().await;
        assert_eq!(queued["type"], "queued");
        assert_eq!(queued["position"], 1);

        client.send(OpCode::Binary, b"second recording", true);
        assert_eq!(client.recv().await["type"], "queue_full");
        assert_eq!(service.queue().len(), 1);

        client.hang_up().await;
        assert_eq!(state.registry.len(), 0);
    }

    #[actix_web::test]
    async fn test_oversized_fragmented_message_closes_session() {
        let state = app_state(IntercomMode::Queue);
        let Intercom::Queue(service) = state.intercom.clone() else {
            unreachable!()
        };

        let mut client = TestClient::connect(&state);
        assert_eq!(client.recv().await["type"], "welcome");

        // within the limit once joined
        client.send(OpCode::Binary, &[1; 30], false);
        client.send(OpCode::Continue, &[2; 30], true);
        assert_eq!(client.recv().await["position"], 1);

        client.send(OpCode::Binary, &[3; 40], false);
        client.send(OpCode::Continue, &[4; 40], false);
        let error = client.recv().await;
        assert_eq!(error["type"], "error");
        assert_eq!(error["code"], "message_too_large");

        let (op, _) = client.next_frame().await.unwrap();
        assert_eq!(op, OpCode::Close);
        assert!(client.next_frame().await.is_none());

        assert_eq!(service.queue().len(), 1);
        assert_eq!(state.registry.len(), 0);
    }
}
