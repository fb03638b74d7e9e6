//! # Live Session WebSocket
//!
//! UI clients connect to `/ws/live` to follow the live session and drive it.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the current snapshot is sent right away
//! 2. **Updates**: snapshot changes are pushed at most once per `snapshot_interval_ms`
//! 3. **Commands**: `{"type": "connect" | "disconnect" | "toggle_mute"}`; each
//!    is answered with the resulting snapshot
//! 4. **Heartbeat**: `{"type": "ping", "timestamp": ...}` is answered with a pong;
//!    protocol-level pings are sent every 30 seconds and silent clients are dropped
//!
//! ## Message Format:
//! - **Client → Server**: JSON commands (text frames)
//! - **Server → Client**: JSON events tagged by `type` (`snapshot`, `pong`, `error`)

use crate::live::LiveSnapshot;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Commands accepted from UI clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Connect,
    Disconnect,
    ToggleMute,
    Ping {
        #[serde(default)]
        timestamp: u64,
    },
}

/// Events pushed to UI clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Snapshot(LiveSnapshot),
    Pong { timestamp: u64 },
    Error { code: String, message: String },
}

impl ServerEvent {
    fn to_json(&self) -> Option<String> {
        serde_json::to_string(self)
            .map_err(|e| warn!("Failed to serialize WebSocket event: {}", e))
            .ok()
    }
}

/// One UI client.
///
/// ## Actor Model:
/// Each connection is an independent actor. Session commands are forwarded to
/// the live session driver on a spawned task; the reply comes back to the
/// actor as a `SendEvent` message.
pub struct LiveWebSocket {
    state: web::Data<AppState>,
    snapshot_interval: Duration,
    last_heartbeat: Instant,
    /// Latest snapshot not yet pushed to the client
    pending: Option<LiveSnapshot>,
    last_sent: Option<LiveSnapshot>,
}

impl LiveWebSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        let snapshot_interval = Duration::from_millis(state.get_config().audio.snapshot_interval_ms.max(1));
        Self {
            state,
            snapshot_interval,
            last_heartbeat: Instant::now(),
            pending: None,
            last_sent: None,
        }
    }

    fn send_event(&self, ctx: &mut ws::WebsocketContext<Self>, event: &ServerEvent) {
        if let Some(json) = event.to_json() {
            ctx.text(json);
        }
    }

    fn push_snapshot(&mut self, ctx: &mut ws::WebsocketContext<Self>, snapshot: LiveSnapshot) {
        if self.last_sent.as_ref() == Some(&snapshot) {
            return;
        }
        self.send_event(ctx, &ServerEvent::Snapshot(snapshot.clone()));
        self.last_sent = Some(snapshot);
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!("WebSocket error {}: {}", code, message);
        self.send_event(
            ctx,
            &ServerEvent::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    fn handle_command(&mut self, command: ClientCommand, ctx: &mut ws::WebsocketContext<Self>) {
        debug!(?command, "WebSocket command");
        let live = self.state.live.clone();
        let addr = ctx.address();

        let request = match command {
            ClientCommand::Ping { timestamp } => {
                self.last_heartbeat = Instant::now();
                self.send_event(ctx, &ServerEvent::Pong { timestamp });
                return;
            }
            ClientCommand::Connect => SessionRequest::Connect,
            ClientCommand::Disconnect => SessionRequest::Disconnect,
            ClientCommand::ToggleMute => SessionRequest::ToggleMute,
        };

        tokio::spawn(async move {
            let result = match request {
                SessionRequest::Connect => live.connect().await,
                SessionRequest::Disconnect => live.disconnect().await,
                SessionRequest::ToggleMute => live.toggle_mute().await,
            };

            let event = match result {
                Ok(snapshot) => ServerEvent::Snapshot(snapshot),
                Err(e) => ServerEvent::Error {
                    code: "session_unavailable".to_string(),
                    message: e.to_string(),
                },
            };
            addr.do_send(SendEvent(event));
        });
    }
}

#[derive(Debug, Clone, Copy)]
enum SessionRequest {
    Connect,
    Disconnect,
    ToggleMute,
}

#[derive(Message)]
#[rtype(result = "()")]
struct SendEvent(ServerEvent);

impl Actor for LiveWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Live WebSocket client connected");
        self.state.ws_client_connected();

        let initial = self.state.live.snapshot();
        self.push_snapshot(ctx, initial);
        ctx.add_stream(WatchStream::from_changes(self.state.live.subscribe()));

        ctx.run_interval(self.snapshot_interval, |act, ctx| {
            if let Some(snapshot) = act.pending.take() {
                act.push_snapshot(ctx, snapshot);
            }
        });

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("Live WebSocket client disconnected");
        self.state.ws_client_disconnected();
    }
}

/// Snapshot changes from the live session driver.
impl StreamHandler<LiveSnapshot> for LiveWebSocket {
    fn handle(&mut self, snapshot: LiveSnapshot, _ctx: &mut Self::Context) {
        self.pending = Some(snapshot);
    }

    // The driver stopping must not close the client connection
    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!("Live session updates ended");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for LiveWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(command) => self.handle_command(command, ctx),
                Err(err) => self.send_error(ctx, "invalid_command", &format!("Invalid command: {}", err)),
            },
            Ok(ws::Message::Binary(_)) => {
                self.send_error(ctx, "unsupported", "Binary messages are not accepted");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendEvent> for LiveWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendEvent, ctx: &mut Self::Context) {
        match msg.0 {
            ServerEvent::Snapshot(snapshot) => {
                // Command replies always go out, even if unchanged
                self.last_sent = None;
                self.push_snapshot(ctx, snapshot);
            }
            event => self.send_event(ctx, &event),
        }
    }
}

/// WebSocket upgrade for `/ws/live`.
pub async fn live_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New live WebSocket connection from: {:?}", req.connection_info().peer_addr());
    ws::start(LiveWebSocket::new(app_state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::state::ConnectionState;

    #[test]
    fn test_parse_client_commands() {
        let parse = |raw: &str| serde_json::from_str::<ClientCommand>(raw).unwrap();
        assert_eq!(parse(r#"{"type":"connect"}"#), ClientCommand::Connect);
        assert_eq!(parse(r#"{"type":"disconnect"}"#), ClientCommand::Disconnect);
        assert_eq!(parse(r#"{"type":"toggle_mute"}"#), ClientCommand::ToggleMute);
        assert_eq!(parse(r#"{"type":"ping","timestamp":7}"#), ClientCommand::Ping { timestamp: 7 });
        assert_eq!(parse(r#"{"type":"ping"}"#), ClientCommand::Ping { timestamp: 0 });
        assert!(serde_json::from_str::<ClientCommand>(r#"{"type":"start_session"}"#).is_err());
    }

    #[test]
    fn test_snapshot_event_shape() {
        let snapshot = LiveSnapshot {
            status: ConnectionState::Connected,
            is_muted: true,
            ..LiveSnapshot::default()
        };
        let json: serde_json::Value =
            serde_json::from_str(&ServerEvent::Snapshot(snapshot).to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "snapshot");
        assert_eq!(json["status"], "connected");
        assert_eq!(json["is_muted"], true);
        assert_eq!(json["volume"]["user"], 0.0);
    }

    #[test]
    fn test_error_event_shape() {
        let event = ServerEvent::Error {
            code: "invalid_command".to_string(),
            message: "nope".to_string(),
        };
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "invalid_command");
    }
}
