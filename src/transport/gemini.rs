//! WebSocket client for the hosted live speech service.
//!
//! One spawned task owns the socket for the whole session: it serializes
//! outbound media, decodes inbound JSON (text or binary frames) and turns
//! socket lifecycle into `SessionEvent`s.

use crate::transport::messages::{ClientMessage, ConnectRequest, ServerMessage, SetupMessage};
use crate::transport::{Outbound, RemoteSession, SessionConnector, SessionEvent};

use anyhow::{anyhow, Context, Result};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Connector for the bidirectional streaming endpoint.
#[derive(Debug, Clone)]
pub struct GeminiLiveConnector {
    endpoint: String,
    api_key: Option<String>,
}

impl GeminiLiveConnector {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

impl SessionConnector for GeminiLiveConnector {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, Result<RemoteSession>> {
        let endpoint = self.endpoint.clone();
        let api_key = self.api_key.clone();

        Box::pin(async move {
            let api_key = api_key
                .filter(|key| !key.trim().is_empty())
                .ok_or_else(|| anyhow!("API key not found; set API_KEY or live.api_key"))?;

            info!(
                model = %request.model,
                voice = %request.voice_name,
                "Opening remote speech session"
            );

            // The key only ever lives in the request URL, never in logs
            let url = format!("{}?key={}", endpoint, api_key);
            let (mut ws, _response) = connect_async(url.as_str())
                .await
                .context("remote session handshake failed")?;

            let setup = serde_json::to_string(&ClientMessage::Setup(SetupMessage::from(&request)))?;
            ws.send(Message::Text(setup))
                .await
                .context("failed to send session setup")?;

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let session = RemoteSession::new(outbound_tx, event_rx);

            // Setup is on the wire; audio may follow it immediately
            let _ = event_tx.send(SessionEvent::Open);
            tokio::spawn(pump(ws, outbound_rx, event_tx, session.sender.id()));

            Ok(session)
        })
    }
}

/// Move messages between the socket and the session channels until either side ends.
async fn pump<S>(
    ws: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<SessionEvent>,
    session_id: Uuid,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Media(input)) => {
                    let text = match serde_json::to_string(&ClientMessage::from(input)) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(%session_id, error = %e, "Dropping unserializable media frame");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        let _ = events.send(SessionEvent::Error(format!("send failed: {}", e)));
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    debug!(%session_id, "Closing remote session");
                    let _ = sink.close().await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if !forward(&events, text.as_bytes(), session_id) {
                        let _ = sink.close().await;
                        break;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if !forward(&events, &bytes, session_id) {
                        let _ = sink.close().await;
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                        .filter(|reason| !reason.trim().is_empty());
                    info!(%session_id, ?reason, "Remote session closed by server");
                    let _ = events.send(SessionEvent::Closed { reason });
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(%session_id, error = %e, "Remote session failed");
                    let _ = events.send(SessionEvent::Error(e.to_string()));
                    break;
                }
                None => {
                    let _ = events.send(SessionEvent::Closed { reason: None });
                    break;
                }
            },
        }
    }

    debug!(%session_id, "Remote session task finished");
}

/// Decode one server payload and hand it to the session. Returns false once
/// nobody is listening any more.
fn forward(events: &mpsc::UnboundedSender<SessionEvent>, payload: &[u8], session_id: Uuid) -> bool {
    match serde_json::from_slice::<ServerMessage>(payload) {
        Ok(message) => events.send(SessionEvent::Message(message)).is_ok(),
        Err(e) => {
            warn!(%session_id, error = %e, "Ignoring undecodable server message");
            !events.is_closed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::messages::{MediaBlob, RealtimeInput};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_missing_api_key_fails_before_dialing() {
        let connector = GeminiLiveConnector::new("ws://127.0.0.1:9", None);
        let result = connector.connect(ConnectRequest::new("m", "Puck", "")).await;
        assert!(result.unwrap_err().to_string().contains("API key"));

        let connector = GeminiLiveConnector::new("ws://127.0.0.1:9", Some("  ".to_string()));
        assert!(connector.connect(ConnectRequest::new("m", "Puck", "")).await.is_err());
    }

    #[tokio::test]
    async fn test_session_round_trip_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let setup = ws.next().await.unwrap().unwrap();
            let setup: serde_json::Value = serde_json::from_str(setup.to_text().unwrap()).unwrap();
            let media = ws.next().await.unwrap().unwrap();
            let media: serde_json::Value = serde_json::from_str(media.to_text().unwrap()).unwrap();

            ws.send(Message::Text(r#"{"serverContent":{"interrupted":true}}"#.to_string()))
                .await
                .unwrap();
            ws.send(Message::Text("not json".to_string())).await.unwrap();
            ws.send(Message::Binary(
                br#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"data":"AAA="}}]}}}"#.to_vec(),
            ))
            .await
            .unwrap();
            ws.close(None).await.unwrap();

            (setup, media)
        });

        let connector = GeminiLiveConnector::new(format!("ws://{}", addr), Some("test-key".to_string()));
        let mut session = connector
            .connect(ConnectRequest::new("test-model", "Charon", "Be nice."))
            .await
            .unwrap();

        assert_eq!(session.events.recv().await, Some(SessionEvent::Open));

        session
            .sender
            .send(RealtimeInput {
                media: MediaBlob {
                    data: "AQI=".to_string(),
                    mime_type: "audio/pcm;rate=16000".to_string(),
                },
            })
            .unwrap();

        match session.events.recv().await {
            Some(SessionEvent::Message(message)) => assert!(message.is_interrupted()),
            other => panic!("expected interruption, got {:?}", other),
        }
        match session.events.recv().await {
            Some(SessionEvent::Message(message)) => {
                assert_eq!(message.audio_chunks().collect::<Vec<_>>(), vec!["AAA="])
            }
            other => panic!("expected audio, got {:?}", other),
        }
        assert!(matches!(session.events.recv().await, Some(SessionEvent::Closed { .. })));

        let (setup, media) = server.await.unwrap();
        assert_eq!(setup["setup"]["model"], "models/test-model");
        assert_eq!(
            setup["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Charon"
        );
        assert_eq!(media["realtimeInput"]["mediaChunks"][0]["data"], "AQI=");
        assert_eq!(media["realtimeInput"]["mediaChunks"][0]["mimeType"], "audio/pcm;rate=16000");
    }
}
