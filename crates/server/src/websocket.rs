//! WebSocket media + control channel
//!
//! Inbound binary frames carry PCM16LE user audio; outbound binary frames
//! carry the packet wire encoding. Control events, transcripts and the
//! optional blendshape side channel travel as JSON text frames. Each
//! inbound frame is stamped with the session-monotonic observation time on
//! arrival, before any processing.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::Response,
};
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use duplex_core::{BlendshapeFrameWire, ControlEvent, PcmChunk, PipelineEvent};
use duplex_pipeline::InboundFrame;

use crate::session::Session;
use crate::state::AppState;

type WsSender = Arc<tokio::sync::Mutex<SplitSink<WebSocket, Message>>>;

/// Client → server control messages on the media channel.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    /// Explicit user STOP.
    Stop,
    /// Graceful session close.
    Close,
    Ping,
}

/// Server → client JSON frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Transcript { text: String, is_final: bool },
    Blendshapes(BlendshapeFrameWire),
    Pong,
}

/// WebSocket upgrade for an existing session's media channel.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, StatusCode> {
    let session = state
        .sessions
        .get(&session_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, session, state)))
}

async fn send_json(sender: &WsSender, message: &impl Serialize) -> bool {
    match serde_json::to_string(message) {
        Ok(text) => sender
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .is_ok(),
        Err(_) => true,
    }
}

async fn handle_socket(socket: WebSocket, session: Arc<Session>, state: AppState) {
    let (sender, mut receiver) = socket.split();
    let sender: WsSender = Arc::new(tokio::sync::Mutex::new(sender));
    let session_id = session.id.clone();
    tracing::info!(session_id = %session_id, "media channel connected");

    // Outbound: pipeline events → wire frames + analytics event log.
    let forward = {
        let mut events = session.pipeline.subscribe();
        let analytics = state.analytics.clone();
        let session = session.clone();
        let sender = sender.clone();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "media channel lagged, events dropped");
                        continue;
                    }
                    Err(_) => break,
                };

                if let Some(control) = event.to_control_event() {
                    analytics
                        .record_event(crate::analytics::EventRecord {
                            session_id: session.id.clone(),
                            event_type: control_event_name(&control).to_string(),
                            event_data: serde_json::to_value(&control).unwrap_or_default(),
                            t_audio_ms: session.pipeline.audio_clock_ms(),
                        })
                        .await;
                    if !send_json(&sender, &control).await {
                        break;
                    }
                    continue;
                }

                let delivered = match event {
                    PipelineEvent::Audio(packet) => sender
                        .lock()
                        .await
                        .send(Message::Binary(packet.to_bytes()))
                        .await
                        .is_ok(),
                    PipelineEvent::Blendshapes(frame) => {
                        send_json(
                            &sender,
                            &ServerMessage::Blendshapes(BlendshapeFrameWire::from(&frame)),
                        )
                        .await
                    }
                    PipelineEvent::PartialTranscript { text } => {
                        send_json(
                            &sender,
                            &ServerMessage::Transcript {
                                text,
                                is_final: false,
                            },
                        )
                        .await
                    }
                    PipelineEvent::FinalTranscript { text, .. } => {
                        send_json(
                            &sender,
                            &ServerMessage::Transcript {
                                text,
                                is_final: true,
                            },
                        )
                        .await
                    }
                    _ => true,
                };
                if !delivered {
                    break;
                }
            }
        })
    };

    // Inbound: audio frames and control messages.
    while let Some(message) = receiver.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "media channel error");
                break;
            }
        };
        session.touch();
        match message {
            Message::Binary(payload) => {
                let frame = InboundFrame {
                    pcm: PcmChunk::new(payload, state.config.audio.sample_rate),
                    t_observed_ms: session.pipeline.epoch_now_ms(),
                };
                if let Err(e) = session.pipeline.process_audio(frame).await {
                    tracing::warn!(session_id = %session_id, error = %e, "audio processing error");
                }
            }
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Stop) => session.pipeline.user_stop().await,
                Ok(ClientMessage::Close) => break,
                Ok(ClientMessage::Ping) => {
                    let _ = send_json(&sender, &ServerMessage::Pong).await;
                }
                Err(e) => {
                    tracing::debug!(session_id = %session_id, error = %e, "unrecognized message");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    forward.abort();
    tracing::info!(session_id = %session_id, "media channel disconnected");
}

fn control_event_name(event: &ControlEvent) -> &'static str {
    match event {
        ControlEvent::StateChange { .. } => "state_change",
        ControlEvent::TtfaMeasured { .. } => "ttfa_measured",
        ControlEvent::BargeinAck { .. } => "bargein_ack",
        ControlEvent::Degraded { .. } => "degraded",
        ControlEvent::TurnTimeout { .. } => "turn_timeout",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse() {
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"stop"}"#).unwrap(),
            ClientMessage::Stop
        ));
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"close"}"#).unwrap(),
            ClientMessage::Close
        ));
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn control_event_names_are_stable() {
        let event = ControlEvent::Degraded {
            level: "ANIMATION_YIELD".into(),
        };
        assert_eq!(control_event_name(&event), "degraded");
    }

    #[test]
    fn server_messages_tag_with_snake_case() {
        let message = ServerMessage::Transcript {
            text: "hi".into(),
            is_final: true,
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"type\":\"transcript\""));
    }
}
