//! OpenAI Realtime transport (negotiated call strategy).
//!
//! Unlike Gemini's single socket, an OpenAI Realtime call is set up in
//! two steps:
//!
//! 1. **Negotiate** — POST a multipart form (`sdp` offer +
//!    `session` config JSON) to the calls endpoint. A 201 response
//!    carries the answer SDP in the body and the call id in the
//!    `Location` header. Any other status fails the session.
//! 2. **Attach** — open a WebSocket keyed by `?call_id=`. JSON control
//!    events (transcripts, VAD, response lifecycle) arrive as text
//!    frames; audio travels as raw binary PCM16 frames in both
//!    directions, so microphone frames are never base64-wrapped here.
//!
//! Server VAD handles turn taking: the model responds when the user
//! goes quiet and cancels itself when the user barges in.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::RngExt;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{Transport, CHANNEL_CAPACITY};
use crate::audio::codec;
use crate::config::{ProviderKind, ScenarioConfig};
use crate::error::SessionError;
use crate::events::{ControlCommand, TransportEvent};

// ── Constants ──────────────────────────────────────────────────────

const OPENAI_API_BASE: &str = "https://api.openai.com";
const CALLS_PATH: &str = "/v1/realtime/calls";

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

// ── Negotiation ────────────────────────────────────────────────────

/// Session config sent as the `session` multipart field.
fn build_session_object(config: &ScenarioConfig) -> serde_json::Value {
    serde_json::json!({
        "model": ProviderKind::OpenAiRealtime.model_id(),
        "instructions": config.build_system_prompt(),
        "output_modalities": ["audio"],
        "audio": {
            "output": { "voice": config.voice },
            "input": {
                "turn_detection": {
                    "type": "server_vad",
                    "threshold": 0.5,
                    "prefix_padding_ms": 300,
                    "silence_duration_ms": 800,
                    "create_response": true,
                    "interrupt_response": true,
                }
            }
        }
    })
}

/// Build a minimal audio-only SDP offer for the call.
fn build_sdp_offer() -> String {
    let mut rng = rand::rng();
    let session_ver: u64 = rng.random_range(1_000_000_000..9_999_999_999);
    let ufrag: String = (0..8)
        .map(|_| char::from(rng.random_range(b'a'..=b'z')))
        .collect();
    let pwd: String = (0..24)
        .map(|_| char::from(rng.random_range(b'a'..=b'z')))
        .collect();

    format!(
        "v=0\r\n\
         o=- {session_ver} 2 IN IP4 127.0.0.1\r\n\
         s=-\r\n\
         t=0 0\r\n\
         a=group:BUNDLE 0\r\n\
         m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
         c=IN IP4 0.0.0.0\r\n\
         a=rtcp:9 IN IP4 0.0.0.0\r\n\
         a=ice-ufrag:{ufrag}\r\n\
         a=ice-pwd:{pwd}\r\n\
         a=setup:actpass\r\n\
         a=mid:0\r\n\
         a=sendrecv\r\n\
         a=rtpmap:111 opus/48000/2\r\n\
         a=fmtp:111 minptime=10;useinbandfec=1\r\n"
    )
}

/// Outcome of a successful negotiation.
#[derive(Debug)]
struct NegotiatedCall {
    call_id: String,
    answer_sdp: String,
}

/// POST the offer and session config, expect 201 with answer SDP.
async fn negotiate(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    offer_sdp: String,
    session_json: String,
) -> anyhow::Result<NegotiatedCall> {
    let form = reqwest::multipart::Form::new()
        .part(
            "sdp",
            reqwest::multipart::Part::text(offer_sdp).mime_str("application/sdp")?,
        )
        .part(
            "session",
            reqwest::multipart::Part::text(session_json).mime_str("application/json")?,
        );

    let response = client
        .post(format!("{base_url}{CALLS_PATH}"))
        .bearer_auth(api_key)
        .multipart(form)
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("Call negotiation request failed: {e}"))?;

    let status = response.status();
    if status.as_u16() != 201 {
        let body = response.text().await.unwrap_or_default();
        return Err(SessionError::Negotiation {
            status: status.as_u16(),
            body,
        }
        .into());
    }

    let call_id = response
        .headers()
        .get("Location")
        .and_then(|v| v.to_str().ok())
        .and_then(|location| location.rsplit('/').next())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Negotiation response missing Location header"))?;

    let answer_sdp = response.text().await.unwrap_or_default();
    Ok(NegotiatedCall {
        call_id,
        answer_sdp,
    })
}

/// WebSocket URL for the call's event/audio channel.
fn call_socket_url(base_url: &str, call_id: &str) -> String {
    let ws_base = base_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!("{ws_base}/v1/realtime?call_id={call_id}")
}

// ── Server event parsing ───────────────────────────────────────────

/// Map one JSON text frame to transport events. Unknown event types are
/// dropped silently; the protocol grows names faster than clients do.
fn parse_server_event(json_text: &str) -> Vec<TransportEvent> {
    let mut events = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            // A frame we cannot parse is skipped, never fatal to the call.
            tracing::warn!("Dropping unparseable server event: {e}");
            return events;
        }
    };

    let event_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match event_type {
        "session.created" | "session.updated" => {
            events.push(TransportEvent::Ready);
        }
        "response.created" => {
            events.push(TransportEvent::ResponseCreated);
        }
        // Audio deltas may still arrive base64 in JSON on some event
        // names even though the main audio path is binary frames.
        "response.audio.delta" | "response.output_audio.delta" => {
            if let Some(delta_b64) = value.get("delta").and_then(|v| v.as_str()) {
                if let Ok(data) = codec::decode_base64(delta_b64) {
                    events.push(TransportEvent::AudioChunk { data });
                }
            }
        }
        "response.audio_transcript.delta" | "response.output_audio_transcript.delta" => {
            if let Some(text) = value.get("delta").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    events.push(TransportEvent::OutputTranscriptDelta {
                        text: text.to_string(),
                    });
                }
            }
        }
        "conversation.item.input_audio_transcription.completed" => {
            if let Some(text) = value.get("transcript").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    events.push(TransportEvent::InputTranscriptDelta {
                        text: text.to_string(),
                    });
                }
            }
        }
        "response.done" => {
            events.push(TransportEvent::ResponseDone);
            events.push(TransportEvent::TurnComplete);
        }
        "input_audio_buffer.speech_started" => {
            events.push(TransportEvent::SpeechStarted);
        }
        "input_audio_buffer.speech_stopped" => {
            events.push(TransportEvent::SpeechStopped);
        }
        "response.cancelled" => {
            events.push(TransportEvent::Interrupted);
        }
        "error" => {
            let error = value.get("error");
            let code = error
                .and_then(|e| e.get("code"))
                .and_then(|v| v.as_str())
                .unwrap_or("server_error");
            let message = error
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown server error");
            events.push(TransportEvent::ServerError {
                code: code.to_string(),
                message: message.to_string(),
            });
        }
        _ => {
            tracing::debug!(event_type, "OpenAI Realtime event (unhandled)");
        }
    }

    events
}

// ── Outbound messages ──────────────────────────────────────────────

#[derive(Debug)]
enum OutboundMessage {
    Audio(Vec<u8>),
    Control(ControlCommand),
    Close,
}

fn build_user_item_message(text: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "conversation.item.create",
        "item": {
            "type": "message",
            "role": "user",
            "content": [{
                "type": "input_text",
                "text": text,
            }]
        }
    })
}

fn build_response_create(instructions: Option<&str>) -> serde_json::Value {
    match instructions {
        Some(instructions) => serde_json::json!({
            "type": "response.create",
            "response": { "instructions": instructions },
        }),
        None => serde_json::json!({ "type": "response.create" }),
    }
}

// ── Transport ──────────────────────────────────────────────────────

/// Connected OpenAI Realtime call.
pub struct OpenAiRealtimeTransport {
    outbound_tx: mpsc::Sender<OutboundMessage>,
    session_id: String,
}

impl OpenAiRealtimeTransport {
    /// Negotiate a call and attach to its event/audio channel.
    pub async fn connect(
        session_id: String,
        api_key: &str,
        config: &ScenarioConfig,
    ) -> anyhow::Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let model = ProviderKind::OpenAiRealtime.model_id();
        tracing::info!(
            session_id = %session_id,
            model,
            language = config.target_language.as_str(),
            "Negotiating OpenAI Realtime call"
        );

        let client = reqwest::Client::new();
        let offer_sdp = build_sdp_offer();
        let session_json = serde_json::to_string(&build_session_object(config))?;
        let call = negotiate(&client, OPENAI_API_BASE, api_key, offer_sdp, session_json).await?;

        tracing::info!(
            session_id = %session_id,
            call_id = %call.call_id,
            answer_len = call.answer_sdp.len(),
            "Call negotiated"
        );

        let url = call_socket_url(OPENAI_API_BASE, &call.call_id);
        let mut request = url
            .into_client_request()
            .map_err(|e| anyhow::anyhow!("Failed to build WebSocket request: {e}"))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {api_key}")
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid auth header: {e}"))?,
        );

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to attach to call channel: {e}"))?;

        let (ws_sender, ws_receiver) = ws_stream.split();
        let ws_sender = Arc::new(Mutex::new(ws_sender));

        let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundMessage>(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(CHANNEL_CAPACITY);

        let sid_out = session_id.clone();
        tokio::spawn(outbound_loop(outbound_rx, Arc::clone(&ws_sender), sid_out));

        let sid_in = session_id.clone();
        tokio::spawn(inbound_loop(ws_receiver, event_tx, sid_in));

        Ok((
            Self {
                outbound_tx,
                session_id,
            },
            event_rx,
        ))
    }
}

#[async_trait]
impl Transport for OpenAiRealtimeTransport {
    async fn send_audio_frame(&self, pcm: &[u8]) -> anyhow::Result<()> {
        if pcm.is_empty() {
            return Ok(());
        }
        self.outbound_tx
            .send(OutboundMessage::Audio(pcm.to_vec()))
            .await
            .map_err(|_| anyhow::anyhow!("Outbound channel closed"))
    }

    async fn send_control(&self, command: ControlCommand) -> anyhow::Result<()> {
        self.outbound_tx
            .send(OutboundMessage::Control(command))
            .await
            .map_err(|_| anyhow::anyhow!("Outbound channel closed"))
    }

    async fn close(&self) {
        tracing::info!(session_id = %self.session_id, "Closing OpenAI Realtime transport");
        let _ = self.outbound_tx.send(OutboundMessage::Close).await;
    }

    fn input_sample_rate(&self) -> u32 {
        ProviderKind::OpenAiRealtime.input_sample_rate()
    }

    fn output_sample_rate(&self) -> u32 {
        ProviderKind::OpenAiRealtime.output_sample_rate()
    }
}

// ── Internal loops ─────────────────────────────────────────────────

async fn outbound_loop(
    mut rx: mpsc::Receiver<OutboundMessage>,
    ws_sender: Arc<Mutex<WsSink>>,
    session_id: String,
) {
    let mut audio_chunk_count: u64 = 0;

    while let Some(msg) = rx.recv().await {
        match msg {
            OutboundMessage::Audio(pcm) => {
                audio_chunk_count += 1;
                if audio_chunk_count == 1 || audio_chunk_count.is_multiple_of(50) {
                    tracing::info!(
                        session_id = %session_id,
                        chunk = audio_chunk_count,
                        pcm_bytes = pcm.len(),
                        "Sending audio frame on call channel"
                    );
                }
                // Raw PCM as a binary frame; no JSON wrapping on this leg.
                let mut sender = ws_sender.lock().await;
                if sender.send(WsMessage::Binary(pcm.into())).await.is_err() {
                    tracing::warn!(
                        session_id = %session_id,
                        "WebSocket send failed, closing outbound loop"
                    );
                    break;
                }
            }
            OutboundMessage::Control(ControlCommand::CreateUserItem { text }) => {
                tracing::info!(session_id = %session_id, text = %text, "Injecting user item");
                let json = build_user_item_message(&text).to_string();
                let mut sender = ws_sender.lock().await;
                if sender.send(WsMessage::Text(json.into())).await.is_err() {
                    break;
                }
            }
            OutboundMessage::Control(ControlCommand::RequestResponse { instructions }) => {
                let json = build_response_create(instructions.as_deref()).to_string();
                let mut sender = ws_sender.lock().await;
                if sender.send(WsMessage::Text(json.into())).await.is_err() {
                    break;
                }
            }
            OutboundMessage::Close => {
                let mut sender = ws_sender.lock().await;
                let _ = sender.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }

    tracing::debug!(session_id = %session_id, "OpenAI Realtime outbound loop terminated");
}

async fn inbound_loop(
    mut ws_receiver: WsSource,
    event_tx: mpsc::Sender<TransportEvent>,
    session_id: String,
) {
    let start_time = std::time::Instant::now();
    let mut audio_response_count: u64 = 0;

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(WsMessage::Text(text)) => {
                for event in parse_server_event(&text) {
                    log_inbound(&event, &session_id, start_time, &mut audio_response_count);
                    if event_tx.send(event).await.is_err() {
                        tracing::debug!(
                            session_id = %session_id,
                            "Event receiver dropped, closing inbound loop"
                        );
                        return;
                    }
                }
            }
            // Response audio arrives as raw PCM binary frames.
            Ok(WsMessage::Binary(data)) => {
                if data.is_empty() {
                    continue;
                }
                let event = TransportEvent::AudioChunk {
                    data: data.to_vec(),
                };
                log_inbound(&event, &session_id, start_time, &mut audio_response_count);
                if event_tx.send(event).await.is_err() {
                    return;
                }
            }
            Ok(WsMessage::Close(frame)) => {
                tracing::info!(
                    session_id = %session_id,
                    close_frame = ?frame,
                    "OpenAI Realtime connection closed"
                );
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(
                    session_id = %session_id,
                    error = %e,
                    "OpenAI Realtime WebSocket error"
                );
                let _ = event_tx
                    .send(TransportEvent::ServerError {
                        code: "websocket".to_string(),
                        message: e.to_string(),
                    })
                    .await;
                break;
            }
        }
    }

    let _ = event_tx.send(TransportEvent::Closed).await;
    tracing::debug!(session_id = %session_id, "OpenAI Realtime inbound loop terminated");
}

fn log_inbound(
    event: &TransportEvent,
    session_id: &str,
    start_time: std::time::Instant,
    audio_response_count: &mut u64,
) {
    let elapsed = start_time.elapsed().as_secs_f32();
    match event {
        TransportEvent::AudioChunk { data } => {
            *audio_response_count += 1;
            if *audio_response_count == 1 || audio_response_count.is_multiple_of(50) {
                tracing::info!(
                    session_id = %session_id,
                    t = format!("{elapsed:.1}s"),
                    audio_n = *audio_response_count,
                    bytes = data.len(),
                    "OpenAI audio response"
                );
            }
        }
        TransportEvent::TurnComplete => {
            tracing::info!(
                session_id = %session_id,
                t = format!("{elapsed:.1}s"),
                audio_chunks = *audio_response_count,
                "Turn complete"
            );
        }
        TransportEvent::SpeechStarted => {
            tracing::info!(session_id = %session_id, t = format!("{elapsed:.1}s"), "Speech started");
        }
        TransportEvent::Interrupted => {
            tracing::info!(session_id = %session_id, t = format!("{elapsed:.1}s"), "Interrupted");
        }
        TransportEvent::ServerError { code, message } => {
            tracing::error!(session_id = %session_id, code = %code, error = %message, "Server error");
        }
        _ => {}
    }
}

// ── Tests ──────────────────────────────────────────────────────────
