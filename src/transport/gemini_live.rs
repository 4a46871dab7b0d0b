//! Gemini Live transport (streamed socket strategy).
//!
//! One WebSocket carries the whole session: a JSON setup frame, then
//! base64 audio in both directions.
//!
//! ## Protocol
//!
//! 1. **Connect** — open the BidiGenerateContent WebSocket
//! 2. **Setup** — send model, voice, system prompt, and VAD config
//! 3. **Stream** — send microphone audio as `realtimeInput`, receive
//!    response audio/transcripts as `serverContent`
//! 4. **Close** — graceful WebSocket close
//!
//! Gemini sends **all** server messages as Binary frames, including
//! JSON control messages like `setupComplete`. Frames starting with `{`
//! are parsed as JSON before any audio handling.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{Transport, CHANNEL_CAPACITY};
use crate::audio::codec;
use crate::config::{ProviderKind, ScenarioConfig};
use crate::events::{ControlCommand, TransportEvent};

// ── Constants ──────────────────────────────────────────────────────

const GEMINI_LIVE_WS_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Input audio MIME type (16kHz PCM mono).
const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

// ── Setup message ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SetupMessage {
    setup: SetupPayload,
}

#[derive(Debug, Serialize)]
struct SetupPayload {
    model: String,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
    #[serde(rename = "systemInstruction")]
    system_instruction: SystemInstruction,
    #[serde(rename = "realtimeInputConfig")]
    realtime_input_config: RealtimeInputConfig,
    /// Empty objects enable server-side transcription of both legs.
    #[serde(rename = "inputAudioTranscription")]
    input_audio_transcription: serde_json::Value,
    #[serde(rename = "outputAudioTranscription")]
    output_audio_transcription: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    response_modalities: Vec<String>,
    #[serde(rename = "speechConfig")]
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
struct SpeechConfig {
    #[serde(rename = "voiceConfig")]
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
struct VoiceConfig {
    #[serde(rename = "prebuiltVoiceConfig")]
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
struct PrebuiltVoiceConfig {
    #[serde(rename = "voiceName")]
    voice_name: String,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct RealtimeInputConfig {
    #[serde(rename = "automaticActivityDetection")]
    automatic_activity_detection: AutomaticActivityDetection,
}

/// Automatic VAD tuning. Hands-free conversation needs auto VAD; the
/// padding/silence values match the turn behavior tuned for language
/// practice (generous pauses while the learner finds a word).
#[derive(Debug, Serialize)]
struct AutomaticActivityDetection {
    disabled: bool,
    #[serde(rename = "prefixPaddingMs")]
    prefix_padding_ms: u32,
    #[serde(rename = "silenceDurationMs")]
    silence_duration_ms: u32,
}

fn build_setup_message(config: &ScenarioConfig) -> SetupMessage {
    SetupMessage {
        setup: SetupPayload {
            model: format!("models/{}", ProviderKind::GeminiLive.model_id()),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: SystemInstruction {
                parts: vec![TextPart {
                    text: config.build_system_prompt(),
                }],
            },
            realtime_input_config: RealtimeInputConfig {
                automatic_activity_detection: AutomaticActivityDetection {
                    disabled: false,
                    prefix_padding_ms: 300,
                    silence_duration_ms: 800,
                },
            },
            input_audio_transcription: serde_json::json!({}),
            output_audio_transcription: serde_json::json!({}),
        },
    }
}

// ── Outbound messages ──────────────────────────────────────────────

/// Wire format: `{"realtimeInput": {"mediaChunks": [{"mimeType": "audio/pcm;rate=16000", "data": "<base64>"}]}}`
///
/// API docs mark `mediaChunks` as deprecated in favor of `audio`, but
/// the official SDKs still emit `mediaChunks` and the server ignores
/// the `audio` field. Keeping `mediaChunks` until the SDKs switch.
fn build_audio_message(pcm_data: &[u8]) -> serde_json::Value {
    serde_json::json!({
        "realtimeInput": {
            "mediaChunks": [{
                "mimeType": INPUT_AUDIO_MIME,
                "data": codec::encode_base64(pcm_data),
            }]
        }
    })
}

/// Wire format: `{"clientContent": {"turns": [...], "turnComplete": true}}`.
/// A completed client turn is also what triggers the model's response,
/// so there is no separate response request on this protocol.
fn build_user_item_message(text: &str) -> serde_json::Value {
    serde_json::json!({
        "clientContent": {
            "turns": [{
                "role": "user",
                "parts": [{ "text": text }]
            }],
            "turnComplete": true,
        }
    })
}

#[derive(Debug)]
enum OutboundMessage {
    Audio(Vec<u8>),
    Control(ControlCommand),
    Close,
}

// ── Server message parsing ─────────────────────────────────────────

/// Parse one server message into a list of events. A single frame can
/// carry several (audio chunks plus a transcript, say).
fn parse_server_message(json_text: &str) -> Vec<TransportEvent> {
    let mut events = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            // A frame we cannot parse is skipped, never fatal to the session.
            tracing::warn!("Dropping unparseable server message: {e}");
            return events;
        }
    };

    if value.get("setupComplete").is_some() {
        events.push(TransportEvent::Ready);
    }

    if let Some(content) = value.get("serverContent") {
        if content.get("interrupted").and_then(|v| v.as_bool()) == Some(true) {
            events.push(TransportEvent::Interrupted);
        }
        if let Some(parts) = content
            .pointer("/modelTurn/parts")
            .and_then(|v| v.as_array())
        {
            for part in parts {
                if let Some(data_b64) = part.pointer("/inlineData/data").and_then(|v| v.as_str()) {
                    if let Ok(data) = codec::decode_base64(data_b64) {
                        events.push(TransportEvent::AudioChunk { data });
                    }
                }
                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                    events.push(TransportEvent::OutputTranscriptDelta {
                        text: text.to_string(),
                    });
                }
            }
        }
        // turnComplete last, so transcript deltas in the same frame land
        // in the turn they belong to.
        if content.get("turnComplete").and_then(|v| v.as_bool()) == Some(true) {
            events.push(TransportEvent::TurnComplete);
        }
    }

    if let Some(text) = value
        .pointer("/inputTranscription/text")
        .and_then(|v| v.as_str())
    {
        if !text.is_empty() {
            events.push(TransportEvent::InputTranscriptDelta {
                text: text.to_string(),
            });
        }
    }

    if let Some(text) = value
        .pointer("/outputTranscription/text")
        .and_then(|v| v.as_str())
    {
        if !text.is_empty() {
            events.push(TransportEvent::OutputTranscriptDelta {
                text: text.to_string(),
            });
        }
    }

    if let Some(err) = value.get("error") {
        let code = err
            .get("code")
            .map(|v| v.to_string())
            .unwrap_or_else(|| "server_error".to_string());
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown server error");
        events.push(TransportEvent::ServerError {
            code,
            message: message.to_string(),
        });
    }

    events
}

// ── Transport ──────────────────────────────────────────────────────

/// Connected Gemini Live session.
pub struct GeminiLiveTransport {
    outbound_tx: mpsc::Sender<OutboundMessage>,
    session_id: String,
}

impl GeminiLiveTransport {
    /// Connect, complete setup, and spawn the streaming loops.
    pub async fn connect(
        session_id: String,
        api_key: &str,
        config: &ScenarioConfig,
    ) -> anyhow::Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let url = format!("{GEMINI_LIVE_WS_URL}?key={api_key}");

        tracing::info!(
            session_id = %session_id,
            model = ProviderKind::GeminiLive.model_id(),
            language = config.target_language.as_str(),
            "Connecting to Gemini Live"
        );

        let (mut ws_stream, _response) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to Gemini Live: {e}"))?;

        let setup_json = serde_json::to_string(&build_setup_message(config))?;
        tracing::debug!(session_id = %session_id, setup = %setup_json, "Sending Gemini Live setup");
        ws_stream
            .send(WsMessage::Text(setup_json.into()))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send setup message: {e}"))?;

        // Wait for setupComplete before splitting the stream. It arrives
        // as a Binary frame containing JSON.
        let setup_timeout = std::time::Duration::from_secs(15);
        let setup_complete = tokio::time::timeout(setup_timeout, async {
            while let Some(msg_result) = ws_stream.next().await {
                match msg_result {
                    Ok(WsMessage::Binary(data)) if data.first() == Some(&b'{') => {
                        if let Ok(text) = std::str::from_utf8(&data) {
                            if text.contains("setupComplete") {
                                return Ok(());
                            }
                        }
                    }
                    Ok(WsMessage::Text(text)) if text.contains("setupComplete") => {
                        return Ok(());
                    }
                    Ok(WsMessage::Close(frame)) => {
                        anyhow::bail!("Connection closed before setupComplete: {frame:?}");
                    }
                    Err(e) => {
                        anyhow::bail!("WebSocket error before setupComplete: {e}");
                    }
                    other => {
                        tracing::debug!(
                            session_id = %session_id,
                            msg = ?other,
                            "Setup phase: unexpected frame"
                        );
                    }
                }
            }
            anyhow::bail!("Stream ended before setupComplete")
        })
        .await;

        match setup_complete {
            Ok(Ok(())) => {
                tracing::info!(session_id = %session_id, "Gemini Live setup complete");
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => anyhow::bail!("Gemini Live setupComplete timeout (15s)"),
        }

        let (ws_sender, ws_receiver) = ws_stream.split();
        let ws_sender = Arc::new(Mutex::new(ws_sender));

        let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundMessage>(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(CHANNEL_CAPACITY);

        // Setup already completed, so Ready is the first event out.
        event_tx
            .send(TransportEvent::Ready)
            .await
            .map_err(|_| anyhow::anyhow!("Event receiver dropped during connect"))?;

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
impl Transport for GeminiLiveTransport {
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
        tracing::info!(session_id = %self.session_id, "Closing Gemini Live transport");
        let _ = self.outbound_tx.send(OutboundMessage::Close).await;
    }

    fn input_sample_rate(&self) -> u32 {
        ProviderKind::GeminiLive.input_sample_rate()
    }

    fn output_sample_rate(&self) -> u32 {
        ProviderKind::GeminiLive.output_sample_rate()
    }
}

// ── Internal loops ─────────────────────────────────────────────────

async fn outbound_loop(
    mut rx: mpsc::Receiver<OutboundMessage>,
    ws_sender: Arc<Mutex<WsSink>>,
    session_id: String,
) {
    let mut audio_chunk_count: u64 = 0;
    let mut total_bytes: u64 = 0;

    while let Some(msg) = rx.recv().await {
        match msg {
            OutboundMessage::Audio(pcm) => {
                audio_chunk_count += 1;
                total_bytes += pcm.len() as u64;
                if audio_chunk_count == 1 || audio_chunk_count.is_multiple_of(50) {
                    tracing::info!(
                        session_id = %session_id,
                        chunk = audio_chunk_count,
                        pcm_bytes = pcm.len(),
                        total_bytes = total_bytes,
                        "Sending audio chunk to Gemini Live"
                    );
                }
                let json = build_audio_message(&pcm).to_string();
                let mut sender = ws_sender.lock().await;
                if sender.send(WsMessage::Text(json.into())).await.is_err() {
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
            OutboundMessage::Control(ControlCommand::RequestResponse { .. }) => {
                // Gemini responds on its own once a client turn completes;
                // there is no explicit response trigger on this protocol.
                tracing::debug!(session_id = %session_id, "RequestResponse is implicit on Gemini Live");
            }
            OutboundMessage::Close => {
                let mut sender = ws_sender.lock().await;
                let _ = sender.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }

    tracing::debug!(session_id = %session_id, "Gemini Live outbound loop terminated");
}

async fn inbound_loop(
    mut ws_receiver: WsSource,
    event_tx: mpsc::Sender<TransportEvent>,
    session_id: String,
) {
    let start_time = std::time::Instant::now();
    let mut audio_response_count: u64 = 0;

    while let Some(msg_result) = ws_receiver.next().await {
        let text = match msg_result {
            // All Gemini messages arrive as Binary frames holding JSON.
            Ok(WsMessage::Binary(data)) if data.first() == Some(&b'{') => {
                match std::str::from_utf8(&data) {
                    Ok(text) => text.to_string(),
                    Err(_) => {
                        tracing::warn!(session_id = %session_id, "Non-UTF8 binary frame dropped");
                        continue;
                    }
                }
            }
            Ok(WsMessage::Text(text)) => text.to_string(),
            Ok(WsMessage::Close(frame)) => {
                tracing::info!(session_id = %session_id, close_frame = ?frame, "Gemini Live closed");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Gemini Live WebSocket error");
                let _ = event_tx
                    .send(TransportEvent::ServerError {
                        code: "websocket".to_string(),
                        message: e.to_string(),
                    })
                    .await;
                break;
            }
        };

        let elapsed = start_time.elapsed().as_secs_f32();
        for event in parse_server_message(&text) {
            match &event {
                TransportEvent::AudioChunk { data } => {
                    audio_response_count += 1;
                    if audio_response_count == 1 || audio_response_count.is_multiple_of(50) {
                        tracing::info!(
                            session_id = %session_id,
                            t = format!("{elapsed:.1}s"),
                            audio_n = audio_response_count,
                            bytes = data.len(),
                            "Gemini audio response"
                        );
                    }
                }
                TransportEvent::TurnComplete => {
                    tracing::info!(
                        session_id = %session_id,
                        t = format!("{elapsed:.1}s"),
                        audio_chunks = audio_response_count,
                        "Turn complete"
                    );
                }
                TransportEvent::Interrupted => {
                    tracing::info!(session_id = %session_id, t = format!("{elapsed:.1}s"), "Interrupted");
                }
                _ => {}
            }
            if event_tx.send(event).await.is_err() {
                tracing::debug!(session_id = %session_id, "Event receiver dropped, closing inbound loop");
                return;
            }
        }
    }

    let _ = event_tx.send(TransportEvent::Closed).await;
    tracing::debug!(session_id = %session_id, "Gemini Live inbound loop terminated");
}

// ── Tests ──────────────────────────────────────────────────────────
