//! Session orchestration and the turn state machine.
//!
//! A session wires microphone capture, a transport, and playback into
//! one conversation. The turn logic itself lives in [`SessionCore`], a
//! synchronous state machine that maps each [`TransportEvent`] to a list
//! of side effects; the async loop around it just executes them. That
//! split keeps barge-in ordering and transcript pairing testable without
//! a provider or an audio device.
//!
//! ## Turn lifecycle
//!
//! ```text
//! idle → connecting → connected ┬ listening  (user may speak)
//!                               ├ thinking   (speech ended, no audio yet)
//!                               └ speaking   (response audio playing)
//! ```
//!
//! Providers differ in what they signal: OpenAI sends explicit VAD and
//! response lifecycle events, Gemini mostly just sends audio. The state
//! machine therefore also treats the first audio chunk of a response as
//! an implicit transition into `speaking`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::audio::capture::{CaptureEvent, Microphone};
use crate::audio::codec;
use crate::audio::device::CpalOutput;
use crate::audio::playback::{OutputDevice, PlaybackScheduler};
use crate::audio::visualizer::{AnalyzerSlot, SpectrumAnalyzer};
use crate::config::ScenarioConfig;
use crate::error::SessionError;
use crate::events::{ControlCommand, TransportEvent};
use crate::transport::{self, Transport};

// ── Public state types ───────────────────────────────────────────

/// Connection-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Connecting,
    Connected,
    Error,
    Closed,
}

/// Conversation phase while connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnPhase {
    Listening,
    Thinking,
    Speaking,
}

/// Snapshot published on the status watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub status: SessionStatus,
    /// Only meaningful while `status == Connected`.
    pub phase: Option<TurnPhase>,
}

/// Speaker attribution for transcript entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One committed transcript line. History is append-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

// ── Turn buffer ──────────────────────────────────────────────────

/// Accumulates transcript deltas for the turn in flight. `turn_seq`
/// increments on every flush; audio tagged with an older sequence
/// number belongs to a finished or cancelled turn and is discarded.
#[derive(Debug, Default)]
struct TurnBuffer {
    turn_seq: u64,
    input: String,
    output: String,
}

// ── Side effects ─────────────────────────────────────────────────

/// Effects the state machine asks the async loop to perform, in order.
#[derive(Debug, PartialEq)]
enum Action {
    SendControl(ControlCommand),
    /// Stop active playback immediately (barge-in, interruption).
    InterruptPlayback,
    /// Schedule response PCM for playback.
    PlayAudio(Vec<u8>),
}

// ── State machine ────────────────────────────────────────────────

struct SessionCore {
    status: SessionStatus,
    phase: TurnPhase,
    turn: TurnBuffer,
    transcript: Vec<TranscriptEntry>,
    last_error: Option<String>,
    /// First Ready triggers the ice-breaker; later ones (session.updated
    /// etc.) are status noise.
    greeted: bool,
    ice_breaker: String,
    /// Sequence number of a barged-in turn whose audio is still in
    /// flight. Chunks for that turn are dropped until a new response
    /// starts or the turn is flushed.
    cancelled_turn: Option<u64>,
}

impl SessionCore {
    fn new(ice_breaker: String) -> Self {
        Self {
            status: SessionStatus::Connecting,
            phase: TurnPhase::Listening,
            turn: TurnBuffer::default(),
            transcript: Vec::new(),
            last_error: None,
            greeted: false,
            ice_breaker,
            cancelled_turn: None,
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            status: self.status,
            phase: (self.status == SessionStatus::Connected).then_some(self.phase),
        }
    }

    fn handle_event(&mut self, event: &TransportEvent) -> Vec<Action> {
        let mut actions = Vec::new();

        match event {
            TransportEvent::Ready => {
                self.status = SessionStatus::Connected;
                self.phase = TurnPhase::Listening;
                if !self.greeted {
                    self.greeted = true;
                    // The assistant speaks first: inject the opener as a
                    // user turn and ask for a response.
                    actions.push(Action::SendControl(ControlCommand::CreateUserItem {
                        text: self.ice_breaker.clone(),
                    }));
                    actions.push(Action::SendControl(ControlCommand::RequestResponse {
                        instructions: None,
                    }));
                }
            }
            TransportEvent::SpeechStarted => {
                if self.phase == TurnPhase::Speaking {
                    // Barge-in: kill playback before anything else, and
                    // mark the turn so chunks still in flight for it get
                    // dropped. The provider's Interrupted event owns the
                    // turn flush.
                    actions.push(Action::InterruptPlayback);
                    self.cancelled_turn = Some(self.turn.turn_seq);
                }
                self.phase = TurnPhase::Listening;
            }
            TransportEvent::SpeechStopped => {
                self.phase = TurnPhase::Thinking;
            }
            TransportEvent::ResponseCreated => {
                self.phase = TurnPhase::Speaking;
                self.cancelled_turn = None;
            }
            TransportEvent::AudioChunk { data } => {
                // Chunks from a barged-in turn are dropped, not played.
                if self.cancelled_turn != Some(self.turn.turn_seq) {
                    // Gemini has no response lifecycle events; audio
                    // itself marks the model as speaking.
                    self.phase = TurnPhase::Speaking;
                    actions.push(Action::PlayAudio(data.clone()));
                }
            }
            TransportEvent::InputTranscriptDelta { text } => {
                self.turn.input.push_str(text);
            }
            TransportEvent::OutputTranscriptDelta { text } => {
                self.turn.output.push_str(text);
            }
            TransportEvent::TurnComplete => {
                self.flush_turn();
                self.phase = TurnPhase::Listening;
            }
            TransportEvent::ResponseDone => {
                // TurnComplete follows and owns the flush.
            }
            TransportEvent::Interrupted => {
                actions.push(Action::InterruptPlayback);
                self.flush_turn();
                self.phase = TurnPhase::Listening;
            }
            TransportEvent::ServerError { code, message } => {
                self.last_error = Some(format!("{code}: {message}"));
                self.status = SessionStatus::Error;
            }
            TransportEvent::Closed => {
                if self.status != SessionStatus::Error {
                    self.status = SessionStatus::Closed;
                }
            }
        }

        actions
    }

    /// Commit the current turn to history as a user/assistant pair.
    ///
    /// Both halves are always emitted, even when one side has no
    /// transcript, so the history stays strictly paired and turn counts
    /// derivable from it stay honest.
    fn flush_turn(&mut self) {
        let timestamp = now_millis();
        let input = std::mem::take(&mut self.turn.input);
        let output = std::mem::take(&mut self.turn.output);
        self.transcript.push(TranscriptEntry {
            role: Role::User,
            text: input,
            timestamp,
        });
        self.transcript.push(TranscriptEntry {
            role: Role::Assistant,
            text: output,
            timestamp,
        });
        self.turn.turn_seq += 1;
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Session ──────────────────────────────────────────────────────

/// Resources held while a conversation is running. Each is released
/// independently during stop, so a partially failed teardown still
/// frees the rest.
struct ActiveSession {
    transport: Arc<dyn Transport>,
    /// Shared with the event loop so its exit path can release the
    /// capture stream without waiting for an explicit stop call.
    microphone: Arc<Mutex<Option<Microphone>>>,
    visualizer_slot: AnalyzerSlot,
    loop_handle: JoinHandle<()>,
}

/// One voice conversation, from connect to close.
pub struct Session {
    config: ScenarioConfig,
    session_id: String,
    core: Arc<Mutex<SessionCore>>,
    status_tx: watch::Sender<StatusSnapshot>,
    status_rx: watch::Receiver<StatusSnapshot>,
    active: Option<ActiveSession>,
}

impl Session {
    pub fn new(config: ScenarioConfig) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let ice_breaker = config.ice_breaker();
        let core = Arc::new(Mutex::new(SessionCore::new(ice_breaker)));
        let (status_tx, status_rx) = watch::channel(StatusSnapshot {
            status: SessionStatus::Idle,
            phase: None,
        });
        Self {
            config,
            session_id,
            core,
            status_tx,
            status_rx,
            active: None,
        }
    }

    /// Watch channel publishing status and phase changes.
    pub fn status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_rx.clone()
    }

    /// Snapshot of the committed transcript history.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.core.lock().transcript.clone()
    }

    /// The analyzer slot feeding the visualizer, empty until started.
    pub fn analyzer_slot(&self) -> Option<AnalyzerSlot> {
        self.active
            .as_ref()
            .map(|active| Arc::clone(&active.visualizer_slot))
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Mute or unmute the microphone uplink.
    pub fn set_muted(&self, muted: bool) {
        if let Some(active) = self.active.as_ref() {
            if let Some(mic) = active.microphone.lock().as_ref() {
                mic.set_muted(muted);
            }
        }
    }

    /// Connect to the provider and start streaming.
    ///
    /// Starting an already active session is an error, never an implicit
    /// replacement of the running one.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyActive);
        }

        info!(
            session_id = %self.session_id,
            provider = ?self.config.provider,
            language = self.config.target_language.as_str(),
            "Starting session"
        );
        self.publish(StatusSnapshot {
            status: SessionStatus::Connecting,
            phase: None,
        });

        let api_key = self
            .config
            .api_key()
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        let (transport, events) =
            transport::connect(self.session_id.clone(), &api_key, &self.config)
                .await
                .map_err(|e| {
                    self.publish(StatusSnapshot {
                        status: SessionStatus::Error,
                        phase: None,
                    });
                    match e.downcast::<SessionError>() {
                        Ok(err) => err,
                        Err(e) => SessionError::Transport(format!("{e:#}")),
                    }
                })?;
        let transport: Arc<dyn Transport> = Arc::from(transport);

        let output_rate = transport.output_sample_rate();
        // Past this point the transport is live; any setup failure must
        // close it before surfacing the error.
        let (output, playback_done) = match CpalOutput::open(output_rate) {
            Ok(pair) => pair,
            Err(e) => {
                transport.close().await;
                self.publish(StatusSnapshot {
                    status: SessionStatus::Error,
                    phase: None,
                });
                return Err(SessionError::Transport(format!("Audio output: {e:#}")));
            }
        };
        let scheduler = Arc::new(PlaybackScheduler::new(output));

        let (microphone, frames) = match Microphone::open(transport.input_sample_rate()) {
            Ok(pair) => pair,
            Err(e) => {
                transport.close().await;
                self.publish(StatusSnapshot {
                    status: SessionStatus::Error,
                    phase: None,
                });
                return Err(e);
            }
        };
        let microphone = Arc::new(Mutex::new(Some(microphone)));

        let visualizer_slot: AnalyzerSlot =
            Arc::new(Mutex::new(Some(SpectrumAnalyzer::new(output_rate))));

        let loop_handle = tokio::spawn(run_event_loop(EventLoop {
            session_id: self.session_id.clone(),
            core: Arc::clone(&self.core),
            status_tx: self.status_tx.clone(),
            transport: Arc::clone(&transport),
            scheduler,
            visualizer_slot: Arc::clone(&visualizer_slot),
            microphone: Arc::clone(&microphone),
            output_rate,
            events,
            frames,
            playback_done,
        }));

        self.active = Some(ActiveSession {
            transport,
            microphone,
            visualizer_slot,
            loop_handle,
        });
        Ok(())
    }

    /// Close the session. Safe to call repeatedly; each held resource is
    /// released behind its own guard.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        info!(session_id = %self.session_id, "Stopping session");

        active.transport.close().await;
        if let Some(mic) = active.microphone.lock().take() {
            drop(mic);
        }
        active.visualizer_slot.lock().take();
        active.loop_handle.abort();

        self.publish(StatusSnapshot {
            status: SessionStatus::Closed,
            phase: None,
        });
    }

    fn publish(&self, snapshot: StatusSnapshot) {
        let _ = self.status_tx.send(snapshot);
    }
}

// ── Event loop ───────────────────────────────────────────────────

struct EventLoop<D: OutputDevice> {
    session_id: String,
    core: Arc<Mutex<SessionCore>>,
    status_tx: watch::Sender<StatusSnapshot>,
    transport: Arc<dyn Transport>,
    scheduler: Arc<PlaybackScheduler<D>>,
    visualizer_slot: AnalyzerSlot,
    microphone: Arc<Mutex<Option<Microphone>>>,
    output_rate: u32,
    events: mpsc::Receiver<TransportEvent>,
    frames: mpsc::Receiver<CaptureEvent>,
    playback_done: mpsc::UnboundedReceiver<u64>,
}

async fn run_event_loop<D: OutputDevice>(mut ctx: EventLoop<D>) {
    loop {
        tokio::select! {
            event = ctx.events.recv() => {
                let Some(event) = event else { break };
                let closing = matches!(event, TransportEvent::Closed);
                let (actions, snapshot) = {
                    let mut core = ctx.core.lock();
                    let actions = core.handle_event(&event);
                    (actions, core.snapshot())
                };
                let _ = ctx.status_tx.send(snapshot);

                for action in actions {
                    if let Err(e) = apply_action(&ctx, action).await {
                        warn!(session_id = %ctx.session_id, error = %e, "Action failed");
                    }
                }
                if closing {
                    break;
                }
            }
            frame = ctx.frames.recv() => {
                match frame {
                    Some(CaptureEvent::Frame(samples)) => {
                        let pcm = codec::floats_to_pcm16(&samples);
                        if let Err(e) = ctx.transport.send_audio_frame(&pcm).await {
                            warn!(session_id = %ctx.session_id, error = %e, "Audio uplink failed");
                        }
                    }
                    Some(CaptureEvent::Failed(message)) => {
                        error!(session_id = %ctx.session_id, error = %message, "Microphone failed");
                        let snapshot = {
                            let mut core = ctx.core.lock();
                            core.last_error = Some(message);
                            core.status = SessionStatus::Error;
                            core.snapshot()
                        };
                        let _ = ctx.status_tx.send(snapshot);
                        break;
                    }
                    None => break,
                }
            }
            done = ctx.playback_done.recv() => {
                match done {
                    Some(source) => ctx.scheduler.source_done(source),
                    None => break,
                }
            }
        }
    }

    // The loop owns the live audio path, so every exit releases it:
    // playback stops, the capture stream is dropped, the socket closes.
    ctx.scheduler.interrupt();
    if let Some(mic) = ctx.microphone.lock().take() {
        drop(mic);
    }
    ctx.transport.close().await;

    let snapshot = {
        let mut core = ctx.core.lock();
        if matches!(core.status, SessionStatus::Connecting | SessionStatus::Connected) {
            core.status = SessionStatus::Closed;
        }
        core.snapshot()
    };
    let _ = ctx.status_tx.send(snapshot);
    info!(session_id = %ctx.session_id, "Session event loop ended");
}

async fn apply_action<D: OutputDevice>(ctx: &EventLoop<D>, action: Action) -> anyhow::Result<()> {
    match action {
        Action::SendControl(command) => ctx.transport.send_control(command).await,
        Action::InterruptPlayback => {
            ctx.scheduler.interrupt();
            Ok(())
        }
        Action::PlayAudio(data) => {
            let buffer = codec::pcm16_to_buffer(&data, ctx.output_rate);
            if let Some(analyzer) = ctx.visualizer_slot.lock().as_mut() {
                analyzer.push_samples(&buffer.samples);
            }
            ctx.scheduler.enqueue(buffer)?;
            Ok(())
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::audio::codec::AudioBuffer;
    use crate::audio::playback::SourceId;

    fn core() -> SessionCore {
        SessionCore::new("¡Hola! ¿Cómo estás hoy?".to_string())
    }

    #[test]
    fn ready_sends_ice_breaker_once() {
        let mut core = core();
        let actions = core.handle_event(&TransportEvent::Ready);
        assert_eq!(
            actions,
            vec![
                Action::SendControl(ControlCommand::CreateUserItem {
                    text: "¡Hola! ¿Cómo estás hoy?".to_string()
                }),
                Action::SendControl(ControlCommand::RequestResponse { instructions: None }),
            ]
        );
        assert_eq!(core.status, SessionStatus::Connected);
        assert_eq!(core.phase, TurnPhase::Listening);

        // session.updated style duplicates stay quiet.
        assert!(core.handle_event(&TransportEvent::Ready).is_empty());
    }

    #[test]
    fn audio_implies_speaking() {
        let mut core = core();
        core.handle_event(&TransportEvent::Ready);
        let actions = core.handle_event(&TransportEvent::AudioChunk {
            data: vec![0, 0, 1, 0],
        });
        assert_eq!(core.phase, TurnPhase::Speaking);
        assert_eq!(actions, vec![Action::PlayAudio(vec![0, 0, 1, 0])]);
    }

    #[test]
    fn vad_drives_listening_and_thinking() {
        let mut core = core();
        core.handle_event(&TransportEvent::Ready);

        core.handle_event(&TransportEvent::SpeechStarted);
        assert_eq!(core.phase, TurnPhase::Listening);

        core.handle_event(&TransportEvent::SpeechStopped);
        assert_eq!(core.phase, TurnPhase::Thinking);

        core.handle_event(&TransportEvent::ResponseCreated);
        assert_eq!(core.phase, TurnPhase::Speaking);
    }

    #[test]
    fn barge_in_interrupts_before_listening() {
        let mut core = core();
        core.handle_event(&TransportEvent::Ready);
        core.handle_event(&TransportEvent::AudioChunk { data: vec![0, 0] });
        assert_eq!(core.phase, TurnPhase::Speaking);

        let actions = core.handle_event(&TransportEvent::SpeechStarted);
        assert_eq!(actions[0], Action::InterruptPlayback);
        assert_eq!(core.phase, TurnPhase::Listening);
    }

    #[test]
    fn late_audio_after_barge_in_is_dropped() {
        let mut core = core();
        core.handle_event(&TransportEvent::Ready);
        core.handle_event(&TransportEvent::AudioChunk { data: vec![0, 0] });
        core.handle_event(&TransportEvent::SpeechStarted);

        // A chunk of the cancelled response still in flight must not
        // reach the scheduler.
        let actions = core.handle_event(&TransportEvent::AudioChunk { data: vec![1, 0] });
        assert!(actions.is_empty());
        assert_eq!(core.phase, TurnPhase::Listening);

        // The provider confirms the cancellation; audio for the next
        // turn plays again.
        core.handle_event(&TransportEvent::Interrupted);
        let actions = core.handle_event(&TransportEvent::AudioChunk { data: vec![2, 0] });
        assert_eq!(actions, vec![Action::PlayAudio(vec![2, 0])]);
        assert_eq!(core.phase, TurnPhase::Speaking);
    }

    #[test]
    fn new_response_reopens_audio_after_barge_in() {
        let mut core = core();
        core.handle_event(&TransportEvent::Ready);
        core.handle_event(&TransportEvent::AudioChunk { data: vec![0, 0] });
        core.handle_event(&TransportEvent::SpeechStarted);
        assert!(core
            .handle_event(&TransportEvent::AudioChunk { data: vec![1, 0] })
            .is_empty());

        core.handle_event(&TransportEvent::ResponseCreated);
        assert_eq!(core.phase, TurnPhase::Speaking);
        let actions = core.handle_event(&TransportEvent::AudioChunk { data: vec![2, 0] });
        assert_eq!(actions, vec![Action::PlayAudio(vec![2, 0])]);
    }

    #[test]
    fn speech_while_listening_does_not_interrupt() {
        let mut core = core();
        core.handle_event(&TransportEvent::Ready);
        let actions = core.handle_event(&TransportEvent::SpeechStarted);
        assert!(actions.is_empty());
    }

    #[test]
    fn turn_complete_flushes_paired_entries() {
        let mut core = core();
        core.handle_event(&TransportEvent::Ready);
        core.handle_event(&TransportEvent::InputTranscriptDelta {
            text: "Hola".to_string(),
        });
        core.handle_event(&TransportEvent::InputTranscriptDelta {
            text: " amigo".to_string(),
        });
        core.handle_event(&TransportEvent::OutputTranscriptDelta {
            text: "¡Hola!".to_string(),
        });
        core.handle_event(&TransportEvent::TurnComplete);

        assert_eq!(core.transcript.len(), 2);
        assert_eq!(core.transcript[0].role, Role::User);
        assert_eq!(core.transcript[0].text, "Hola amigo");
        assert_eq!(core.transcript[1].role, Role::Assistant);
        assert_eq!(core.transcript[1].text, "¡Hola!");
        assert_eq!(core.turn.turn_seq, 1);
        assert!(core.turn.input.is_empty());
        assert_eq!(core.phase, TurnPhase::Listening);
    }

    #[test]
    fn flush_emits_empty_halves() {
        let mut core = core();
        core.handle_event(&TransportEvent::Ready);
        // Assistant spoke (ice-breaker turn), user said nothing.
        core.handle_event(&TransportEvent::OutputTranscriptDelta {
            text: "¿Qué tal tu día?".to_string(),
        });
        core.handle_event(&TransportEvent::TurnComplete);

        assert_eq!(core.transcript.len(), 2);
        assert_eq!(core.transcript[0].text, "");
        assert_eq!(core.transcript[1].text, "¿Qué tal tu día?");
    }

    #[test]
    fn interrupted_flushes_partial_turn() {
        let mut core = core();
        core.handle_event(&TransportEvent::Ready);
        core.handle_event(&TransportEvent::AudioChunk { data: vec![0, 0] });
        core.handle_event(&TransportEvent::OutputTranscriptDelta {
            text: "Iba a decir".to_string(),
        });

        let actions = core.handle_event(&TransportEvent::Interrupted);
        assert_eq!(actions, vec![Action::InterruptPlayback]);
        assert_eq!(core.transcript[1].text, "Iba a decir");
        assert_eq!(core.phase, TurnPhase::Listening);
    }

    #[test]
    fn response_done_leaves_flush_to_turn_complete() {
        let mut core = core();
        core.handle_event(&TransportEvent::Ready);
        core.handle_event(&TransportEvent::OutputTranscriptDelta {
            text: "Adiós".to_string(),
        });
        core.handle_event(&TransportEvent::ResponseDone);
        assert!(core.transcript.is_empty());
        core.handle_event(&TransportEvent::TurnComplete);
        assert_eq!(core.transcript.len(), 2);
    }

    #[test]
    fn server_error_and_close() {
        let mut core = core();
        core.handle_event(&TransportEvent::Ready);
        core.handle_event(&TransportEvent::ServerError {
            code: "rate_limit".to_string(),
            message: "slow down".to_string(),
        });
        assert_eq!(core.status, SessionStatus::Error);
        assert_eq!(core.last_error.as_deref(), Some("rate_limit: slow down"));

        // Close after an error keeps the error status visible.
        core.handle_event(&TransportEvent::Closed);
        assert_eq!(core.status, SessionStatus::Error);

        let mut core = SessionCore::new(String::new());
        core.handle_event(&TransportEvent::Ready);
        core.handle_event(&TransportEvent::Closed);
        assert_eq!(core.status, SessionStatus::Closed);
    }

    #[test]
    fn snapshot_hides_phase_until_connected() {
        let core = core();
        assert_eq!(core.snapshot().phase, None);

        let mut core = SessionCore::new(String::new());
        core.handle_event(&TransportEvent::Ready);
        assert_eq!(core.snapshot().phase, Some(TurnPhase::Listening));
    }

    #[tokio::test]
    async fn second_start_is_an_explicit_error() {
        let mut session = Session::new(ScenarioConfig::default());
        // Simulate a running session without touching hardware.
        session.active = Some(ActiveSession {
            transport: Arc::new(StubTransport::default()),
            microphone: Arc::new(Mutex::new(None)),
            visualizer_slot: Arc::new(Mutex::new(None)),
            loop_handle: tokio::spawn(async {}),
        });

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyActive));

        // Stop twice: second call is a no-op.
        session.stop().await;
        assert!(!session.is_active());
        session.stop().await;
        assert_eq!(session.status().borrow().status, SessionStatus::Closed);
    }

    #[tokio::test]
    async fn loop_exit_releases_transport_and_playback() {
        let transport = Arc::new(StubTransport::default());
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let scheduler = Arc::new(PlaybackScheduler::new(NullDevice));

        let (status_tx, status_rx) = watch::channel(StatusSnapshot {
            status: SessionStatus::Idle,
            phase: None,
        });
        let (events_tx, events) = mpsc::channel(8);
        let (_frames_tx, frames) = mpsc::channel(8);
        let (_done_tx, playback_done) = mpsc::unbounded_channel();

        events_tx.send(TransportEvent::Ready).await.unwrap();
        events_tx
            .send(TransportEvent::AudioChunk { data: vec![0, 0] })
            .await
            .unwrap();
        events_tx.send(TransportEvent::Closed).await.unwrap();

        run_event_loop(EventLoop {
            session_id: "test".to_string(),
            core: Arc::new(Mutex::new(SessionCore::new(String::new()))),
            status_tx,
            transport: dyn_transport,
            scheduler: Arc::clone(&scheduler),
            visualizer_slot: Arc::new(Mutex::new(None)),
            microphone: Arc::new(Mutex::new(None)),
            output_rate: 24000,
            events,
            frames,
            playback_done,
        })
        .await;

        assert!(transport.closed.load(Ordering::SeqCst));
        assert!(!scheduler.is_active());
        assert_eq!(status_rx.borrow().status, SessionStatus::Closed);
    }

    #[derive(Default)]
    struct StubTransport {
        closed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Transport for StubTransport {
        async fn send_audio_frame(&self, _pcm: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn send_control(&self, _command: ControlCommand) -> anyhow::Result<()> {
            Ok(())
        }
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn input_sample_rate(&self) -> u32 {
            24000
        }
        fn output_sample_rate(&self) -> u32 {
            24000
        }
    }

    struct NullDevice;

    impl OutputDevice for NullDevice {
        fn now(&self) -> f64 {
            0.0
        }
        fn start(&self, _source: SourceId, _buffer: AudioBuffer, _at: f64) -> anyhow::Result<()> {
            Ok(())
        }
        fn stop_all(&self) {}
    }
}
