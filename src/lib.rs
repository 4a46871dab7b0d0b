//! Charla — real-time voice conversation client for language practice.
//!
//! Connects a local microphone to a realtime speech model (OpenAI Realtime
//! or Gemini Live), streams synthesized speech back through a gapless
//! playback scheduler, and keeps a turn-taking state machine in sync with
//! the interleaved server events.
//!
//! ## Design
//! - Trait-driven transport abstraction (`Transport`) with two backends:
//!   a negotiated call channel (OpenAI Realtime) and a single streamed
//!   socket (Gemini Live). Both emit the same `TransportEvent` vocabulary.
//! - One session event loop is the sole mutator of conversation state;
//!   transports and the capture pipeline only publish typed events.
//! - Playback is scheduled against a monotonic clock so audio chunks that
//!   arrive with network jitter still play back-to-back without gaps.
//! - Scenario configuration (language, proficiency, persona, voice) is
//!   plain TOML; API keys come from the environment.

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod session;
pub mod transport;

pub use audio::codec::AudioBuffer;
pub use audio::playback::PlaybackScheduler;
pub use config::{Proficiency, ProviderKind, ScenarioConfig, TargetLanguage};
pub use error::SessionError;
pub use events::{ControlCommand, TransportEvent};
pub use session::{Session, SessionStatus, TranscriptEntry, TurnPhase};
