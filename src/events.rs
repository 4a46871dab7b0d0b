//! Shared event vocabulary between transports and the session loop.
//!
//! Both realtime providers speak very different wire protocols, so each
//! transport translates its own messages into [`TransportEvent`]s and the
//! session consumes one stream regardless of backend. Commands flow the
//! other way as [`ControlCommand`]s.
//!
//! ## Flow
//!
//! ```text
//! microphone ──frames──▸ Transport ──wire──▸ provider
//!   Session ◂──TransportEvent──◂ Transport ◂──wire──◂
//!   Session ──ControlCommand──▸ Transport ──wire──▸
//! ```

// ── Transport → Session events ────────────────────────────────────

/// Events a transport surfaces to the session, normalized across
/// providers. Not every provider emits every variant; the session treats
/// missing signals as implicit (e.g. an [`AudioChunk`] while listening
/// means the model started speaking).
///
/// [`AudioChunk`]: TransportEvent::AudioChunk
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake finished; the provider accepts audio now.
    Ready,

    /// The model started generating a response.
    ResponseCreated,

    /// The model finished generating a response.
    ResponseDone,

    /// Server-side VAD detected the user speaking.
    SpeechStarted,

    /// Server-side VAD detected the user going quiet.
    SpeechStopped,

    /// Incremental transcript of what the user said.
    InputTranscriptDelta { text: String },

    /// Incremental transcript of what the model is saying.
    OutputTranscriptDelta { text: String },

    /// The model's spoken turn is complete.
    TurnComplete,

    /// The model was cut off mid-response by user speech.
    Interrupted,

    /// Synthesized audio, raw PCM16LE mono at the provider's output rate.
    AudioChunk { data: Vec<u8> },

    /// Provider-reported error.
    ServerError { code: String, message: String },

    /// The connection ended (shutdown or remote close).
    Closed,
}

// ── Session → Transport commands ──────────────────────────────────

/// Control-plane commands the session issues to the transport. Audio
/// frames take a separate path (`send_audio_frame`) since they are the
/// hot loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// Inject a synthetic user-role text item into the conversation.
    CreateUserItem { text: String },

    /// Ask the model to produce a spoken response, with optional
    /// one-shot instructions overriding the session prompt.
    RequestResponse { instructions: Option<String> },
}

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_compare_by_payload() {
        assert_eq!(
            TransportEvent::AudioChunk {
                data: vec![0, 1, 2]
            },
            TransportEvent::AudioChunk {
                data: vec![0, 1, 2]
            }
        );
        assert_ne!(TransportEvent::Ready, TransportEvent::Closed);
    }

    #[test]
    fn commands_carry_optional_instructions() {
        let cmd = ControlCommand::RequestResponse { instructions: None };
        match cmd {
            ControlCommand::RequestResponse { instructions } => assert!(instructions.is_none()),
            _ => panic!("Wrong variant"),
        }
    }
}
