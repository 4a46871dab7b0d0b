//! Realtime provider transports.
//!
//! One trait, two wire strategies:
//!
//! - `openai_realtime`: a negotiated call. The offer/answer exchange
//!   happens over HTTPS, then audio flows as binary frames on the call
//!   channel while JSON control events arrive on a side channel keyed
//!   by the call id.
//! - `gemini_live`: a single bidirectional WebSocket carrying setup,
//!   base64 audio, and server content.
//!
//! Both implementations translate their wire protocol into the shared
//! [`TransportEvent`] stream, so the session never branches on provider.

pub mod gemini_live;
pub mod openai_realtime;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{ProviderKind, ScenarioConfig};
use crate::events::{ControlCommand, TransportEvent};

/// Capacity of the outbound and event channels. Audio frames are ~170ms
/// each, so 256 buffers well over an hour of backlog before backpressure.
pub(crate) const CHANNEL_CAPACITY: usize = 256;

/// A live connection to a realtime speech provider.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame of raw PCM16LE microphone audio at
    /// [`input_sample_rate`](Transport::input_sample_rate).
    async fn send_audio_frame(&self, pcm: &[u8]) -> anyhow::Result<()>;

    /// Send a control-plane command.
    async fn send_control(&self, command: ControlCommand) -> anyhow::Result<()>;

    /// Close the connection gracefully. Idempotent.
    async fn close(&self);

    /// Sample rate this provider expects for microphone audio.
    fn input_sample_rate(&self) -> u32;

    /// Sample rate of audio the provider sends back.
    fn output_sample_rate(&self) -> u32;
}

/// Connect to the provider named in the scenario.
///
/// Returns the transport handle plus the event stream. The first event
/// is [`TransportEvent::Ready`] once the provider accepts audio.
pub async fn connect(
    session_id: String,
    api_key: &str,
    config: &ScenarioConfig,
) -> anyhow::Result<(Box<dyn Transport>, mpsc::Receiver<TransportEvent>)> {
    match config.provider {
        ProviderKind::OpenAiRealtime => {
            let (transport, events) =
                openai_realtime::OpenAiRealtimeTransport::connect(session_id, api_key, config)
                    .await?;
            Ok((Box::new(transport), events))
        }
        ProviderKind::GeminiLive => {
            let (transport, events) =
                gemini_live::GeminiLiveTransport::connect(session_id, api_key, config).await?;
            Ok((Box::new(transport), events))
        }
    }
}
