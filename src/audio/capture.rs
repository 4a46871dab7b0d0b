//! Microphone capture pipeline.
//!
//! The input stream lives on its own OS thread (same `!Send` constraint
//! as playback) and feeds fixed-size mono frames through a channel. A
//! forwarding task applies the mute flag, so muting silences the uplink
//! without tearing down the hardware stream.
//!
//! ```text
//! cpal callback ──raw samples──▸ framer ──4096-sample frames──▸ session
//!                                             ▲
//!                                        mute flag
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::SessionError;

/// Samples per capture frame, matching the chunk size providers are
/// tuned for.
pub const FRAME_SAMPLES: usize = 4096;

/// Events from the capture pipeline.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// One mono frame of exactly [`FRAME_SAMPLES`] samples.
    Frame(Vec<f32>),
    /// The stream failed and no further frames will arrive.
    Failed(String),
}

/// Handle to a running microphone stream.
pub struct Microphone {
    muted: Arc<AtomicBool>,
    _shutdown_tx: std_mpsc::Sender<()>,
}

impl Microphone {
    /// Open the default input device at `sample_rate` Hz and start
    /// delivering frames.
    pub fn open(
        sample_rate: u32,
    ) -> Result<(Self, mpsc::Receiver<CaptureEvent>), SessionError> {
        let muted = Arc::new(AtomicBool::new(false));
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<CaptureEvent>();
        let (frame_tx, frame_rx) = mpsc::channel(256);
        let (ready_tx, ready_rx) = std_mpsc::channel::<anyhow::Result<()>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                if let Err(e) = run_input_stream(sample_rate, raw_tx, ready_tx, shutdown_rx) {
                    error!(error = %e, "Input stream failed");
                }
            })
            .map_err(|e| SessionError::MicrophoneDenied(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(SessionError::MicrophoneDenied(format!("{e:#}"))),
            Err(_) => {
                return Err(SessionError::MicrophoneDenied(
                    "Capture thread exited before ready".to_string(),
                ))
            }
        }

        // Forwarding task: applies the mute flag between the hardware
        // callback and the session. Muted frames are consumed and
        // dropped so the stream never backs up.
        let mute_flag = Arc::clone(&muted);
        tokio::spawn(async move {
            let mut dropped: u64 = 0;
            while let Some(event) = raw_rx.recv().await {
                match event {
                    CaptureEvent::Frame(_) if mute_flag.load(Ordering::Relaxed) => {
                        dropped += 1;
                        if dropped.is_multiple_of(50) {
                            debug!(dropped, "Dropping muted capture frames");
                        }
                    }
                    event => {
                        let terminal = matches!(event, CaptureEvent::Failed(_));
                        if frame_tx.send(event).await.is_err() || terminal {
                            break;
                        }
                    }
                }
            }
            debug!("Capture forwarding task ended");
        });

        info!(sample_rate, "Microphone opened");
        Ok((
            Self {
                muted,
                _shutdown_tx: shutdown_tx,
            },
            frame_rx,
        ))
    }

    /// Mute or unmute the uplink. The hardware stream keeps running.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
        info!(muted, "Microphone mute changed");
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }
}

// ── Audio thread ─────────────────────────────────────────────────

fn run_input_stream(
    sample_rate: u32,
    raw_tx: mpsc::UnboundedSender<CaptureEvent>,
    ready_tx: std_mpsc::Sender<anyhow::Result<()>>,
    shutdown_rx: std_mpsc::Receiver<()>,
) -> anyhow::Result<()> {
    let setup = move || -> anyhow::Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| anyhow!("No input audio device available"))?;
        let default_config = device
            .default_input_config()
            .context("Failed to query input device config")?;
        let channels = default_config.channels();

        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = match default_config.sample_format() {
            cpal::SampleFormat::F32 => {
                build_stream::<f32>(&device, &config, channels, raw_tx)?
            }
            cpal::SampleFormat::I16 => {
                build_stream::<i16>(&device, &config, channels, raw_tx)?
            }
            cpal::SampleFormat::U16 => {
                build_stream::<u16>(&device, &config, channels, raw_tx)?
            }
            format => anyhow::bail!("Unsupported input sample format: {format:?}"),
        };
        stream.play().context("Failed to start input stream")?;
        Ok(stream)
    };

    let stream = match setup() {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(anyhow!("{e:#}")));
            return Ok(());
        }
    };
    let _keep_alive = stream;

    let _ = shutdown_rx.recv();
    Ok(())
}

/// Build the input stream for the device's native sample type. Samples
/// are converted to f32, downmixed to mono, and re-framed to exactly
/// [`FRAME_SAMPLES`] regardless of the callback's buffer size.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: u16,
    raw_tx: mpsc::UnboundedSender<CaptureEvent>,
) -> anyhow::Result<cpal::Stream>
where
    T: Sample + SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let err_tx = raw_tx.clone();
    let mut pending: Vec<f32> = Vec::with_capacity(FRAME_SAMPLES * 2);

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for frame in data.chunks(channels as usize) {
                let sum: f32 = frame.iter().map(|&s| s.to_sample::<f32>()).sum();
                pending.push(sum / channels as f32);
            }
            while pending.len() >= FRAME_SAMPLES {
                let frame: Vec<f32> = pending.drain(..FRAME_SAMPLES).collect();
                if raw_tx.send(CaptureEvent::Frame(frame)).is_err() {
                    return;
                }
            }
        },
        move |e| {
            warn!(error = %e, "Input stream error");
            let _ = err_tx.send(CaptureEvent::Failed(e.to_string()));
        },
        None,
    )?;
    Ok(stream)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_matches_provider_chunking() {
        assert_eq!(FRAME_SAMPLES, 4096);
    }

    #[tokio::test]
    async fn mute_flag_drops_frames_in_forwarder() {
        // Exercise the forwarding logic directly with a fake raw feed.
        let muted = Arc::new(AtomicBool::new(false));
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<CaptureEvent>();
        let (frame_tx, mut frame_rx) = mpsc::channel(16);

        let mute_flag = Arc::clone(&muted);
        tokio::spawn(async move {
            while let Some(event) = raw_rx.recv().await {
                match event {
                    CaptureEvent::Frame(_) if mute_flag.load(Ordering::Relaxed) => {}
                    event => {
                        if frame_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        raw_tx.send(CaptureEvent::Frame(vec![0.1; 4])).unwrap();
        assert!(matches!(
            frame_rx.recv().await,
            Some(CaptureEvent::Frame(_))
        ));

        muted.store(true, Ordering::Relaxed);
        raw_tx.send(CaptureEvent::Frame(vec![0.2; 4])).unwrap();
        raw_tx.send(CaptureEvent::Failed("gone".to_string())).unwrap();

        // The muted frame is swallowed; the failure still comes through.
        assert!(matches!(
            frame_rx.recv().await,
            Some(CaptureEvent::Failed(_))
        ));
    }
}
