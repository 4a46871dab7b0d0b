//! cpal-backed output device.
//!
//! `cpal::Stream` is not `Send`, so the stream lives on a dedicated OS
//! thread for the life of the device. The rest of the program only
//! touches the shared mixer state, which is `Send`, through
//! [`CpalOutput`].
//!
//! The mixer clock counts output samples written by the callback, which
//! makes [`OutputDevice::now`] track actual playback position rather
//! than wall time.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::codec::AudioBuffer;
use super::playback::{OutputDevice, SourceId};

// ── Mixer state ──────────────────────────────────────────────────

struct ActiveSource {
    id: SourceId,
    samples: Vec<f32>,
    /// Mixer clock sample at which this source begins.
    start_sample: u64,
}

struct MixerState {
    /// Output samples written so far. The device clock.
    clock_samples: u64,
    sources: Vec<ActiveSource>,
}

// ── Output device ────────────────────────────────────────────────

/// Mono output device at a fixed sample rate.
pub struct CpalOutput {
    sample_rate: u32,
    state: Arc<Mutex<MixerState>>,
    /// Dropping this unparks the audio thread and ends the stream.
    _shutdown_tx: std_mpsc::Sender<()>,
}

impl CpalOutput {
    /// Open the default output device at `sample_rate` Hz mono.
    ///
    /// Returns the device plus a receiver of completed source ids, which
    /// the caller forwards into `PlaybackScheduler::source_done`.
    pub fn open(
        sample_rate: u32,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<SourceId>)> {
        let state = Arc::new(Mutex::new(MixerState {
            clock_samples: 0,
            sources: Vec::new(),
        }));
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel::<anyhow::Result<()>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let thread_state = Arc::clone(&state);
        std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                if let Err(e) =
                    run_output_stream(sample_rate, thread_state, done_tx, ready_tx, shutdown_rx)
                {
                    error!(error = %e, "Output stream failed");
                }
            })
            .context("Failed to spawn audio output thread")?;

        // Readiness is signalled once the stream is playing, before the
        // thread parks on shutdown_rx.
        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow!("Audio output thread exited before ready")),
        }

        info!(sample_rate, "Output device opened");
        Ok((
            Self {
                sample_rate,
                state,
                _shutdown_tx: shutdown_tx,
            },
            done_rx,
        ))
    }
}

impl OutputDevice for CpalOutput {
    fn now(&self) -> f64 {
        self.state.lock().clock_samples as f64 / self.sample_rate as f64
    }

    fn start(&self, source: SourceId, buffer: AudioBuffer, at: f64) -> anyhow::Result<()> {
        let samples = if buffer.sample_rate == self.sample_rate {
            buffer.samples
        } else {
            resample_linear(&buffer.samples, buffer.sample_rate, self.sample_rate)
        };
        let start_sample = (at * self.sample_rate as f64).round() as u64;

        let mut state = self.state.lock();
        state.sources.push(ActiveSource {
            id: source,
            samples,
            start_sample,
        });
        Ok(())
    }

    fn stop_all(&self) {
        let mut state = self.state.lock();
        let swept = state.sources.len();
        state.sources.clear();
        debug!(swept, "Stopped all output sources");
    }
}

// ── Audio thread ─────────────────────────────────────────────────

/// Build the output stream and park until shutdown. The stream object
/// must stay on this thread.
fn run_output_stream(
    sample_rate: u32,
    state: Arc<Mutex<MixerState>>,
    done_tx: mpsc::UnboundedSender<SourceId>,
    ready_tx: std_mpsc::Sender<anyhow::Result<()>>,
    shutdown_rx: std_mpsc::Receiver<()>,
) -> anyhow::Result<()> {
    let setup = || -> anyhow::Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("No output audio device available"))?;

        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let err_fn = |e| error!(error = %e, "Output stream error");
        let stream = device
            .build_output_stream(
                &config,
                move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    mix_into(out, &state, &done_tx);
                },
                err_fn,
                None,
            )
            .context("Failed to build output stream")?;
        stream.play().context("Failed to start output stream")?;
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

    // Parked here until CpalOutput drops its sender.
    let _ = shutdown_rx.recv();
    Ok(())
}

/// Fill one callback buffer by summing every source active at the
/// current clock position. Finished sources are reported and removed.
fn mix_into(
    out: &mut [f32],
    state: &Mutex<MixerState>,
    done_tx: &mpsc::UnboundedSender<SourceId>,
) {
    let mut state = state.lock();
    let clock = state.clock_samples;

    for (i, slot) in out.iter_mut().enumerate() {
        let t = clock + i as u64;
        let mut acc = 0.0f32;
        for source in &state.sources {
            if t >= source.start_sample {
                let pos = (t - source.start_sample) as usize;
                if let Some(&sample) = source.samples.get(pos) {
                    acc += sample;
                }
            }
        }
        *slot = acc.clamp(-1.0, 1.0);
    }

    state.clock_samples += out.len() as u64;
    let end = state.clock_samples;
    state.sources.retain(|source| {
        let finished = source.start_sample + source.samples.len() as u64 <= end;
        if finished {
            let _ = done_tx.send(source.id);
        }
        !finished
    });
}

/// Linear-interpolation resampler for the rare case where a buffer's
/// rate differs from the device rate.
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return Vec::new();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (samples.len() as f64 / ratio).ceil() as usize;
    (0..out_len)
        .map(|i| {
            let src = i as f64 * ratio;
            let idx = src as usize;
            let frac = (src - idx as f64) as f32;
            let a = samples.get(idx).copied().unwrap_or(0.0);
            let b = samples.get(idx + 1).copied().unwrap_or(a);
            a + (b - a) * frac
        })
        .collect()
}

// ── Tests ────────────────────────────────────────────────────────
