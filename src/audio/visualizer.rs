//! Terminal spectrum visualizer for response audio.
//!
//! A [`SpectrumAnalyzer`] keeps a sliding window of recent output
//! samples and turns it into a handful of log-spaced frequency bins.
//! The [`Visualizer`] task polls it at ~30fps and redraws a single bar
//! row while the model speaks. The analyzer slot may be empty (audio
//! output disabled or not yet running); the loop just idles until one
//! appears.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use tokio::task::JoinHandle;
use tracing::debug;

const FFT_SIZE: usize = 512;
const FRAME_INTERVAL: std::time::Duration = std::time::Duration::from_millis(33);
const BAR_GLYPHS: &[char] = &[' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

// ── Spectrum analyzer ────────────────────────────────────────────

/// Sliding-window FFT over the most recent output samples.
pub struct SpectrumAnalyzer {
    sample_rate: u32,
    fft: Arc<dyn Fft<f32>>,
    /// Pre-computed Hanning window.
    window: Vec<f32>,
    /// Last FFT_SIZE samples seen.
    ring: Vec<f32>,
}

impl SpectrumAnalyzer {
    pub fn new(sample_rate: u32) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);
        let window: Vec<f32> = (0..FFT_SIZE)
            .map(|i| {
                0.5 * (1.0
                    - (2.0 * std::f32::consts::PI * i as f32 / (FFT_SIZE - 1) as f32).cos())
            })
            .collect();
        Self {
            sample_rate,
            fft,
            window,
            ring: vec![0.0; FFT_SIZE],
        }
    }

    /// Feed newly played samples into the sliding window.
    pub fn push_samples(&mut self, samples: &[f32]) {
        if samples.len() >= FFT_SIZE {
            self.ring.copy_from_slice(&samples[samples.len() - FFT_SIZE..]);
        } else {
            self.ring.drain(..samples.len());
            self.ring.extend_from_slice(samples);
        }
    }

    /// Compute `count` log-spaced magnitude bins, each in [0, 1].
    pub fn bins(&self, count: usize) -> Vec<f32> {
        if count == 0 {
            return Vec::new();
        }

        let mut buffer: Vec<Complex<f32>> = self
            .ring
            .iter()
            .zip(self.window.iter())
            .map(|(&s, &w)| Complex::new(s * w, 0.0))
            .collect();
        self.fft.process(&mut buffer);

        let num_bins = FFT_SIZE / 2;
        let magnitudes: Vec<f32> = buffer[..num_bins]
            .iter()
            .map(|c| c.norm() / num_bins as f32)
            .collect();

        (0..count)
            .map(|i| {
                let lo = self.freq_bin(i as f32 / count as f32, num_bins);
                let hi = self.freq_bin((i + 1) as f32 / count as f32, num_bins);
                let lo = lo.floor() as usize;
                let hi = (hi.ceil() as usize).clamp(lo + 1, num_bins);
                let peak = magnitudes[lo..hi].iter().cloned().fold(0.0f32, f32::max);
                // Perceptual compression so quiet bins still register.
                (peak * 40.0).sqrt().min(1.0)
            })
            .collect()
    }

    /// Map a normalized position to a fractional FFT bin on a log
    /// frequency axis (20 Hz up to Nyquist).
    fn freq_bin(&self, pos: f32, num_bins: usize) -> f32 {
        const MIN_FREQ: f32 = 20.0;
        let max_freq = self.sample_rate as f32 / 2.0;
        let log_freq = MIN_FREQ.log10() + pos * (max_freq.log10() - MIN_FREQ.log10());
        let freq = 10.0f32.powf(log_freq);
        (freq * FFT_SIZE as f32 / self.sample_rate as f32).clamp(0.0, (num_bins - 1) as f32)
    }
}

// ── Visualizer task ──────────────────────────────────────────────

/// Shared slot the playback path fills with an analyzer once output is
/// running.
pub type AnalyzerSlot = Arc<Mutex<Option<SpectrumAnalyzer>>>;

pub struct Visualizer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Visualizer {
    /// Start the render loop, drawing `width` bars to `out` until
    /// [`stop`] is called.
    ///
    /// [`stop`]: Visualizer::stop
    pub fn spawn<W>(slot: AnalyzerSlot, mut out: W, width: usize) -> Self
    where
        W: Write + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(FRAME_INTERVAL);
            while !stop_flag.load(Ordering::Relaxed) {
                interval.tick().await;

                let levels = slot.lock().as_ref().map(|analyzer| analyzer.bins(width));
                let Some(levels) = levels else {
                    // No analyzer yet; keep polling.
                    continue;
                };
                let row = render_bars(&levels);
                if write!(out, "\r{row}").and_then(|_| out.flush()).is_err() {
                    break;
                }
            }
            debug!("Visualizer loop ended");
        });

        Self { stop, handle }
    }

    /// End the render loop. The final frame may still be in flight.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.abort();
    }
}

/// Map bin levels to block glyphs.
fn render_bars(levels: &[f32]) -> String {
    levels
        .iter()
        .map(|&level| {
            let idx = (level.clamp(0.0, 1.0) * (BAR_GLYPHS.len() - 1) as f32).round() as usize;
            BAR_GLYPHS[idx]
        })
        .collect()
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_yields_flat_bins() {
        let analyzer = SpectrumAnalyzer::new(24000);
        let bins = analyzer.bins(16);
        assert_eq!(bins.len(), 16);
        assert!(bins.iter().all(|&b| b < 0.05), "bins: {bins:?}");
    }

    #[test]
    fn pure_tone_peaks_in_one_region() {
        let mut analyzer = SpectrumAnalyzer::new(24000);
        // 1 kHz sine at full scale.
        let samples: Vec<f32> = (0..FFT_SIZE)
            .map(|i| (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / 24000.0).sin())
            .collect();
        analyzer.push_samples(&samples);

        let bins = analyzer.bins(16);
        let max = bins.iter().cloned().fold(0.0f32, f32::max);
        assert!(max > 0.5, "expected a strong peak, got {bins:?}");
        // Energy is concentrated, not smeared across every bin.
        let loud = bins.iter().filter(|&&b| b > max * 0.8).count();
        assert!(loud <= 4, "bins: {bins:?}");
    }

    #[test]
    fn short_pushes_slide_the_window() {
        let mut analyzer = SpectrumAnalyzer::new(24000);
        analyzer.push_samples(&[0.5; 100]);
        assert_eq!(analyzer.ring.len(), FFT_SIZE);
        assert_eq!(analyzer.ring[FFT_SIZE - 1], 0.5);
        assert_eq!(analyzer.ring[0], 0.0);
    }

    #[test]
    fn bar_rendering_spans_glyphs() {
        let row = render_bars(&[0.0, 0.5, 1.0]);
        let chars: Vec<char> = row.chars().collect();
        assert_eq!(chars.len(), 3);
        assert_eq!(chars[0], ' ');
        assert_eq!(chars[2], '█');
    }

    #[tokio::test]
    async fn empty_slot_renders_nothing_and_stops_cleanly() {
        let slot: AnalyzerSlot = Arc::new(Mutex::new(None));
        let sink: Vec<u8> = Vec::new();
        let visualizer = Visualizer::spawn(Arc::clone(&slot), sink, 8);

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        visualizer.stop();
        // Loop must not panic on the empty slot.
        assert!(slot.lock().is_none());
    }
}
