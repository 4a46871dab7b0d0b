//! Gapless playback scheduling for streamed response audio.
//!
//! Response audio arrives as a stream of short PCM chunks. Each chunk is
//! scheduled to start exactly where the previous one ends, against a
//! cursor that only moves forward. The cursor lives in the device's time
//! base, so scheduling stays sample-accurate even when chunks arrive in
//! bursts.
//!
//! ## Design
//!
//! - `enqueue` schedules at `max(cursor, device.now())`: back-to-back
//!   while chunks keep coming, immediate after a gap.
//! - `interrupt` stops every active source and resets the cursor to
//!   zero, so post-interrupt audio plays without waiting out the
//!   cancelled tail. This is the playback half of barge-in.
//! - The scheduler never talks to an OS API directly; it drives an
//!   [`OutputDevice`], which keeps the timing logic deterministic under
//!   test.

use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::codec::AudioBuffer;

/// Identifier for one scheduled audio source.
pub type SourceId = u64;

// ── Output device trait ──────────────────────────────────────────

/// The OS-facing half of playback. `cpal` provides the real
/// implementation; tests drive a manual clock.
pub trait OutputDevice: Send + Sync {
    /// Current position of the device clock, in seconds. Monotonic.
    fn now(&self) -> f64;

    /// Begin playing `buffer` at device time `at`, tagged with `source`
    /// so completion can be reported back.
    fn start(&self, source: SourceId, buffer: AudioBuffer, at: f64) -> anyhow::Result<()>;

    /// Immediately stop every source started so far.
    fn stop_all(&self);
}

// ── Scheduler ────────────────────────────────────────────────────

struct SchedulerState {
    /// Device time where the next chunk should begin.
    cursor: f64,
    /// Sources started but not yet reported done.
    active: HashSet<SourceId>,
    next_id: SourceId,
}

/// Schedules decoded chunks gaplessly onto an [`OutputDevice`].
pub struct PlaybackScheduler<D: OutputDevice> {
    device: D,
    state: Mutex<SchedulerState>,
}

impl<D: OutputDevice> PlaybackScheduler<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            state: Mutex::new(SchedulerState {
                cursor: 0.0,
                active: HashSet::new(),
                next_id: 0,
            }),
        }
    }

    /// Schedule a chunk for playback. Returns the source id, or `None`
    /// for an empty chunk (nothing to play, cursor untouched).
    pub fn enqueue(&self, buffer: AudioBuffer) -> anyhow::Result<Option<SourceId>> {
        if buffer.samples.is_empty() {
            return Ok(None);
        }

        let mut state = self.state.lock();
        let start_at = state.cursor.max(self.device.now());
        let id = state.next_id;
        state.next_id += 1;

        self.device.start(id, buffer.clone(), start_at)?;
        state.cursor = start_at + buffer.duration_secs();
        state.active.insert(id);

        debug!(
            source = id,
            start_at,
            duration_secs = buffer.duration_secs(),
            "Scheduled audio chunk"
        );
        Ok(Some(id))
    }

    /// Mark a source as finished. Called from the device's completion
    /// path; unknown ids are ignored (the source may have been swept by
    /// an interrupt already).
    pub fn source_done(&self, source: SourceId) {
        let mut state = self.state.lock();
        if !state.active.remove(&source) {
            debug!(source, "Completion for unknown source (already swept)");
        }
    }

    /// Stop everything and rewind the cursor. Safe to call when idle.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        let swept = state.active.len();
        self.device.stop_all();
        state.active.clear();
        state.cursor = 0.0;
        if swept > 0 {
            warn!(swept, "Playback interrupted");
        }
    }

    /// Whether any source is still playing or pending.
    pub fn is_active(&self) -> bool {
        !self.state.lock().active.is_empty()
    }

    /// Device time where the next chunk would start.
    pub fn cursor(&self) -> f64 {
        self.state.lock().cursor
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Test device with a manually advanced clock. Records every start
    /// and stop so scheduling decisions can be asserted exactly.
    struct ManualDevice {
        /// Clock in microseconds, to keep the atomic simple.
        now_us: AtomicU64,
        starts: Mutex<Vec<(SourceId, f64, f64)>>,
        stop_all_calls: AtomicU64,
    }

    impl ManualDevice {
        fn new() -> Self {
            Self {
                now_us: AtomicU64::new(0),
                starts: Mutex::new(Vec::new()),
                stop_all_calls: AtomicU64::new(0),
            }
        }

        fn advance_to(&self, secs: f64) {
            self.now_us.store((secs * 1e6) as u64, Ordering::SeqCst);
        }
    }

    impl OutputDevice for ManualDevice {
        fn now(&self) -> f64 {
            self.now_us.load(Ordering::SeqCst) as f64 / 1e6
        }

        fn start(&self, source: SourceId, buffer: AudioBuffer, at: f64) -> anyhow::Result<()> {
            self.starts
                .lock()
                .push((source, at, buffer.duration_secs()));
            Ok(())
        }

        fn stop_all(&self) {
            self.stop_all_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn chunk(duration_secs: f64) -> AudioBuffer {
        AudioBuffer {
            samples: vec![0.0; (duration_secs * 24000.0) as usize],
            sample_rate: 24000,
            channels: 1,
        }
    }

    #[test]
    fn chunks_schedule_back_to_back() {
        let scheduler = PlaybackScheduler::new(ManualDevice::new());
        scheduler.enqueue(chunk(1.0)).unwrap();
        scheduler.enqueue(chunk(0.5)).unwrap();
        scheduler.enqueue(chunk(0.25)).unwrap();

        let starts = scheduler.device.starts.lock();
        assert_eq!(starts[0].1, 0.0);
        assert_eq!(starts[1].1, 1.0);
        assert_eq!(starts[2].1, 1.5);
    }

    #[test]
    fn late_chunk_starts_at_device_now() {
        let scheduler = PlaybackScheduler::new(ManualDevice::new());
        scheduler.enqueue(chunk(1.0)).unwrap();

        // A gap in the stream: device time passes the cursor.
        scheduler.device.advance_to(2.5);
        scheduler.enqueue(chunk(1.0)).unwrap();

        let starts = scheduler.device.starts.lock();
        assert_eq!(starts[1].1, 2.5);
    }

    #[test]
    fn interrupt_stops_sources_and_rewinds_cursor() {
        let scheduler = PlaybackScheduler::new(ManualDevice::new());
        scheduler.enqueue(chunk(1.0)).unwrap();
        scheduler.enqueue(chunk(1.0)).unwrap();
        assert!(scheduler.is_active());

        scheduler.interrupt();
        assert!(!scheduler.is_active());
        assert_eq!(scheduler.cursor(), 0.0);
        assert_eq!(scheduler.device.stop_all_calls.load(Ordering::SeqCst), 1);

        // Post-interrupt audio plays immediately, not after the old tail.
        scheduler.device.advance_to(0.2);
        scheduler.enqueue(chunk(0.5)).unwrap();
        let starts = scheduler.device.starts.lock();
        assert_eq!(starts[2].1, 0.2);
    }

    #[test]
    fn interrupt_when_idle_is_harmless() {
        let scheduler = PlaybackScheduler::new(ManualDevice::new());
        scheduler.interrupt();
        assert_eq!(scheduler.cursor(), 0.0);
    }

    #[test]
    fn empty_chunk_is_skipped() {
        let scheduler = PlaybackScheduler::new(ManualDevice::new());
        assert_eq!(scheduler.enqueue(chunk(0.0)).unwrap(), None);
        assert!(scheduler.device.starts.lock().is_empty());
        assert_eq!(scheduler.cursor(), 0.0);
    }

    #[test]
    fn completion_drains_active_set() {
        let scheduler = PlaybackScheduler::new(ManualDevice::new());
        let id = scheduler.enqueue(chunk(0.1)).unwrap().unwrap();
        assert!(scheduler.is_active());

        scheduler.source_done(id);
        assert!(!scheduler.is_active());

        // Stale completion after an interrupt sweep is ignored.
        scheduler.source_done(id);
        assert!(!scheduler.is_active());
    }
}
