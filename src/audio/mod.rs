//! Audio pipeline: codec, capture, playback, and visualization.
//!
//! ## Design
//!
//! - `codec`: PCM16LE ⇄ f32 conversion and base64 framing for JSON
//!   transports.
//! - `capture`: microphone input on a dedicated OS thread (audio streams
//!   are not `Send`), delivering fixed-size frames over a channel.
//! - `playback`: gapless scheduling of decoded chunks against a
//!   monotonically advancing clock, with instant interrupt for barge-in.
//! - `device`: the OS output backend behind the scheduler's
//!   [`OutputDevice`] trait.
//! - `visualizer`: FFT spectrum bins rendered while the model speaks.
//!
//! [`OutputDevice`]: playback::OutputDevice

pub mod capture;
pub mod codec;
pub mod device;
pub mod playback;
pub mod visualizer;
