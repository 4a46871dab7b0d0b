//! Session-level error types.
//!
//! Most fallible paths use `anyhow::Result` directly; this enum exists
//! for the failures a caller is expected to branch on, mainly so the CLI
//! can print a useful hint instead of a raw error chain.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The OS denied microphone access or no input device exists.
    #[error("Microphone unavailable: {0}")]
    MicrophoneDenied(String),

    /// Call negotiation was rejected by the provider.
    #[error("Negotiation failed (HTTP {status}): {body}")]
    Negotiation { status: u16, body: String },

    /// The transport dropped or refused the connection.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A session was started while one is already running.
    #[error("Session already active")]
    AlreadyActive,
}
