//! Error types for each subsystem of the realtime core.
//!
//! Every fallible operation reports through one of these enums; none of them
//! is allowed to escape into an unrelated subsystem.

use thiserror::Error;

/// Failures of the streaming socket.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Network or transport failure. Recoverable.
    #[error("transport error: {0}")]
    Transport(String),
    /// The backend closed the session for good (close code 1000 or 4004).
    #[error("session {session_id} ended (close code {code}): {reason}")]
    SessionTerminal {
        session_id: String,
        code: u16,
        reason: String,
    },
}

/// Failures of the two-phase session bootstrap.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("session start request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("session start rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid api base url `{0}`")]
    InvalidUrl(String),
}

/// A text frame that could not be turned into a typed event.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("frame has no `type` discriminator")]
    MissingDiscriminator,
    #[error("unrecognized event type `{0}`")]
    UnknownType(String),
    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Microphone acquisition failures. The messages are shown to the user as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("Microphone access was denied. Allow microphone access and try again.")]
    PermissionDenied,
    #[error("Could not access the microphone: {0}")]
    Unavailable(String),
    #[error("The microphone is already in use.")]
    Busy,
}

/// Speech backend failures. The queue records them and moves on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SynthesisError {
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),
    #[error("speech playback failed: {0}")]
    Playback(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_errors_are_distinct_user_messages() {
        let denied = DeviceError::PermissionDenied.to_string();
        let unavailable = DeviceError::Unavailable("no input device".into()).to_string();

        assert_ne!(denied, unavailable);
        assert!(denied.contains("denied"));
        assert!(unavailable.contains("no input device"));
    }

    #[test]
    fn test_terminal_error_display() {
        let err = ConnectionError::SessionTerminal {
            session_id: "abc".into(),
            code: 4004,
            reason: "Session not found".into(),
        };
        assert_eq!(
            err.to_string(),
            "session abc ended (close code 4004): Session not found"
        );
    }
}
