//! Realtime core of the tutoring client.
//!
//! This crate holds everything that talks to the teaching backend or to the
//! audio hardware, independent of any particular front end:
//!
//! - `connection`: session bootstrap, socket lifecycle and reconnection.
//! - `protocol`: the typed event taxonomy exchanged over the socket.
//! - `dispatcher` / `projector`: listener fan-out and the projected session state.
//! - `vad`: energy-based voice activity detection over microphone frames.
//! - `microphone`: scoped microphone acquisition.
//! - `speech`: the text-to-speech output queue and its backends.

pub mod audio_utils;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod microphone;
pub mod projector;
pub mod protocol;
pub mod speech;
pub mod vad;

pub use connection::{ConnectionManager, ConnectionSnapshot, ConnectionStatus};
pub use dispatcher::{EventDispatcher, EventHandler, Subscription};
pub use projector::{SessionState, StateProjector};
pub use protocol::{ClientEvent, InboundFrame, ServerEvent, SessionId};
pub use speech::{SpeechQueue, SpeechSettings, SpeechState};
pub use vad::{VadConfig, VoiceActivityDetector, VoiceActivityHandler};
