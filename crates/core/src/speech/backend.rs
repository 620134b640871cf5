use super::SpeechSettings;
use crate::error::SynthesisError;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// One unit of speech with the settings in force when it was dequeued.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    pub settings: SpeechSettings,
}

/// Playback lifecycle, the same for every backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Started,
    Paused,
    Resumed,
    Ended,
    Failed(SynthesisError),
}

pub type LifecycleSink = mpsc::UnboundedSender<Lifecycle>;

/// A way of turning text into audible speech.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Speaks `utterance` and returns once playback is over. Implementations
    /// report [`Lifecycle::Started`] on `lifecycle` when audio begins; the
    /// end and failure are reported by the return value.
    ///
    /// The returned future may be dropped at any point to abandon the
    /// utterance.
    async fn speak(
        &self,
        utterance: Utterance,
        lifecycle: LifecycleSink,
    ) -> Result<(), SynthesisError>;

    /// Returns whether playback was paused.
    fn pause(&self) -> bool;

    /// Returns whether playback was resumed.
    fn resume(&self) -> bool;

    /// Silences whatever is playing.
    fn cancel(&self);
}
