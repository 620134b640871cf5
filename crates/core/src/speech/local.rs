//! Speech through a voice engine installed on this machine.

use super::{
    SpeechSettings,
    backend::{Lifecycle, LifecycleSink, SpeechBackend, Utterance},
};
use crate::error::SynthesisError;
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::{debug, instrument};

/// How long to wait for an empty voice directory to populate.
pub const DEFAULT_VOICE_WAIT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voice {
    pub id: String,
    pub name: String,
    /// BCP 47 tag, e.g. `en-US`.
    pub language: String,
    pub high_quality: bool,
    pub is_default: bool,
}

/// A platform speech engine.
#[async_trait]
pub trait VoiceEngine: Send + Sync {
    /// The voices currently known. May be empty until the engine has loaded
    /// its directory.
    fn voices(&self) -> Vec<Voice>;

    /// Resolves the next time the voice directory changes.
    async fn voices_changed(&self);

    /// Speaks `text` to completion. `None` means the engine's own default.
    async fn speak(
        &self,
        text: &str,
        voice: Option<&Voice>,
        settings: &SpeechSettings,
    ) -> Result<(), SynthesisError>;

    fn pause(&self) -> bool;
    fn resume(&self) -> bool;
    fn cancel(&self);
}

fn primary_subtag(tag: &str) -> &str {
    tag.split(['-', '_']).next().unwrap_or(tag)
}

/// Picks the voice for `settings`, from most to least specific: the
/// configured voice, a higher-quality voice for the full language tag, any
/// voice sharing the primary language subtag, the engine's default voice.
pub fn select_voice<'a>(voices: &'a [Voice], settings: &SpeechSettings) -> Option<&'a Voice> {
    if let Some(wanted) = &settings.voice {
        if let Some(voice) = voices.iter().find(|v| &v.id == wanted || &v.name == wanted) {
            return Some(voice);
        }
        debug!(voice = %wanted, "Configured voice not installed");
    }

    let tag = settings.language.replace('_', "-");
    voices
        .iter()
        .find(|v| v.high_quality && v.language.replace('_', "-").eq_ignore_ascii_case(&tag))
        .or_else(|| {
            let primary = primary_subtag(&tag);
            voices
                .iter()
                .find(|v| primary_subtag(&v.language).eq_ignore_ascii_case(primary))
        })
        .or_else(|| voices.iter().find(|v| v.is_default))
}

pub struct LocalSynthesizer {
    engine: Arc<dyn VoiceEngine>,
    voice_wait: Duration,
}

impl LocalSynthesizer {
    pub fn new(engine: Arc<dyn VoiceEngine>) -> Self {
        Self {
            engine,
            voice_wait: DEFAULT_VOICE_WAIT,
        }
    }

    pub fn with_voice_wait(mut self, voice_wait: Duration) -> Self {
        self.voice_wait = voice_wait;
        self
    }

    async fn voices(&self) -> Vec<Voice> {
        let voices = self.engine.voices();
        if !voices.is_empty() {
            return voices;
        }
        match timeout(self.voice_wait, self.engine.voices_changed()).await {
            Ok(()) => self.engine.voices(),
            Err(_) => {
                debug!(wait = ?self.voice_wait, "Voice directory still empty, using engine default");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl SpeechBackend for LocalSynthesizer {
    fn name(&self) -> &'static str {
        "local"
    }

    #[instrument(name = "local_speak", skip_all, fields(chars = utterance.text.len()))]
    async fn speak(
        &self,
        utterance: Utterance,
        lifecycle: LifecycleSink,
    ) -> Result<(), SynthesisError> {
        let voices = self.voices().await;
        let voice = select_voice(&voices, &utterance.settings);
        debug!(voice = ?voice.map(|v| &v.id), "Selected voice");

        let _ = lifecycle.send(Lifecycle::Started);
        self.engine
            .speak(&utterance.text, voice, &utterance.settings)
            .await
    }

    fn pause(&self) -> bool {
        self.engine.pause()
    }

    fn resume(&self) -> bool {
        self.engine.resume()
    }

    fn cancel(&self) {
        self.engine.cancel()
    }
}
