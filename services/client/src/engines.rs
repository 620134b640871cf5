//! Speech engine and audio player adapters that shell out to system tools.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    process::Stdio,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{io::AsyncWriteExt, process::Command, sync::Notify};
use tracing::{debug, info, warn};
use tutor_core::{
    error::SynthesisError,
    speech::{AudioOutput, SpeechSettings, Voice, VoiceEngine},
};

const ESPEAK: &str = "espeak-ng";

/// Parses the table printed by `espeak-ng --voices`.
pub fn parse_voice_list(listing: &str) -> Vec<Voice> {
    listing
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut columns = line.split_whitespace();
            let _priority = columns.next()?;
            let language = columns.next()?;
            let _age_gender = columns.next()?;
            let name = columns.next()?;
            Some(Voice {
                id: language.to_string(),
                name: name.replace('_', " "),
                language: language.to_string(),
                high_quality: false,
                is_default: language == "en",
            })
        })
        .collect()
}

/// Words per minute, pitch (0-99) and amplitude (0-200) for espeak.
fn espeak_arguments(settings: &SpeechSettings) -> [String; 3] {
    let words_per_minute = (175.0 * settings.rate).clamp(80.0, 450.0).round() as u32;
    let pitch = (50.0 * settings.pitch).clamp(0.0, 99.0).round() as u32;
    let amplitude = (100.0 * settings.volume).clamp(0.0, 200.0).round() as u32;
    [
        words_per_minute.to_string(),
        pitch.to_string(),
        amplitude.to_string(),
    ]
}

/// Speaks through the `espeak-ng` command.
///
/// The voice directory is loaded in the background; until it arrives,
/// [`VoiceEngine::voices`] is empty.
pub struct EspeakEngine {
    voices: Mutex<Vec<Voice>>,
    loaded: Notify,
}

impl EspeakEngine {
    pub fn spawn() -> Arc<Self> {
        let engine = Arc::new(Self {
            voices: Mutex::new(Vec::new()),
            loaded: Notify::new(),
        });
        let loader = engine.clone();
        tokio::spawn(async move {
            match Command::new(ESPEAK).arg("--voices").output().await {
                Ok(output) if output.status.success() => {
                    let voices = parse_voice_list(&String::from_utf8_lossy(&output.stdout));
                    info!(count = voices.len(), "Loaded espeak voices");
                    *loader.voices.lock().unwrap_or_else(PoisonError::into_inner) = voices;
                    loader.loaded.notify_waiters();
                }
                Ok(output) => warn!(status = %output.status, "espeak-ng --voices failed"),
                Err(e) => warn!(error = %e, "Could not run espeak-ng"),
            }
        });
        engine
    }
}

#[async_trait]
impl VoiceEngine for EspeakEngine {
    fn voices(&self) -> Vec<Voice> {
        self.voices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn voices_changed(&self) {
        self.loaded.notified().await
    }

    async fn speak(
        &self,
        text: &str,
        voice: Option<&Voice>,
        settings: &SpeechSettings,
    ) -> Result<(), SynthesisError> {
        let [words_per_minute, pitch, amplitude] = espeak_arguments(settings);
        let mut command = Command::new(ESPEAK);
        if let Some(voice) = voice {
            command.args(["-v", voice.id.as_str()]);
        }
        // Text goes in on stdin so it is never mistaken for an option.
        let mut child = command
            .args([
                "-s",
                words_per_minute.as_str(),
                "-p",
                pitch.as_str(),
                "-a",
                amplitude.as_str(),
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SynthesisError::Synthesis(format!("could not run {ESPEAK}: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|e| SynthesisError::Synthesis(e.to_string()))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SynthesisError::Synthesis(e.to_string()))?;
        if !output.status.success() {
            return Err(SynthesisError::Synthesis(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    fn pause(&self) -> bool {
        false
    }

    fn resume(&self) -> bool {
        false
    }

    fn cancel(&self) {
        // The process is killed when the abandoned utterance is dropped.
        debug!("espeak playback cancelled");
    }
}

/// Plays audio by piping it into a player command such as `aplay -q`.
pub struct CommandOutput {
    program: String,
    args: Vec<String>,
}

impl CommandOutput {
    /// `command_line` is split on whitespace; the audio arrives on stdin.
    pub fn new(command_line: &str) -> Self {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        Self {
            program: parts.next().unwrap_or_else(|| "aplay".to_string()),
            args: parts.collect(),
        }
    }
}

#[async_trait]
impl AudioOutput for CommandOutput {
    async fn play(&self, audio: Bytes) -> Result<(), SynthesisError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SynthesisError::Playback(format!("could not run {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&audio)
                .await
                .map_err(|e| SynthesisError::Playback(e.to_string()))?;
        }
        let status = child
            .wait()
            .await
            .map_err(|e| SynthesisError::Playback(e.to_string()))?;
        if !status.success() {
            return Err(SynthesisError::Playback(format!(
                "{} exited with {status}",
                self.program
            )));
        }
        Ok(())
    }

    fn pause(&self) -> bool {
        false
    }

    fn resume(&self) -> bool {
        false
    }

    fn stop(&self) {
        debug!(program = %self.program, "Playback stopped");
    }
}
