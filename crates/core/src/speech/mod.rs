//! Streaming text-to-speech output.
//!
//! The [`SpeechQueue`] plays utterances strictly in order, one at a time, on
//! whichever [`SpeechBackend`] it was built with. Streamed teacher text is
//! collected with [`SpeechQueue::append_text`] and queued as a single
//! utterance by [`SpeechQueue::finalize_speech`].

mod backend;
mod local;
mod remote;

pub use backend::{Lifecycle, LifecycleSink, SpeechBackend, Utterance};
pub use local::{DEFAULT_VOICE_WAIT, LocalSynthesizer, Voice, VoiceEngine, select_voice};
pub use remote::{AudioOutput, RemoteSynthesizer};

use crate::error::SynthesisError;
use futures_util::future::BoxFuture;
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct SpeechSettings {
    /// Voice id or name. `None` lets the backend choose by language.
    pub voice: Option<String>,
    pub language: String,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

impl Default for SpeechSettings {
    fn default() -> Self {
        Self {
            voice: None,
            language: "en-US".to_owned(),
            rate: 1.0,
            pitch: 1.0,
            volume: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Playing,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechEntry {
    pub text: String,
    pub status: EntryStatus,
}

/// What the speech output is doing, whatever the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpeechState {
    pub is_speaking: bool,
    pub is_paused: bool,
    pub current_text: Option<String>,
    /// Entries waiting behind the current one.
    pub queue_len: usize,
    /// The most recent backend failure. Cleared by `stop`.
    pub error: Option<SynthesisError>,
    pub last_finished: Option<SpeechEntry>,
}

#[derive(Debug)]
enum Command {
    Speak(String),
    Append(String),
    Finalize,
    Pause,
    Resume,
    Stop,
    SetSettings(SpeechSettings),
}

/// Handle onto the speech worker.
#[derive(Clone)]
pub struct SpeechQueue {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SpeechState>,
    backend: &'static str,
}

impl SpeechQueue {
    pub fn spawn(backend: Arc<dyn SpeechBackend>, settings: SpeechSettings) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SpeechState::default());
        let name = backend.name();

        let worker = Worker {
            backend,
            settings,
            queue: VecDeque::new(),
            accumulator: String::new(),
            current: None,
            state: state_tx,
        };
        tokio::spawn(worker.run(commands_rx));

        Self {
            commands: commands_tx,
            state: state_rx,
            backend: name,
        }
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Speech worker is gone");
        }
    }

    /// Queues `text` behind whatever is already waiting.
    pub fn speak(&self, text: impl Into<String>) {
        self.command(Command::Speak(text.into()));
    }

    pub fn append_text(&self, delta: impl Into<String>) {
        self.command(Command::Append(delta.into()));
    }

    /// Queues the text collected so far and starts a new collection.
    pub fn finalize_speech(&self) {
        self.command(Command::Finalize);
    }

    pub fn pause(&self) {
        self.command(Command::Pause);
    }

    pub fn resume(&self) {
        self.command(Command::Resume);
    }

    /// Silences playback and forgets everything queued or collected.
    pub fn stop(&self) {
        self.command(Command::Stop);
    }

    /// Applies from the next utterance on.
    pub fn set_settings(&self, settings: SpeechSettings) {
        self.command(Command::SetSettings(settings));
    }

    pub fn state(&self) -> SpeechState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SpeechState> {
        self.state.clone()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend
    }
}

struct Playback {
    text: String,
    speaking: BoxFuture<'static, Result<(), SynthesisError>>,
    lifecycle: mpsc::UnboundedReceiver<Lifecycle>,
}

/// The next lifecycle event of the current utterance. Never resolves when
/// nothing is playing.
async fn next_event(current: &mut Option<Playback>) -> Lifecycle {
    let Some(playback) = current else {
        return std::future::pending().await;
    };
    tokio::select! {
        biased;
        Some(event) = playback.lifecycle.recv() => event,
        result = &mut playback.speaking => match result {
            Ok(()) => Lifecycle::Ended,
            Err(e) => Lifecycle::Failed(e),
        },
    }
}

struct Worker {
    backend: Arc<dyn SpeechBackend>,
    settings: SpeechSettings,
    queue: VecDeque<SpeechEntry>,
    accumulator: String,
    current: Option<Playback>,
    state: watch::Sender<SpeechState>,
}

impl Worker {
    #[instrument(name = "speech", skip_all, fields(backend = self.backend.name()))]
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            self.start_next();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                event = next_event(&mut self.current) => self.apply(event),
            }
        }
        self.stop();
        debug!("Speech worker stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Speak(text) => self.enqueue(text),
            Command::Append(delta) => self.accumulator.push_str(&delta),
            Command::Finalize => {
                let text = std::mem::take(&mut self.accumulator);
                self.enqueue(text);
            }
            Command::Pause => {
                if self.current.is_some() && self.backend.pause() {
                    self.apply(Lifecycle::Paused);
                }
            }
            Command::Resume => {
                if self.current.is_some() && self.backend.resume() {
                    self.apply(Lifecycle::Resumed);
                }
            }
            Command::Stop => self.stop(),
            Command::SetSettings(settings) => {
                debug!(?settings, "Speech settings updated");
                self.settings = settings;
            }
        }
    }

    fn enqueue(&mut self, text: String) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.queue.push_back(SpeechEntry {
            text: text.to_owned(),
            status: EntryStatus::Pending,
        });
        let queue_len = self.queue.len();
        self.state.send_modify(|s| s.queue_len = queue_len);
    }

    fn start_next(&mut self) {
        if self.current.is_some() {
            return;
        }
        let Some(mut entry) = self.queue.pop_front() else {
            return;
        };
        entry.status = EntryStatus::Playing;

        let utterance = Utterance {
            text: entry.text.clone(),
            settings: self.settings.clone(),
        };
        let (sink, lifecycle) = mpsc::unbounded_channel();
        let backend = self.backend.clone();
        self.current = Some(Playback {
            text: entry.text.clone(),
            speaking: Box::pin(async move { backend.speak(utterance, sink).await }),
            lifecycle,
        });

        let queue_len = self.queue.len();
        self.state.send_modify(|s| {
            s.current_text = Some(entry.text);
            s.queue_len = queue_len;
            s.is_paused = false;
        });
    }

    fn apply(&mut self, event: Lifecycle) {
        match event {
            Lifecycle::Started => self.state.send_modify(|s| {
                s.is_speaking = true;
                s.is_paused = false;
            }),
            Lifecycle::Paused => self.state.send_modify(|s| s.is_paused = true),
            Lifecycle::Resumed => self.state.send_modify(|s| s.is_paused = false),
            Lifecycle::Ended => self.finish(EntryStatus::Done, None),
            Lifecycle::Failed(e) => {
                warn!(error = %e, "Utterance failed, moving on");
                self.finish(EntryStatus::Error, Some(e));
            }
        }
    }

    fn finish(&mut self, status: EntryStatus, error: Option<SynthesisError>) {
        let Some(playback) = self.current.take() else {
            return;
        };
        debug!(?status, "Utterance finished");
        self.state.send_modify(|s| {
            s.is_speaking = false;
            s.is_paused = false;
            s.current_text = None;
            s.last_finished = Some(SpeechEntry {
                text: playback.text,
                status,
            });
            if error.is_some() {
                s.error = error;
            }
        });
    }

    fn stop(&mut self) {
        let was_busy = self.current.is_some() || !self.queue.is_empty();
        self.backend.cancel();
        // Dropping the future abandons the utterance, including any
        // synthesis request still in flight.
        self.current = None;
        self.queue.clear();
        self.accumulator.clear();
        if was_busy {
            info!("Speech stopped");
        }
        self.state.send_modify(|s| {
            s.is_speaking = false;
            s.is_paused = false;
            s.current_text = None;
            s.queue_len = 0;
            s.error = None;
        });
    }
}
