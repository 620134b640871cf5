//! Interactive terminal client for a tutoring session.
//!
//! Starts (or joins) a lesson, prints what the teacher says and writes on the
//! board, and turns typed lines into client events. `/voice on` streams the
//! microphone through the voice activity detector.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    task::JoinHandle,
};
use tracing::{error, info, warn};
use tutor_client::{
    capture::open_microphone,
    commands::{self, Command, HELP},
    config::{Config, SpeechBackendKind},
    engines::{CommandOutput, EspeakEngine},
    runtime::{TutorSession, UplinkHandler},
};
use tutor_core::{
    ConnectionManager, ConnectionSnapshot, SessionState, SpeechQueue, VoiceActivityDetector,
    connection::{ConnectionConfig, Endpoints, LessonRequest, TungsteniteTransport},
    microphone::{CaptureConfig, Microphone},
    protocol::{DifficultyLevel, InterruptReason, Role, SessionId, VoiceAction},
    speech::{LocalSynthesizer, RemoteSynthesizer, VoiceEngine},
    vad::run_detector,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Lesson to start.
    #[arg(long, required_unless_present = "session")]
    lesson: Option<String>,

    /// Joins an existing session instead of starting a new one.
    #[arg(long, conflicts_with = "lesson")]
    session: Option<String>,

    /// Student id; must be a UUID to be sent.
    #[arg(long)]
    user: Option<String>,

    /// Lesson language, e.g. `fr`.
    #[arg(long)]
    language: Option<String>,

    /// Starting difficulty from 1 (Beginner) to 5 (Expert).
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=5))]
    difficulty: Option<u8>,
}

/// Remembers what has already been shown so each state change prints only
/// what is new.
#[derive(Default)]
struct Report {
    transcript: usize,
    board: usize,
    status: Option<(String, u8, u32)>,
    checkpoint: Option<u32>,
    error: Option<String>,
}

impl Report {
    fn show(&mut self, state: &SessionState) {
        if state.transcript.len() < self.transcript {
            // History was replayed.
            self.transcript = 0;
        }
        for entry in &state.transcript[self.transcript..] {
            if entry.role == Role::Assistant {
                println!("\nteacher> {}\n", entry.content);
            }
        }
        self.transcript = state.transcript.len();

        if state.board.len() < self.board {
            println!("[board cleared]");
            self.board = 0;
        }
        for action in &state.board[self.board..] {
            let text = action
                .payload
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            println!("[board] {:?} {}", action.kind, text);
        }
        self.board = state.board.len();

        let status = (
            format!("{:?}", state.teaching_status),
            state.difficulty_level.get(),
            (state.progress * 100.0).round() as u32,
        );
        if self.status.as_ref() != Some(&status) {
            info!(
                status = %status.0,
                difficulty = %state.difficulty_title,
                progress = status.2,
                "Teaching status"
            );
            self.status = Some(status);
        }

        if let Some(checkpoint) = &state.last_checkpoint {
            if self.checkpoint != Some(checkpoint.step_id) {
                println!("[checkpoint {}] {}", checkpoint.step_id, checkpoint.summary);
                self.checkpoint = Some(checkpoint.step_id);
            }
        }

        if let Some(backend_error) = &state.last_error {
            if self.error.as_deref() != Some(backend_error.message.as_str()) {
                warn!(code = %backend_error.code, "{}", backend_error.message);
                self.error = Some(backend_error.message.clone());
            }
        }
    }
}

fn report_connection(snapshot: &ConnectionSnapshot) {
    let status = snapshot.status;
    let attempts = snapshot.reconnect_attempts;
    match &snapshot.last_error {
        Some(e) => warn!(?status, attempts, error = %e, "Connection"),
        None => info!(?status, attempts, "Connection"),
    }
}

/// The microphone and the detector task streaming it.
struct Voice {
    microphone: Microphone,
    detector: JoinHandle<UplinkHandler>,
}

fn start_voice(session: &TutorSession, config: &Config) -> Option<Voice> {
    match open_microphone(&CaptureConfig::from(&config.vad)) {
        Ok((microphone, frames)) => {
            let detector = tokio::spawn(run_detector(
                VoiceActivityDetector::new(config.vad.clone()),
                frames,
                session.uplink(),
            ));
            Some(Voice {
                microphone,
                detector,
            })
        }
        Err(e) => {
            error!("{e}");
            None
        }
    }
}

async fn stop_voice(voice: Voice) {
    // Releasing the device closes the frame channel, which ends the detector.
    voice.microphone.stop();
    match voice.detector.await {
        Ok(uplink) => info!(
            chunks = uplink.sent(),
            dropped = uplink.dropped(),
            "Voice input stopped"
        ),
        Err(e) => warn!(error = %e, "Voice detector task failed"),
    }
}

fn build_session(config: &Config) -> anyhow::Result<TutorSession> {
    let endpoints = Endpoints::parse(&config.api_base).context("Invalid TUTOR_API_BASE")?;
    let (connection, frames) = ConnectionManager::new(
        ConnectionConfig {
            endpoints,
            reconnect: config.reconnect,
        },
        Arc::new(TungsteniteTransport),
    );
    let session = TutorSession::new(connection, frames);

    let session = match config.speech_backend {
        SpeechBackendKind::Local => {
            let engine: Arc<dyn VoiceEngine> = EspeakEngine::spawn();
            let backend = Arc::new(LocalSynthesizer::new(engine));
            session.with_speech(SpeechQueue::spawn(backend, config.speech.clone()))
        }
        SpeechBackendKind::Remote => {
            let url = config
                .tts_api_url
                .clone()
                .context("TTS_API_URL is required for the remote speech backend")?;
            let backend = Arc::new(
                RemoteSynthesizer::new(url, Arc::new(CommandOutput::new(&config.audio_player)))
                    .with_api_key(config.tts_api_key.clone()),
            );
            session.with_speech(SpeechQueue::spawn(backend, config.speech.clone()))
        }
        SpeechBackendKind::Server => {
            session.with_server_audio(Arc::new(CommandOutput::new(&config.audio_player)))
        }
    };
    Ok(session)
}

/// Handles one typed command. Returns `false` when the user wants to leave.
async fn handle_command(
    command: Command,
    session: &TutorSession,
    config: &Config,
    voice: &mut Option<Voice>,
) -> bool {
    match command {
        Command::Say(text) => {
            session.send_message(&text);
        }
        Command::Interrupt(text) => {
            session.interrupt(InterruptReason::MaFhemtch, text);
        }
        Command::Question(text) => {
            session.interrupt(InterruptReason::Question, text);
        }
        Command::Resume => {
            session.resume();
        }
        Command::Difficulty(level) => {
            session.change_difficulty(level);
        }
        Command::Quiz => {
            session.request_quiz();
        }
        Command::Flashcards => {
            session.request_flashcards();
        }
        Command::Voice(VoiceAction::Start) => {
            if voice.is_some() {
                println!("Voice input is already on.");
            } else if let Some(started) = start_voice(session, config) {
                *voice = Some(started);
                session.toggle_voice(VoiceAction::Start);
            }
        }
        Command::Voice(VoiceAction::Stop) => match voice.take() {
            Some(running) => {
                stop_voice(running).await;
                session.toggle_voice(VoiceAction::Stop);
            }
            None => println!("Voice input is already off."),
        },
        Command::Status => {
            session.request_status();
        }
        Command::Stop => session.stop_speech(),
        Command::Help => println!("{HELP}"),
        Command::Quit => return false,
    }
    true
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!(api_base = %config.api_base, speech = ?config.speech_backend, "Configuration loaded");

    // --- 3. Wire the session ---
    let session = build_session(&config)?;

    // --- 4. Start or join the lesson ---
    match (&args.session, &args.lesson) {
        (Some(session_id), _) => session.join(SessionId::new(session_id.as_str())),
        (None, Some(lesson_id)) => {
            let mut request = LessonRequest::new(lesson_id.as_str());
            if let Some(user) = &args.user {
                request = request.with_user(user.as_str());
            }
            if let Some(language) = &args.language {
                request = request.with_language(language.as_str());
            }
            let difficulty = args
                .difficulty
                .and_then(DifficultyLevel::new)
                .or(config.default_difficulty);
            if let Some(level) = difficulty {
                request = request.with_difficulty(level);
            }
            session
                .start(&request)
                .await
                .context("Failed to start the lesson")?;
        }
        (None, None) => anyhow::bail!("either --lesson or --session is required"),
    }
    println!("Type a message, or /help for commands.");

    // --- 5. Interactive loop ---
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state = session.projector().subscribe();
    let mut connection = session.connection().watch();
    let mut report = Report::default();
    let mut voice: Option<Voice> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "Failed to read input");
                        break;
                    }
                };
                match commands::parse(&line) {
                    Ok(Some(command)) => {
                        if !handle_command(command, &session, &config, &mut voice).await {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{e}"),
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                report.show(&state.borrow_and_update());
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                report_connection(&connection.borrow_and_update());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal. Leaving the lesson...");
                break;
            }
        }
    }

    // --- 6. Shutdown ---
    if let Some(running) = voice.take() {
        stop_voice(running).await;
    }
    session.shutdown();
    Ok(())
}
