//! Line commands typed into the interactive client.
//!
//! Plain text is a message to the teacher; lines starting with `/` are
//! control commands.

use thiserror::Error;
use tutor_core::protocol::{DifficultyLevel, VoiceAction};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Say(String),
    /// "I don't get it", optionally with what was unclear.
    Interrupt(Option<String>),
    Question(Option<String>),
    Resume,
    Difficulty(DifficultyLevel),
    Quiz,
    Flashcards,
    Voice(VoiceAction),
    Status,
    /// Silences the teacher's voice.
    Stop,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("unknown command `/{0}`, try /help")]
    Unknown(String),
    #[error("difficulty must be a number from 1 to 5, got `{0}`")]
    InvalidDifficulty(String),
    #[error("usage: /voice on|off")]
    VoiceUsage,
}

pub const HELP: &str = "\
Type a message to talk to the teacher, or:
  /interrupt [text]   say you did not understand
  /question [text]    interrupt with a question
  /resume             continue from the last checkpoint
  /difficulty <1-5>   change the difficulty level
  /quiz               request a quiz
  /flashcards         request flashcards
  /voice on|off       start or stop sending microphone audio
  /status             ask the backend for its status
  /stop               silence the teacher's voice
  /quit               leave the lesson";

fn rest(argument: &str) -> Option<String> {
    let argument = argument.trim();
    (!argument.is_empty()).then(|| argument.to_string())
}

/// Parses one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(body) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };

    let (name, argument) = body.split_once(char::is_whitespace).unwrap_or((body, ""));
    let command = match name.to_ascii_lowercase().as_str() {
        "interrupt" | "huh" => Command::Interrupt(rest(argument)),
        "question" | "q" => Command::Question(rest(argument)),
        "resume" => Command::Resume,
        "difficulty" | "level" => {
            let argument = argument.trim();
            let level = argument
                .parse::<u8>()
                .ok()
                .and_then(DifficultyLevel::new)
                .ok_or_else(|| CommandError::InvalidDifficulty(argument.to_string()))?;
            Command::Difficulty(level)
        }
        "quiz" => Command::Quiz,
        "flashcards" | "cards" => Command::Flashcards,
        "voice" => match argument.trim().to_ascii_lowercase().as_str() {
            "on" | "start" => Command::Voice(VoiceAction::Start),
            "off" | "stop" => Command::Voice(VoiceAction::Stop),
            _ => return Err(CommandError::VoiceUsage),
        },
        "status" => Command::Status,
        "stop" | "shush" => Command::Stop,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}
