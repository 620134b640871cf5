//! Defines the message protocol between the tutoring client and the teaching backend.
//!
//! Text frames are JSON objects carrying a `type` discriminator and a
//! `session_id`. Binary frames are never JSON: inbound they carry audio the
//! backend synthesized, outbound they carry PCM16 microphone chunks.

use crate::error::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};

/// Identifier the backend assigns to a lesson session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Instructional difficulty, always within `1..=5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct DifficultyLevel(u8);

impl DifficultyLevel {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    pub fn new(level: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&level).then_some(Self(level))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// The title the backend uses for this level.
    pub fn title(self) -> &'static str {
        match self.0 {
            1 => "Beginner",
            2 => "Elementary",
            3 => "Intermediate",
            4 => "Advanced",
            _ => "Expert",
        }
    }
}

impl Default for DifficultyLevel {
    fn default() -> Self {
        Self(Self::MIN)
    }
}

impl TryFrom<u8> for DifficultyLevel {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Self::new(level).ok_or_else(|| format!("difficulty level {level} is outside 1..=5"))
    }
}

impl From<DifficultyLevel> for u8 {
    fn from(level: DifficultyLevel) -> Self {
        level.0
    }
}

/// Teaching state of the session as reported by the backend.
///
/// The backend has been seen emitting both `TEACHING` and `teaching`; both
/// decode to the same variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", try_from = "String")]
pub enum TeachingStatus {
    Teaching,
    Paused,
    Answering,
    Resuming,
    #[default]
    Idle,
}

impl FromStr for TeachingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [(&str, TeachingStatus); 5] = [
            ("TEACHING", TeachingStatus::Teaching),
            ("PAUSED", TeachingStatus::Paused),
            ("ANSWERING", TeachingStatus::Answering),
            ("RESUMING", TeachingStatus::Resuming),
            ("IDLE", TeachingStatus::Idle),
        ];
        let s = s.trim();
        ALL.iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(s))
            .map(|(_, status)| *status)
            .ok_or_else(|| format!("unknown teaching status `{s}`"))
    }
}

impl TryFrom<String> for TeachingStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// What the teacher does to the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoardActionKind {
    WriteBullet,
    WriteTitle,
    WriteStep,
    Clear,
    Highlight,
    DrawDiagram,
    ShowImage,
    ShowQuiz,
    ShowReward,
    ShowFlashcards,
}

/// A single instruction for the visual teaching surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardAction {
    pub kind: BoardActionKind,
    /// Action-specific data, e.g. `{"text": "...", "position": 1}`.
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl BoardAction {
    pub fn new(kind: BoardActionKind) -> Self {
        Self {
            kind,
            payload: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_owned(), value.into());
        self
    }
}

/// Why the student interrupted the teacher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptReason {
    /// "I don't get it."
    MaFhemtch,
    Question,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceAction {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of the replayed conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

/// Events sent from the client to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEvent {
    /// Allocates a session. Posted over HTTP, never over the socket.
    StartLesson {
        lesson_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial_difficulty: Option<DifficultyLevel>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
    },
    /// A typed message from the student.
    UserMessage {
        session_id: SessionId,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_id: Option<u32>,
    },
    /// Stops the teacher mid-explanation, optionally with a question.
    Interrupt {
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<InterruptReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_id: Option<u32>,
    },
    /// Continues the lesson from the given step.
    Resume {
        session_id: SessionId,
        step_id: u32,
    },
    /// Switches the explanation level for the rest of the lesson.
    ChangeDifficulty {
        session_id: SessionId,
        level: DifficultyLevel,
    },
    /// Tells the backend that microphone audio starts or stops flowing.
    ToggleVoice {
        session_id: SessionId,
        action: VoiceAction,
    },
    /// Asks for a quiz on the material covered so far.
    RequestQuiz {
        session_id: SessionId,
    },
    /// Asks for flashcards on the material covered so far.
    RequestFlashcards {
        session_id: SessionId,
    },
    /// Asks the backend to re-send its current status.
    Status {
        session_id: SessionId,
    },
}

impl ClientEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartLesson { .. } => "START_LESSON",
            Self::UserMessage { .. } => "USER_MESSAGE",
            Self::Interrupt { .. } => "INTERRUPT",
            Self::Resume { .. } => "RESUME",
            Self::ChangeDifficulty { .. } => "CHANGE_DIFFICULTY",
            Self::ToggleVoice { .. } => "TOGGLE_VOICE",
            Self::RequestQuiz { .. } => "REQUEST_QUIZ",
            Self::RequestFlashcards { .. } => "REQUEST_FLASHCARDS",
            Self::Status { .. } => "STATUS",
        }
    }
}

/// Events sent from the backend to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    /// A streamed chunk of the teacher's current response.
    TeacherTextDelta { session_id: SessionId, delta: String },
    /// The authoritative text of the teacher's response.
    TeacherTextFinal {
        session_id: SessionId,
        text: String,
        /// Actions already delivered as `BOARD_ACTION` events; informational only.
        #[serde(default)]
        board_actions: Vec<BoardAction>,
    },
    /// One drawing instruction for the whiteboard.
    BoardAction {
        session_id: SessionId,
        action: BoardAction,
    },
    /// Marks a completed lesson step that can be resumed from.
    Checkpoint {
        session_id: SessionId,
        step_id: u32,
        short_summary: String,
    },
    /// A failure reported by the backend; the session stays open.
    Error {
        session_id: SessionId,
        error_code: String,
        message: String,
    },
    /// What the teacher is doing, with the current difficulty and progress.
    Status {
        session_id: SessionId,
        status: TeachingStatus,
        #[serde(default)]
        difficulty_level: Option<DifficultyLevel>,
        #[serde(default)]
        difficulty_title: Option<String>,
        #[serde(default)]
        progress: Option<f32>,
    },
    /// The conversation so far, replacing the local transcript.
    History {
        session_id: SessionId,
        #[serde(default)]
        history: Vec<HistoryEntry>,
    },
    /// What the backend heard from the student's microphone.
    VoiceTranscription { session_id: SessionId, text: String },
}

impl ServerEvent {
    pub fn kind(&self) -> ServerEventType {
        match self {
            Self::TeacherTextDelta { .. } => ServerEventType::TeacherTextDelta,
            Self::TeacherTextFinal { .. } => ServerEventType::TeacherTextFinal,
            Self::BoardAction { .. } => ServerEventType::BoardAction,
            Self::Checkpoint { .. } => ServerEventType::Checkpoint,
            Self::Error { .. } => ServerEventType::Error,
            Self::Status { .. } => ServerEventType::Status,
            Self::History { .. } => ServerEventType::History,
            Self::VoiceTranscription { .. } => ServerEventType::VoiceTranscription,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::TeacherTextDelta { session_id, .. }
            | Self::TeacherTextFinal { session_id, .. }
            | Self::BoardAction { session_id, .. }
            | Self::Checkpoint { session_id, .. }
            | Self::Error { session_id, .. }
            | Self::Status { session_id, .. }
            | Self::History { session_id, .. }
            | Self::VoiceTranscription { session_id, .. } => session_id,
        }
    }
}

/// Discriminator of a [`ServerEvent`], used to key listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventType {
    TeacherTextDelta,
    TeacherTextFinal,
    BoardAction,
    Checkpoint,
    Error,
    Status,
    History,
    VoiceTranscription,
}

impl ServerEventType {
    pub const ALL: [ServerEventType; 8] = [
        Self::TeacherTextDelta,
        Self::TeacherTextFinal,
        Self::BoardAction,
        Self::Checkpoint,
        Self::Error,
        Self::Status,
        Self::History,
        Self::VoiceTranscription,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TeacherTextDelta => "TEACHER_TEXT_DELTA",
            Self::TeacherTextFinal => "TEACHER_TEXT_FINAL",
            Self::BoardAction => "BOARD_ACTION",
            Self::Checkpoint => "CHECKPOINT",
            Self::Error => "ERROR",
            Self::Status => "STATUS",
            Self::History => "HISTORY",
            Self::VoiceTranscription => "VOICE_TRANSCRIPTION",
        }
    }
}

impl FromStr for ServerEventType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s).ok_or(())
    }
}

impl fmt::Display for ServerEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw frame read from the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Text(String),
    Binary(Bytes),
}

/// The result of decoding an [`InboundFrame`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(ServerEvent),
    /// Audio synthesized by the backend.
    Audio(Bytes),
}

/// Decodes a socket frame. Binary frames are audio and are never parsed.
pub fn decode_frame(frame: InboundFrame) -> Result<Decoded, ProtocolError> {
    match frame {
        InboundFrame::Binary(audio) => Ok(Decoded::Audio(audio)),
        InboundFrame::Text(text) => decode_event(&text).map(Decoded::Event),
    }
}

/// Parses one JSON text frame into a typed event.
pub fn decode_event(text: &str) -> Result<ServerEvent, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingDiscriminator)?;
    let kind: ServerEventType = kind
        .parse()
        .map_err(|_| ProtocolError::UnknownType(kind.to_owned()))?;
    serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.as_str(),
        source,
    })
}

/// Serializes a client event into a text frame.
pub fn encode_event(event: &ClientEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_accepts_either_case() {
        let upper = decode_event(r#"{"type":"STATUS","session_id":"s1","status":"TEACHING"}"#)
            .unwrap();
        let lower = decode_event(r#"{"type":"STATUS","session_id":"s1","status":"teaching"}"#)
            .unwrap();

        assert_eq!(upper, lower);
        match upper {
            ServerEvent::Status { status, .. } => assert_eq!(status, TeachingStatus::Teaching),
            other => panic!("Expected STATUS, got {:?}", other),
        }
    }

    #[test]
    fn test_status_serializes_in_canonical_case() {
        let json = serde_json::to_string(&TeachingStatus::Answering).unwrap();
        assert_eq!(json, "\"ANSWERING\"");
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let event = decode_event(
            r#"{"type":"TEACHER_TEXT_DELTA","session_id":"s1","delta":"Hi ","extra":42}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ServerEvent::TeacherTextDelta {
                session_id: SessionId::new("s1"),
                delta: "Hi ".into(),
            }
        );
    }

    #[test]
    fn test_missing_discriminator_is_rejected() {
        let err = decode_event(r#"{"session_id":"s1","delta":"Hi"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingDiscriminator));
    }

    #[test]
    fn test_unknown_discriminator_is_rejected() {
        let err = decode_event(r#"{"type":"DANCE","session_id":"s1"}"#).unwrap_err();
        match err {
            ProtocolError::UnknownType(kind) => assert_eq!(kind, "DANCE"),
            other => panic!("Expected UnknownType, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        let err = decode_event("{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_invalid_difficulty_is_a_payload_error() {
        let err = decode_event(
            r#"{"type":"STATUS","session_id":"s1","status":"IDLE","difficulty_level":9}"#,
        )
        .unwrap_err();
        match err {
            ProtocolError::InvalidPayload { kind, .. } => assert_eq!(kind, "STATUS"),
            other => panic!("Expected InvalidPayload, got {:?}", other),
        }
    }

    #[test]
    fn test_binary_frames_are_audio() {
        // Bytes that happen to look like JSON must still be treated as audio.
        let audio = Bytes::from_static(br#"{"type":"STATUS"}"#);
        let decoded = decode_frame(InboundFrame::Binary(audio.clone())).unwrap();
        assert_eq!(decoded, Decoded::Audio(audio));
    }

    #[test]
    fn test_board_action_decoding() {
        let event = decode_event(
            r#"{"type":"BOARD_ACTION","session_id":"s1","action":{"kind":"WRITE_TITLE","payload":{"text":"Fractions"}}}"#,
        )
        .unwrap();
        match event {
            ServerEvent::BoardAction { action, .. } => {
                assert_eq!(action.kind, BoardActionKind::WriteTitle);
                assert_eq!(action.payload["text"], "Fractions");
            }
            other => panic!("Expected BOARD_ACTION, got {:?}", other),
        }
    }

    #[test]
    fn test_history_decoding() {
        let event = decode_event(
            r#"{"type":"HISTORY","session_id":"s1","history":[{"role":"user","content":"hi"},{"role":"assistant","content":"hello"}]}"#,
        )
        .unwrap();
        match event {
            ServerEvent::History { history, .. } => {
                assert_eq!(history.len(), 2);
                assert_eq!(history[1].role, Role::Assistant);
            }
            other => panic!("Expected HISTORY, got {:?}", other),
        }
    }

    #[test]
    fn test_client_event_wire_shape() {
        let event = ClientEvent::Interrupt {
            session_id: SessionId::new("s1"),
            reason: Some(InterruptReason::MaFhemtch),
            text: None,
            step_id: Some(3),
        };
        let value: Value = serde_json::from_str(&encode_event(&event).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "INTERRUPT", "session_id": "s1", "reason": "MA_FHEMTCH", "step_id": 3})
        );
        assert_eq!(event.kind(), "INTERRUPT");
    }

    #[test]
    fn test_toggle_voice_wire_shape() {
        let event = ClientEvent::ToggleVoice {
            session_id: SessionId::new("s1"),
            action: VoiceAction::Start,
        };
        let value: Value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"type": "TOGGLE_VOICE", "session_id": "s1", "action": "start"})
        );
    }

    #[test]
    fn test_client_event_kind_matches_wire_tag() {
        let sid = || SessionId::new("s1");
        let events = [
            ClientEvent::UserMessage {
                session_id: sid(),
                text: "why?".into(),
                step_id: None,
            },
            ClientEvent::Resume {
                session_id: sid(),
                step_id: 0,
            },
            ClientEvent::ChangeDifficulty {
                session_id: sid(),
                level: DifficultyLevel::default(),
            },
            ClientEvent::RequestQuiz { session_id: sid() },
            ClientEvent::RequestFlashcards { session_id: sid() },
            ClientEvent::Status { session_id: sid() },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.kind());
        }
    }

    #[test]
    fn test_difficulty_level_bounds_and_titles() {
        assert!(DifficultyLevel::new(0).is_none());
        assert!(DifficultyLevel::new(6).is_none());
        assert_eq!(DifficultyLevel::new(1).unwrap().title(), "Beginner");
        assert_eq!(DifficultyLevel::new(3).unwrap().title(), "Intermediate");
        assert_eq!(DifficultyLevel::new(5).unwrap().title(), "Expert");
        assert_eq!(DifficultyLevel::default().get(), 1);
    }

    #[test]
    fn test_event_type_names_round_trip() {
        for kind in ServerEventType::ALL {
            assert_eq!(kind.as_str().parse::<ServerEventType>(), Ok(kind));
        }
    }
}
