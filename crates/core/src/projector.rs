//! Folds server events into one coherent snapshot of the session.
//!
//! Teacher text and the board log are independent streams: finalizing text
//! never touches the board, and only `BOARD_ACTION` mutates the board.

use crate::{
    dispatcher::{EventDispatcher, EventHandler, Subscription},
    protocol::{
        BoardAction, BoardActionKind, DifficultyLevel, HistoryEntry, Role, ServerEvent,
        ServerEventType, SessionId, TeachingStatus,
    },
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Teacher text built up from deltas and replaced by the final text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextAccumulator {
    text: String,
    finalized: bool,
}

impl TextAccumulator {
    /// Appends a delta. The first delta after a final text starts a new turn.
    pub fn push_delta(&mut self, delta: &str) {
        if self.finalized {
            self.text.clear();
            self.finalized = false;
        }
        self.text.push_str(delta);
    }

    /// Replaces whatever was accumulated with the authoritative text.
    pub fn finalize(&mut self, text: &str) {
        self.text.clear();
        self.text.push_str(text);
        self.finalized = true;
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_final(&self) -> bool {
        self.finalized
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.finalized = false;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub step_id: u32,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub code: String,
    pub message: String,
}

/// Everything a renderer needs to draw the current session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub session_id: Option<SessionId>,
    pub teaching_status: TeachingStatus,
    pub difficulty_level: DifficultyLevel,
    pub difficulty_title: String,
    pub progress: f32,
    pub teacher_text: TextAccumulator,
    pub board: Vec<BoardAction>,
    pub transcript: Vec<HistoryEntry>,
    pub last_checkpoint: Option<Checkpoint>,
    pub last_error: Option<BackendError>,
    pub last_transcription: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        let difficulty_level = DifficultyLevel::default();
        Self {
            session_id: None,
            teaching_status: TeachingStatus::Idle,
            difficulty_level,
            difficulty_title: difficulty_level.title().to_owned(),
            progress: 0.0,
            teacher_text: TextAccumulator::default(),
            board: Vec::new(),
            transcript: Vec::new(),
            last_checkpoint: None,
            last_error: None,
            last_transcription: None,
        }
    }
}

impl SessionState {
    pub fn for_session(session_id: SessionId) -> Self {
        Self {
            session_id: Some(session_id),
            ..Self::default()
        }
    }

    /// Applies one event. Returns whether anything changed.
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::Status {
                status,
                difficulty_level,
                difficulty_title,
                progress,
                ..
            } => {
                let before = (
                    self.teaching_status,
                    self.difficulty_level,
                    self.difficulty_title.clone(),
                    self.progress,
                );
                self.teaching_status = *status;
                if let Some(level) = difficulty_level {
                    self.difficulty_level = *level;
                    self.difficulty_title = level.title().to_owned();
                }
                if let Some(title) = difficulty_title {
                    self.difficulty_title = title.clone();
                }
                if let Some(progress) = progress {
                    self.progress = progress.clamp(0.0, 1.0);
                }
                before
                    != (
                        self.teaching_status,
                        self.difficulty_level,
                        self.difficulty_title.clone(),
                        self.progress,
                    )
            }
            ServerEvent::TeacherTextDelta { delta, .. } => {
                self.teacher_text.push_delta(delta);
                true
            }
            ServerEvent::TeacherTextFinal { text, .. } => {
                self.teacher_text.finalize(text);
                if !text.trim().is_empty() {
                    self.transcript.push(HistoryEntry {
                        role: Role::Assistant,
                        content: text.clone(),
                    });
                }
                true
            }
            ServerEvent::BoardAction { action, .. } => {
                if action.kind == BoardActionKind::Clear {
                    self.board.clear();
                } else {
                    self.board.push(action.clone());
                }
                true
            }
            ServerEvent::Checkpoint {
                step_id,
                short_summary,
                ..
            } => {
                self.last_checkpoint = Some(Checkpoint {
                    step_id: *step_id,
                    summary: short_summary.clone(),
                });
                true
            }
            ServerEvent::Error {
                error_code,
                message,
                ..
            } => {
                self.last_error = Some(BackendError {
                    code: error_code.clone(),
                    message: message.clone(),
                });
                true
            }
            ServerEvent::History { history, .. } => {
                self.transcript = history.clone();
                true
            }
            ServerEvent::VoiceTranscription { text, .. } => {
                self.last_transcription = Some(text.clone());
                if !text.trim().is_empty() {
                    self.transcript.push(HistoryEntry {
                        role: Role::User,
                        content: text.clone(),
                    });
                }
                true
            }
        }
    }
}

/// Publishes the projected [`SessionState`] to any number of watchers.
#[derive(Clone)]
pub struct StateProjector {
    state: Arc<watch::Sender<SessionState>>,
}

impl Default for StateProjector {
    fn default() -> Self {
        Self::new()
    }
}

impl StateProjector {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            state: Arc::new(state),
        }
    }

    /// Subscribes the projector to every server event type.
    pub fn attach(&self, dispatcher: &EventDispatcher) -> Vec<Subscription> {
        let handler: Arc<dyn EventHandler> = Arc::new(self.clone());
        ServerEventType::ALL
            .into_iter()
            .map(|kind| dispatcher.subscribe_shared(kind, handler.clone()))
            .collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Starts a fresh projection for a newly bound session.
    pub fn bind(&self, session_id: SessionId) {
        self.state.send_replace(SessionState::for_session(session_id));
    }

    pub fn apply(&self, event: &ServerEvent) {
        self.state.send_if_modified(|state| state.apply(event));
    }

    /// Adds a message the user sent from this client to the transcript.
    pub fn record_user_message(&self, text: &str) {
        self.state.send_modify(|state| {
            state.transcript.push(HistoryEntry {
                role: Role::User,
                content: text.to_owned(),
            })
        });
    }
}

impl EventHandler for StateProjector {
    fn handle(&self, event: &ServerEvent) {
        debug!(kind = %event.kind(), "Projecting server event");
        self.apply(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{InboundFrame, decode_event};

    fn sid() -> SessionId {
        SessionId::new("s1")
    }

    fn delta(text: &str) -> ServerEvent {
        ServerEvent::TeacherTextDelta {
            session_id: sid(),
            delta: text.into(),
        }
    }

    fn final_text(text: &str) -> ServerEvent {
        ServerEvent::TeacherTextFinal {
            session_id: sid(),
            text: text.into(),
            board_actions: vec![BoardAction::new(BoardActionKind::WriteBullet)],
        }
    }

    fn board(kind: BoardActionKind, label: &str) -> ServerEvent {
        ServerEvent::BoardAction {
            session_id: sid(),
            action: BoardAction::new(kind).with("text", label),
        }
    }

    #[test]
    fn test_final_text_replaces_deltas_and_leaves_board_alone() {
        let mut state = SessionState::for_session(sid());
        state.apply(&board(BoardActionKind::WriteTitle, "Photosynthesis"));
        let board_before = state.board.clone();

        for piece in ["Plants ", "make ", "sugar ", "from "] {
            state.apply(&delta(piece));
        }
        assert_eq!(state.teacher_text.as_str(), "Plants make sugar from ");
        assert_eq!(state.board, board_before);

        state.apply(&final_text("Plants make sugar from light."));
        assert_eq!(state.teacher_text.as_str(), "Plants make sugar from light.");
        assert!(state.teacher_text.is_final());
        assert_eq!(state.board, board_before);
    }

    #[test]
    fn test_delta_after_final_starts_new_turn() {
        let mut state = SessionState::default();
        state.apply(&delta("old "));
        state.apply(&final_text("old turn"));
        state.apply(&delta("new"));
        assert_eq!(state.teacher_text.as_str(), "new");
        assert!(!state.teacher_text.is_final());
    }

    #[test]
    fn test_board_actions_append_in_order_and_clear_empties() {
        let mut state = SessionState::default();
        state.apply(&board(BoardActionKind::WriteTitle, "a"));
        state.apply(&board(BoardActionKind::WriteBullet, "b"));
        state.apply(&board(BoardActionKind::Highlight, "c"));

        let labels: Vec<_> = state
            .board
            .iter()
            .map(|a| a.payload["text"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(labels, vec!["a", "b", "c"]);

        state.apply(&board(BoardActionKind::Clear, ""));
        assert!(state.board.is_empty());

        state.apply(&board(BoardActionKind::WriteStep, "d"));
        assert_eq!(state.board.len(), 1);
    }

    #[test]
    fn test_status_updates_difficulty() {
        let mut state = SessionState::default();
        let event = decode_event(
            r#"{"type":"STATUS","session_id":"s1","status":"paused","difficulty_level":4,"progress":0.25}"#,
        )
        .unwrap();

        assert!(state.apply(&event));
        assert_eq!(state.teaching_status, TeachingStatus::Paused);
        assert_eq!(state.difficulty_level.get(), 4);
        assert_eq!(state.difficulty_title, "Advanced");
        assert_eq!(state.progress, 0.25);

        // The same status again changes nothing.
        assert!(!state.apply(&event));
    }

    #[test]
    fn test_status_title_from_backend_wins() {
        let mut state = SessionState::default();
        let event = decode_event(
            r#"{"type":"STATUS","session_id":"s1","status":"TEACHING","difficulty_level":2,"difficulty_title":"Débutant+"}"#,
        )
        .unwrap();
        state.apply(&event);
        assert_eq!(state.difficulty_title, "Débutant+");
    }

    #[test]
    fn test_history_replaces_transcript() {
        let mut state = SessionState::default();
        state.apply(&final_text("stale"));
        let event = decode_event(
            r#"{"type":"HISTORY","session_id":"s1","history":[{"role":"user","content":"q"},{"role":"assistant","content":"a"}]}"#,
        )
        .unwrap();
        state.apply(&event);
        assert_eq!(state.transcript.len(), 2);
        assert_eq!(state.transcript[0].content, "q");
    }

    #[test]
    fn test_checkpoint_error_and_transcription_are_recorded() {
        let mut state = SessionState::default();
        state.apply(&ServerEvent::Checkpoint {
            session_id: sid(),
            step_id: 7,
            short_summary: "covered chlorophyll".into(),
        });
        state.apply(&ServerEvent::Error {
            session_id: sid(),
            error_code: "INTERNAL_ERROR".into(),
            message: "boom".into(),
        });
        state.apply(&ServerEvent::VoiceTranscription {
            session_id: sid(),
            text: "what is light".into(),
        });

        assert_eq!(state.last_checkpoint.as_ref().unwrap().step_id, 7);
        assert_eq!(state.last_error.as_ref().unwrap().code, "INTERNAL_ERROR");
        assert_eq!(state.last_transcription.as_deref(), Some("what is light"));
        assert_eq!(state.transcript.last().unwrap().role, Role::User);
    }

    #[test]
    fn test_projector_publishes_through_dispatcher() {
        let dispatcher = EventDispatcher::new();
        let projector = StateProjector::new();
        let subscriptions = projector.attach(&dispatcher);
        assert_eq!(subscriptions.len(), ServerEventType::ALL.len());

        projector.bind(sid());
        let mut watcher = projector.subscribe();
        dispatcher.dispatch(InboundFrame::Text(
            r#"{"type":"BOARD_ACTION","session_id":"s1","action":{"kind":"WRITE_TITLE","payload":{}}}"#
                .into(),
        ));

        assert!(watcher.has_changed().unwrap());
        assert_eq!(watcher.borrow_and_update().board.len(), 1);

        projector.record_user_message("hello");
        assert_eq!(projector.snapshot().transcript.last().unwrap().content, "hello");
    }
}
