//! Session allocation over HTTP, the first half of starting a lesson.

use super::Endpoints;
use crate::{
    error::BootstrapError,
    protocol::{ClientEvent, DifficultyLevel, SessionId},
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Parameters of a new lesson session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LessonRequest {
    pub lesson_id: String,
    pub user_id: Option<String>,
    pub initial_difficulty: Option<DifficultyLevel>,
    pub language: Option<String>,
    pub context: Option<Value>,
}

impl LessonRequest {
    pub fn new(lesson_id: impl Into<String>) -> Self {
        Self {
            lesson_id: lesson_id.into(),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_difficulty(mut self, level: DifficultyLevel) -> Self {
        self.initial_difficulty = Some(level);
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Builds the `START_LESSON` body. A user id that is not a canonical
    /// UUID is left out; the backend would reject the whole request.
    pub fn to_event(&self) -> ClientEvent {
        let user_id = match &self.user_id {
            Some(id) if is_canonical_uuid(id) => Some(id.clone()),
            Some(id) => {
                warn!(user_id = %id, "Dropping user id that is not a UUID");
                None
            }
            None => None,
        };
        ClientEvent::StartLesson {
            lesson_id: self.lesson_id.clone(),
            user_id,
            initial_difficulty: self.initial_difficulty,
            language: self.language.clone(),
            context: self.context.clone(),
        }
    }
}

/// `true` only for the 36-character hyphenated form.
pub fn is_canonical_uuid(s: &str) -> bool {
    s.len() == 36 && Uuid::try_parse(s).is_ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionStarted {
    pub session_id: SessionId,
    #[serde(default)]
    pub status: Option<String>,
}

/// Asks the backend to allocate a session for `request`.
pub async fn request_session(
    http: &reqwest::Client,
    endpoints: &Endpoints,
    request: &LessonRequest,
) -> Result<SessionStarted, BootstrapError> {
    let url = endpoints.session_start_url();
    debug!(%url, lesson_id = %request.lesson_id, "Requesting session");

    let response = http.post(url).json(&request.to_event()).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BootstrapError::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    let started: SessionStarted = response.json().await?;
    info!(session_id = %started.session_id, "Session allocated");
    Ok(started)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, method, path},
    };

    const USER: &str = "3f2b8c1e-9a4d-4e6f-8b7a-1c2d3e4f5a6b";

    #[test]
    fn test_canonical_uuid_check() {
        assert!(is_canonical_uuid(USER));
        assert!(!is_canonical_uuid("3f2b8c1e9a4d4e6f8b7a1c2d3e4f5a6b"));
        assert!(!is_canonical_uuid("{3f2b8c1e-9a4d-4e6f-8b7a-1c2d3e4f5a6b}"));
        assert!(!is_canonical_uuid("user-42"));
        assert!(!is_canonical_uuid(""));
    }

    #[test]
    fn test_non_uuid_user_is_omitted_from_body() {
        let body = serde_json::to_value(LessonRequest::new("l1").with_user("bob").to_event()).unwrap();
        assert_eq!(body, json!({"type": "START_LESSON", "lesson_id": "l1"}));

        let body = serde_json::to_value(LessonRequest::new("l1").with_user(USER).to_event()).unwrap();
        assert_eq!(body["user_id"], USER);
    }

    #[tokio::test]
    async fn test_request_session_posts_start_lesson() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/learn/session/start"))
            .and(body_json(json!({
                "type": "START_LESSON",
                "lesson_id": "fractions-101",
                "context": {"grade": 5}
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"session_id": "abc", "status": "created"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let endpoints = Endpoints::parse(&server.uri()).unwrap();
        let request = LessonRequest::new("fractions-101")
            .with_user("not-a-uuid")
            .with_context(json!({"grade": 5}));
        let started = request_session(&reqwest::Client::new(), &endpoints, &request)
            .await
            .unwrap();

        assert_eq!(started.session_id, SessionId::new("abc"));
        assert_eq!(started.status.as_deref(), Some("created"));
    }

    #[tokio::test]
    async fn test_rejected_allocation_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Lesson not found"))
            .mount(&server)
            .await;

        let endpoints = Endpoints::parse(&server.uri()).unwrap();
        let err = request_session(&reqwest::Client::new(), &endpoints, &LessonRequest::new("x"))
            .await
            .unwrap_err();

        match err {
            BootstrapError::Rejected { status, body } => {
                assert_eq!(status, 404);
                assert_eq!(body, "Lesson not found");
            }
            other => panic!("Expected Rejected, got {:?}", other),
        }
    }
}
