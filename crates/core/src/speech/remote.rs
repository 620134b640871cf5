//! Speech synthesized by an HTTP service and played locally.

use super::backend::{Lifecycle, LifecycleSink, SpeechBackend, Utterance};
use crate::error::SynthesisError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Plays encoded audio returned by a synthesis service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Plays `audio` to completion.
    async fn play(&self, audio: Bytes) -> Result<(), SynthesisError>;
    fn pause(&self) -> bool;
    fn resume(&self) -> bool;
    fn stop(&self);
}

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
    language: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
    rate: f32,
    pitch: f32,
    volume: f32,
}

pub struct RemoteSynthesizer {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
    output: Arc<dyn AudioOutput>,
}

impl RemoteSynthesizer {
    pub fn new(url: impl Into<String>, output: Arc<dyn AudioOutput>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            api_key: None,
            output,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    fn request(&self, utterance: &Utterance) -> reqwest::RequestBuilder {
        let settings = &utterance.settings;
        let body = SynthesisRequest {
            text: &utterance.text,
            language: &settings.language,
            voice: settings.voice.as_deref(),
            rate: settings.rate,
            pitch: settings.pitch,
            volume: settings.volume,
        };
        let request = self.http.post(&self.url).json(&body);
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

async fn fetch_audio(request: reqwest::RequestBuilder) -> Result<Bytes, SynthesisError> {
    let response = request
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| SynthesisError::Synthesis(e.to_string()))?;
    response
        .bytes()
        .await
        .map_err(|e| SynthesisError::Synthesis(e.to_string()))
}

#[async_trait]
impl SpeechBackend for RemoteSynthesizer {
    fn name(&self) -> &'static str {
        "remote"
    }

    #[instrument(name = "remote_speak", skip_all, fields(chars = utterance.text.len()))]
    async fn speak(
        &self,
        utterance: Utterance,
        lifecycle: LifecycleSink,
    ) -> Result<(), SynthesisError> {
        // The request runs on its own task: abandoning this utterance drops
        // the handle, and whatever comes back is discarded.
        let synthesis = tokio::spawn(fetch_audio(self.request(&utterance)));
        let audio = synthesis
            .await
            .map_err(|e| SynthesisError::Synthesis(e.to_string()))??;
        if audio.is_empty() {
            return Err(SynthesisError::Synthesis("service returned no audio".into()));
        }
        debug!(bytes = audio.len(), "Synthesized audio received");

        let _ = lifecycle.send(Lifecycle::Started);
        self.output.play(audio).await
    }

    fn pause(&self) -> bool {
        self.output.pause()
    }

    fn resume(&self) -> bool {
        self.output.resume()
    }

    fn cancel(&self) {
        self.output.stop()
    }
}
