//! Wires one lesson together: the socket, event fan-out, projected state,
//! the teacher's voice and the microphone uplink.

use bytes::Bytes;
use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, instrument, warn};
use tutor_core::{
    ConnectionManager, EventDispatcher, EventHandler, SessionState, SpeechQueue, StateProjector,
    Subscription, VoiceActivityHandler,
    connection::LessonRequest,
    error::BootstrapError,
    protocol::{
        ClientEvent, DifficultyLevel, InboundFrame, InterruptReason, ServerEvent, ServerEventType,
        SessionId, VoiceAction,
    },
    speech::AudioOutput,
};

/// Follows the teacher's turns and feeds their text into the speech queue.
///
/// A final without preceding deltas is spoken as-is; otherwise the collected
/// deltas are spoken and the final's text is only used for display. A turn
/// silenced while it streams stays silent until its final arrives.
#[derive(Default)]
struct TurnFeed {
    speech: OnceLock<SpeechQueue>,
    streaming: AtomicBool,
    muted: AtomicBool,
}

impl TurnFeed {
    /// Mutes the rest of the turn in progress, if any.
    fn silence(&self) {
        if self.streaming.load(Ordering::Acquire) {
            self.muted.store(true, Ordering::Release);
        }
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }
}

impl EventHandler for TurnFeed {
    fn handle(&self, event: &ServerEvent) {
        match event {
            ServerEvent::TeacherTextDelta { delta, .. } => {
                self.streaming.store(true, Ordering::Release);
                if self.is_muted() {
                    return;
                }
                if let Some(speech) = self.speech.get() {
                    speech.append_text(delta.as_str());
                }
            }
            ServerEvent::TeacherTextFinal { text, .. } => {
                let streamed = self.streaming.swap(false, Ordering::AcqRel);
                if self.muted.swap(false, Ordering::AcqRel) {
                    debug!("Dropped the rest of a silenced turn");
                    return;
                }
                let Some(speech) = self.speech.get() else {
                    return;
                };
                if streamed {
                    speech.finalize_speech();
                } else {
                    speech.speak(text.as_str());
                }
            }
            _ => {}
        }
    }
}

/// Audio synthesized by the backend. Bumping the generation cuts the clip
/// that is playing and discards every clip queued before the bump.
struct ServerAudio {
    output: Arc<dyn AudioOutput>,
    generation: watch::Sender<u64>,
}

impl ServerAudio {
    fn stop(&self) {
        self.generation.send_modify(|generation| *generation += 1);
        self.output.stop();
    }
}

/// Everything that has to go quiet when the student takes the floor.
#[derive(Clone)]
struct Silencer {
    feed: Arc<TurnFeed>,
    speech: Option<SpeechQueue>,
    server_audio: Option<Arc<ServerAudio>>,
}

impl Silencer {
    fn silence(&self) {
        self.feed.silence();
        if let Some(speech) = &self.speech {
            speech.stop();
        }
        if let Some(audio) = &self.server_audio {
            audio.stop();
        }
    }
}

#[instrument(skip_all)]
async fn pump_frames(mut frames: mpsc::UnboundedReceiver<InboundFrame>, dispatcher: EventDispatcher) {
    while let Some(frame) = frames.recv().await {
        dispatcher.dispatch(frame);
    }
    debug!("Inbound frame stream closed");
}

/// Plays backend audio clips strictly one after another.
#[instrument(skip_all)]
async fn play_clips(mut clips: mpsc::UnboundedReceiver<(u64, Bytes)>, audio: Arc<ServerAudio>) {
    let mut generation = audio.generation.subscribe();
    while let Some((queued_at, clip)) = clips.recv().await {
        if *generation.borrow_and_update() != queued_at {
            debug!("Skipping a clip queued before a stop");
            continue;
        }
        tokio::select! {
            played = audio.output.play(clip) => {
                if let Err(e) = played {
                    warn!(error = %e, "Failed to play backend audio");
                }
            }
            _ = generation.wait_for(|current| *current != queued_at) => {
                debug!("Backend audio cut short");
            }
        }
    }
}

pub struct TutorSession {
    connection: ConnectionManager,
    dispatcher: EventDispatcher,
    projector: StateProjector,
    silencer: Silencer,
    subscriptions: Vec<Subscription>,
    tasks: Vec<JoinHandle<()>>,
}

impl TutorSession {
    /// `frames` is the inbound stream returned alongside `connection`.
    pub fn new(
        connection: ConnectionManager,
        frames: mpsc::UnboundedReceiver<InboundFrame>,
    ) -> Self {
        let dispatcher = EventDispatcher::new();
        let projector = StateProjector::new();
        let mut subscriptions = projector.attach(&dispatcher);
        let feed = Arc::new(TurnFeed::default());
        for kind in [
            ServerEventType::TeacherTextDelta,
            ServerEventType::TeacherTextFinal,
        ] {
            subscriptions.push(dispatcher.subscribe_shared(kind, feed.clone()));
        }
        let pump = tokio::spawn(pump_frames(frames, dispatcher.clone()));
        Self {
            connection,
            dispatcher,
            projector,
            silencer: Silencer {
                feed,
                speech: None,
                server_audio: None,
            },
            subscriptions,
            tasks: vec![pump],
        }
    }

    /// Speaks the teacher's text as it streams in.
    pub fn with_speech(mut self, speech: SpeechQueue) -> Self {
        if self.silencer.feed.speech.set(speech.clone()).is_err() {
            warn!("Speech queue already attached, keeping the first one");
            return self;
        }
        self.silencer.speech = Some(speech);
        self
    }

    /// Plays audio synthesized by the backend instead of speaking locally.
    pub fn with_server_audio(mut self, output: Arc<dyn AudioOutput>) -> Self {
        let (generation, _) = watch::channel(0);
        let audio = Arc::new(ServerAudio { output, generation });
        let (clips_tx, clips_rx) = mpsc::unbounded_channel();
        let feed = self.silencer.feed.clone();
        let queue = audio.clone();
        self.subscriptions
            .push(self.dispatcher.subscribe_audio(move |clip: &Bytes| {
                if feed.is_muted() {
                    return;
                }
                let _ = clips_tx.send((*queue.generation.borrow(), clip.clone()));
            }));
        self.tasks.push(tokio::spawn(play_clips(clips_rx, audio.clone())));
        self.silencer.server_audio = Some(audio);
        self
    }

    /// Allocates a new session and connects to it.
    pub async fn start(&self, request: &LessonRequest) -> Result<SessionId, BootstrapError> {
        let session_id = self.connection.start_session(request).await?;
        self.projector.bind(session_id.clone());
        info!(%session_id, lesson_id = %request.lesson_id, "Lesson started");
        Ok(session_id)
    }

    /// Attaches to an existing session.
    pub fn join(&self, session_id: SessionId) {
        self.projector.bind(session_id.clone());
        self.connection.connect(session_id);
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn projector(&self) -> &StateProjector {
        &self.projector
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn speech(&self) -> Option<&SpeechQueue> {
        self.silencer.speech.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.projector.snapshot()
    }

    fn session_id(&self) -> Option<SessionId> {
        let session_id = self.connection.session_id();
        if session_id.is_none() {
            warn!("No active session");
        }
        session_id
    }

    fn last_step(&self) -> Option<u32> {
        self.projector
            .subscribe()
            .borrow()
            .last_checkpoint
            .as_ref()
            .map(|checkpoint| checkpoint.step_id)
    }

    fn send(&self, event: ClientEvent) -> bool {
        let sent = self.connection.send(&event);
        if sent {
            debug!(kind = event.kind(), "Sent client event");
        } else {
            warn!(kind = event.kind(), "Socket is not open, event dropped");
        }
        sent
    }

    /// Silences the teacher's voice, including the rest of a turn that is
    /// still streaming in.
    pub fn stop_speech(&self) {
        self.silencer.silence();
    }

    /// Sends a typed message. The teacher stops talking first.
    pub fn send_message(&self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        let Some(session_id) = self.session_id() else {
            return false;
        };
        self.stop_speech();
        let sent = self.send(ClientEvent::UserMessage {
            session_id,
            text: text.to_owned(),
            step_id: self.last_step(),
        });
        if sent {
            self.projector.record_user_message(text);
        }
        sent
    }

    pub fn interrupt(&self, reason: InterruptReason, text: Option<String>) -> bool {
        let Some(session_id) = self.session_id() else {
            return false;
        };
        self.stop_speech();
        self.send(ClientEvent::Interrupt {
            session_id,
            reason: Some(reason),
            text,
            step_id: self.last_step(),
        })
    }

    /// Resumes from the last checkpoint, or from the start if none was seen.
    pub fn resume(&self) -> bool {
        let Some(session_id) = self.session_id() else {
            return false;
        };
        self.send(ClientEvent::Resume {
            session_id,
            step_id: self.last_step().unwrap_or(0),
        })
    }

    pub fn change_difficulty(&self, level: DifficultyLevel) -> bool {
        let Some(session_id) = self.session_id() else {
            return false;
        };
        self.send(ClientEvent::ChangeDifficulty { session_id, level })
    }

    pub fn request_quiz(&self) -> bool {
        let Some(session_id) = self.session_id() else {
            return false;
        };
        self.send(ClientEvent::RequestQuiz { session_id })
    }

    pub fn request_flashcards(&self) -> bool {
        let Some(session_id) = self.session_id() else {
            return false;
        };
        self.send(ClientEvent::RequestFlashcards { session_id })
    }

    pub fn toggle_voice(&self, action: VoiceAction) -> bool {
        let Some(session_id) = self.session_id() else {
            return false;
        };
        self.send(ClientEvent::ToggleVoice { session_id, action })
    }

    pub fn request_status(&self) -> bool {
        let Some(session_id) = self.session_id() else {
            return false;
        };
        self.send(ClientEvent::Status { session_id })
    }

    /// A sink for the voice activity detector that streams microphone audio
    /// over this session's socket.
    pub fn uplink(&self) -> UplinkHandler {
        UplinkHandler {
            connection: self.connection.clone(),
            silencer: self.silencer.clone(),
            sent: 0,
            dropped: 0,
        }
    }

    /// Closes the socket, silences speech and releases every listener.
    pub fn shutdown(self) {
        self.stop_speech();
        self.connection.disconnect();
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
        for task in self.tasks {
            task.abort();
        }
        info!("Session shut down");
    }
}

/// Streams encoded microphone chunks to the backend.
pub struct UplinkHandler {
    connection: ConnectionManager,
    silencer: Silencer,
    sent: u64,
    dropped: u64,
}

impl UplinkHandler {
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl VoiceActivityHandler for UplinkHandler {
    fn on_chunk(&mut self, chunk: Bytes) {
        if self.connection.send_binary(chunk) {
            self.sent += 1;
        } else {
            self.dropped += 1;
        }
    }

    fn on_speech_start(&mut self) {
        info!("User started speaking");
        // Barge-in: the teacher yields to the student.
        self.silencer.silence();
    }

    fn on_speech_end(&mut self) {
        info!(sent = self.sent, dropped = self.dropped, "User stopped speaking");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::{
        sync::{Mutex, atomic::AtomicUsize},
        time::Duration,
    };
    use tutor_core::{
        connection::{
            ConnectionConfig, Endpoints, OutboundFrame, ReconnectPolicy, SocketChannels,
            Transport, TransportEvent,
        },
        error::{ConnectionError, SynthesisError},
        ConnectionStatus,
        projector::Checkpoint,
        protocol::Role,
        speech::{LifecycleSink, SpeechBackend, SpeechSettings, Utterance},
    };

    #[derive(Default)]
    struct FakeTransport {
        outbound: Mutex<Vec<mpsc::UnboundedReceiver<OutboundFrame>>>,
        inbound: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
    }

    impl FakeTransport {
        fn take_outbound(&self) -> mpsc::UnboundedReceiver<OutboundFrame> {
            self.outbound.lock().unwrap().remove(0)
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn open(&self, _url: &str) -> Result<SocketChannels, ConnectionError> {
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            self.outbound.lock().unwrap().push(outbound_rx);
            self.inbound.lock().unwrap().push(inbound_tx);
            Ok(SocketChannels {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        }
    }

    #[derive(Default)]
    struct RecordingBackend {
        spoken: Mutex<Vec<String>>,
        cancelled: AtomicBool,
    }

    #[async_trait]
    impl SpeechBackend for RecordingBackend {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn speak(
            &self,
            utterance: Utterance,
            _lifecycle: LifecycleSink,
        ) -> Result<(), SynthesisError> {
            self.spoken.lock().unwrap().push(utterance.text);
            Ok(())
        }

        fn pause(&self) -> bool {
            false
        }

        fn resume(&self) -> bool {
            false
        }

        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingOutput {
        played: Mutex<Vec<Bytes>>,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl AudioOutput for RecordingOutput {
        async fn play(&self, audio: Bytes) -> Result<(), SynthesisError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.played.lock().unwrap().push(audio);
            Ok(())
        }

        fn pause(&self) -> bool {
            false
        }

        fn resume(&self) -> bool {
            false
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn session_with(
        transport: &Arc<FakeTransport>,
    ) -> (TutorSession, mpsc::UnboundedSender<InboundFrame>) {
        let config = ConnectionConfig {
            endpoints: Endpoints::parse("http://localhost:8000").unwrap(),
            reconnect: ReconnectPolicy::default(),
        };
        let (connection, _manager_frames) = ConnectionManager::new(config, transport.clone());
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        (TutorSession::new(connection, frames_rx), frames_tx)
    }

    /// Lets every spawned task run until it blocks.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn text(json: &str) -> InboundFrame {
        InboundFrame::Text(json.to_string())
    }

    async fn open(session: &TutorSession, id: &str) {
        session.join(SessionId::new(id));
        session
            .connection()
            .watch()
            .wait_for(|s| s.status == ConnectionStatus::Connected)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_frames_reach_projected_state() {
        let transport = Arc::new(FakeTransport::default());
        let (session, frames) = session_with(&transport);
        session.projector().bind(SessionId::new("s1"));

        frames
            .send(text(r#"{"type":"TEACHER_TEXT_DELTA","session_id":"s1","delta":"Hel"}"#))
            .unwrap();
        frames
            .send(text(r#"{"type":"TEACHER_TEXT_DELTA","session_id":"s1","delta":"lo"}"#))
            .unwrap();
        frames.send(text("not json")).unwrap();
        frames
            .send(text(r#"{"type":"CHECKPOINT","session_id":"s1","step_id":7,"short_summary":"limits"}"#))
            .unwrap();
        settle().await;

        let state = session.state();
        assert_eq!(state.teacher_text.as_str(), "Hello");
        assert_eq!(
            state.last_checkpoint,
            Some(Checkpoint {
                step_id: 7,
                summary: "limits".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_need_a_session() {
        let transport = Arc::new(FakeTransport::default());
        let (session, _frames) = session_with(&transport);

        assert!(!session.send_message("hello"));
        assert!(!session.resume());
        assert!(!session.request_quiz());
        assert!(session.state().transcript.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_carries_last_checkpoint() {
        let transport = Arc::new(FakeTransport::default());
        let (session, frames) = session_with(&transport);
        open(&session, "s1").await;
        let mut outbound = transport.take_outbound();

        frames
            .send(text(r#"{"type":"CHECKPOINT","session_id":"s1","step_id":3,"short_summary":"x"}"#))
            .unwrap();
        settle().await;

        assert!(session.send_message("  why?  "));
        match outbound.recv().await.unwrap() {
            OutboundFrame::Text(json) => {
                let value: serde_json::Value = serde_json::from_str(&json).unwrap();
                assert_eq!(value["type"], "USER_MESSAGE");
                assert_eq!(value["session_id"], "s1");
                assert_eq!(value["text"], "why?");
                assert_eq!(value["step_id"], 3);
            }
            other => panic!("Expected text frame, got {:?}", other),
        }

        let transcript = session.state().transcript;
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].role, Role::User);
        assert_eq!(transcript[0].content, "why?");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_defaults_to_step_zero() {
        let transport = Arc::new(FakeTransport::default());
        let (session, _frames) = session_with(&transport);
        open(&session, "s1").await;
        let mut outbound = transport.take_outbound();

        assert!(session.resume());
        match outbound.recv().await.unwrap() {
            OutboundFrame::Text(json) => {
                let value: serde_json::Value = serde_json::from_str(&json).unwrap();
                assert_eq!(value["type"], "RESUME");
                assert_eq!(value["step_id"], 0);
            }
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_streamed_text_is_spoken_once() {
        let transport = Arc::new(FakeTransport::default());
        let backend = Arc::new(RecordingBackend::default());
        let (session, frames) = session_with(&transport);
        let session =
            session.with_speech(SpeechQueue::spawn(backend.clone(), SpeechSettings::default()));

        for frame in [
            r#"{"type":"TEACHER_TEXT_DELTA","session_id":"s1","delta":"Two plus "}"#,
            r#"{"type":"TEACHER_TEXT_DELTA","session_id":"s1","delta":"two."}"#,
            r#"{"type":"TEACHER_TEXT_FINAL","session_id":"s1","text":"Two plus two."}"#,
            r#"{"type":"TEACHER_TEXT_FINAL","session_id":"s1","text":"Is four."}"#,
        ] {
            frames.send(text(frame)).unwrap();
        }
        settle().await;

        assert_eq!(
            *backend.spoken.lock().unwrap(),
            vec!["Two plus two.".to_string(), "Is four.".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_barge_in_silences_rest_of_turn() {
        let transport = Arc::new(FakeTransport::default());
        let backend = Arc::new(RecordingBackend::default());
        let (session, frames) = session_with(&transport);
        let session =
            session.with_speech(SpeechQueue::spawn(backend.clone(), SpeechSettings::default()));
        let mut uplink = session.uplink();

        frames
            .send(text(r#"{"type":"TEACHER_TEXT_DELTA","session_id":"s1","delta":"The derivative of "}"#))
            .unwrap();
        settle().await;
        uplink.on_speech_start();
        settle().await;

        for frame in [
            r#"{"type":"TEACHER_TEXT_DELTA","session_id":"s1","delta":"x squared is 2x."}"#,
            r#"{"type":"TEACHER_TEXT_FINAL","session_id":"s1","text":"The derivative of x squared is 2x."}"#,
        ] {
            frames.send(text(frame)).unwrap();
        }
        settle().await;
        assert!(backend.spoken.lock().unwrap().is_empty());

        // The next turn is heard again.
        for frame in [
            r#"{"type":"TEACHER_TEXT_DELTA","session_id":"s1","delta":"Good "}"#,
            r#"{"type":"TEACHER_TEXT_DELTA","session_id":"s1","delta":"question."}"#,
            r#"{"type":"TEACHER_TEXT_FINAL","session_id":"s1","text":"Good question."}"#,
        ] {
            frames.send(text(frame)).unwrap();
        }
        settle().await;
        assert_eq!(
            *backend.spoken.lock().unwrap(),
            vec!["Good question.".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_between_turns_keeps_next_reply() {
        let transport = Arc::new(FakeTransport::default());
        let backend = Arc::new(RecordingBackend::default());
        let (session, frames) = session_with(&transport);
        let session =
            session.with_speech(SpeechQueue::spawn(backend.clone(), SpeechSettings::default()));

        frames
            .send(text(r#"{"type":"TEACHER_TEXT_FINAL","session_id":"s1","text":"Hi."}"#))
            .unwrap();
        settle().await;
        session.stop_speech();

        for frame in [
            r#"{"type":"TEACHER_TEXT_DELTA","session_id":"s1","delta":"Sure."}"#,
            r#"{"type":"TEACHER_TEXT_FINAL","session_id":"s1","text":"Sure."}"#,
        ] {
            frames.send(text(frame)).unwrap();
        }
        settle().await;

        assert_eq!(
            *backend.spoken.lock().unwrap(),
            vec!["Hi.".to_string(), "Sure.".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_cuts_backend_audio() {
        let transport = Arc::new(FakeTransport::default());
        let output = Arc::new(RecordingOutput::default());
        let (session, frames) = session_with(&transport);
        let session = session.with_server_audio(output.clone());
        open(&session, "s1").await;

        frames
            .send(text(r#"{"type":"TEACHER_TEXT_DELTA","session_id":"s1","delta":"First, "}"#))
            .unwrap();
        frames.send(InboundFrame::Binary(Bytes::from_static(b"one"))).unwrap();
        frames.send(InboundFrame::Binary(Bytes::from_static(b"two"))).unwrap();
        settle().await;

        assert!(session.interrupt(InterruptReason::Question, None));
        frames.send(InboundFrame::Binary(Bytes::from_static(b"late"))).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(output.played.lock().unwrap().is_empty());
        assert_eq!(output.stops.load(Ordering::SeqCst), 1);

        frames
            .send(text(r#"{"type":"TEACHER_TEXT_FINAL","session_id":"s1","text":"First, a limit."}"#))
            .unwrap();
        frames.send(InboundFrame::Binary(Bytes::from_static(b"three"))).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            *output.played.lock().unwrap(),
            vec![Bytes::from_static(b"three")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_audio_plays_in_order() {
        let transport = Arc::new(FakeTransport::default());
        let output = Arc::new(RecordingOutput::default());
        let (session, frames) = session_with(&transport);
        let _session = session.with_server_audio(output.clone());

        frames.send(InboundFrame::Binary(Bytes::from_static(b"one"))).unwrap();
        frames.send(InboundFrame::Binary(Bytes::from_static(b"two"))).unwrap();
        settle().await;
        assert!(output.played.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(
            *output.played.lock().unwrap(),
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_uplink_streams_chunks_and_barges_in() {
        let transport = Arc::new(FakeTransport::default());
        let backend = Arc::new(RecordingBackend::default());
        let (session, _frames) = session_with(&transport);
        let session =
            session.with_speech(SpeechQueue::spawn(backend.clone(), SpeechSettings::default()));

        let mut uplink = session.uplink();
        uplink.on_chunk(Bytes::from_static(&[1, 0]));
        assert_eq!(uplink.dropped(), 1);

        open(&session, "s1").await;
        let mut outbound = transport.take_outbound();
        uplink.on_chunk(Bytes::from_static(&[2, 0]));
        assert_eq!(uplink.sent(), 1);
        assert_eq!(
            outbound.recv().await.unwrap(),
            OutboundFrame::Binary(Bytes::from_static(&[2, 0]))
        );

        uplink.on_speech_start();
        settle().await;
        assert!(backend.cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_socket() {
        let transport = Arc::new(FakeTransport::default());
        let (session, _frames) = session_with(&transport);
        open(&session, "s1").await;
        let mut outbound = transport.take_outbound();

        session.shutdown();

        match outbound.recv().await.unwrap() {
            OutboundFrame::Close { code, .. } => assert_eq!(code, 1000),
            other => panic!("Expected close frame, got {:?}", other),
        }
    }
}
