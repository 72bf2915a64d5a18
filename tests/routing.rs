use std::io::{BufReader, Cursor, Read};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use kite_speech::assistant::{spawn_line_reader, Assistant, ReplySpeech, Turn};
use kite_speech::pipeline::Pipeline;
use kite_speech::router::SpeechMode;
use kite_speech::speaker::{PlaybackController, SpeakSkill, UtteranceState};
use kite_speech::tts::{EngineFactory, PlayLog, SimulatedBackend, VoiceSettings};
use kite_speech::{PipelineError, SpeechError};

const LIMIT: Duration = Duration::from_secs(10);

/// Pipeline that records every request it receives.
#[derive(Clone, Default)]
struct Recorder {
    requests: Arc<Mutex<Vec<String>>>,
    offline: bool,
    /// Switched off while the reply is being generated.
    mute: Option<SpeechMode>,
}

impl Recorder {
    fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

impl Pipeline for Recorder {
    async fn respond(&self, request: &str) -> Result<String, PipelineError> {
        self.requests.lock().push(request.to_string());
        if let Some(speech_mode) = &self.mute {
            speech_mode.set(false);
        }
        if self.offline {
            return Err(PipelineError::Unreachable("offline".into()));
        }
        Ok(format!("reply to {request}"))
    }
}

struct Harness {
    assistant: Assistant<Recorder>,
    pipeline: Recorder,
    log: PlayLog,
}

fn harness(chunk_ms: u64, speech_mode: bool) -> Harness {
    harness_with(chunk_ms, speech_mode, Recorder::default())
}

fn harness_with(chunk_ms: u64, speech_mode: bool, pipeline: Recorder) -> Harness {
    harness_with_mode(chunk_ms, SpeechMode::new(speech_mode), pipeline)
}

fn harness_with_mode(chunk_ms: u64, speech_mode: SpeechMode, pipeline: Recorder) -> Harness {
    let backend = SimulatedBackend::new().with_chunk_duration(Duration::from_millis(chunk_ms));
    let log = backend.log();
    let session = EngineFactory::new()
        .initialize_with(Box::new(backend), VoiceSettings::default(), 240)
        .unwrap();
    let controller = PlaybackController::start(session, None).unwrap();
    let skill = SpeakSkill::new(Arc::new(controller));
    Harness {
        assistant: Assistant::new(Some(skill), pipeline.clone(), speech_mode),
        pipeline,
        log,
    }
}

#[tokio::test]
async fn speech_command_goes_to_the_skill_only() {
    let h = harness(5, false);
    let turn = h.assistant.handle("say hello world").await;
    let Turn::Spoken { mut handle, confirmation } = turn else {
        panic!("expected Spoken");
    };
    assert_eq!(confirmation, "[Spoke] hello world");
    let status = tokio::time::timeout(LIMIT, handle.wait()).await.unwrap();
    assert_eq!(status.state, UtteranceState::Completed);

    assert_eq!(h.log.texts(), vec!["hello world"]);
    assert!(h.pipeline.requests().is_empty());
}

#[tokio::test]
async fn plain_request_with_speech_mode_off_is_not_spoken() {
    let h = harness(5, false);
    let turn = h.assistant.handle("hello world").await;
    let Turn::Reply { text, speech } = turn else {
        panic!("expected Reply");
    };
    assert_eq!(text, "reply to hello world");
    assert!(matches!(speech, ReplySpeech::Off));
    assert_eq!(h.pipeline.requests(), vec!["hello world"]);
    assert!(h.log.started().is_empty());
}

#[tokio::test]
async fn speech_mode_speaks_the_reply() {
    let h = harness(5, true);
    let turn = h.assistant.handle("what is the time").await;
    let Turn::Reply {
        speech: ReplySpeech::Queued(mut handle),
        ..
    } = turn
    else {
        panic!("expected a spoken reply");
    };
    tokio::time::timeout(LIMIT, handle.wait()).await.unwrap();
    assert_eq!(h.log.texts(), vec!["reply to what is the time"]);
    assert_eq!(h.pipeline.requests().len(), 1);
}

#[tokio::test]
async fn speech_mode_turned_off_during_the_reply_keeps_it_silent() {
    let speech_mode = SpeechMode::new(true);
    let pipeline = Recorder {
        mute: Some(speech_mode.clone()),
        ..Recorder::default()
    };
    let h = harness_with_mode(5, speech_mode, pipeline);

    let turn = h.assistant.handle("what is the weather").await;
    let Turn::Reply { text, speech } = turn else {
        panic!("expected Reply");
    };
    assert_eq!(text, "reply to what is the weather");
    assert!(matches!(speech, ReplySpeech::Off));
    assert!(!h.assistant.speech_mode().get());
    assert!(h.log.started().is_empty());
    assert!(h.assistant.skill().unwrap().controller().is_idle());
}

#[tokio::test]
async fn empty_speech_payload_falls_through_to_the_pipeline() {
    let h = harness(5, false);
    let turn = h.assistant.handle("say ").await;
    assert!(matches!(turn, Turn::Reply { .. }), "got {turn:?}");
    assert_eq!(h.pipeline.requests(), vec!["say"]);
    assert!(h.log.started().is_empty());
}

#[tokio::test]
async fn pipeline_failure_is_reported_and_not_spoken() {
    let pipeline = Recorder {
        offline: true,
        ..Recorder::default()
    };
    let h = harness_with(5, true, pipeline);
    let turn = h.assistant.handle("tell me a joke").await;
    assert!(matches!(turn, Turn::PipelineFailed(PipelineError::Unreachable(_))));
    assert!(h.log.started().is_empty());
    assert!(h.assistant.skill().unwrap().controller().is_idle());
}

#[tokio::test]
async fn speech_mode_commands_toggle_the_flag() {
    let h = harness(5, false);
    let turn = h.assistant.handle("enable speech").await;
    assert!(matches!(turn, Turn::SpeechMode { enabled: true, available: true }));
    assert!(h.assistant.speech_mode().get());

    let turn = h.assistant.handle("speech toggle").await;
    assert!(matches!(turn, Turn::SpeechMode { enabled: false, .. }));

    h.assistant.handle("speech on").await;
    h.assistant.handle("Disable speech").await;
    assert!(!h.assistant.speech_mode().get());
    assert!(h.pipeline.requests().is_empty());
}

#[tokio::test]
async fn set_commands_configure_or_reject() {
    let h = harness(5, false);
    let Turn::Configured(settings) = h.assistant.handle("set rate 300").await else {
        panic!("expected Configured");
    };
    assert_eq!(settings.rate, 300);

    let turn = h.assistant.handle("set rate fast").await;
    assert!(matches!(turn, Turn::Rejected(SpeechError::InvalidConfig(_))));
    let turn = h.assistant.handle("set volume 3").await;
    assert!(matches!(turn, Turn::Rejected(SpeechError::InvalidConfig(_))));

    let controller = h.assistant.skill().unwrap().controller();
    assert_eq!(controller.settings().rate, 300);
    assert_eq!(controller.settings().volume, 1.0);
}

#[tokio::test]
async fn stop_command_and_barge_in_cancel_active_speech() {
    let h = harness(5_000, false);
    let Turn::Spoken { mut handle, .. } = h.assistant.handle("say a very long story").await else {
        panic!("expected Spoken");
    };
    handle.wait_for_state(UtteranceState::Speaking).await;

    let turn = h.assistant.handle("stop talking").await;
    assert!(matches!(turn, Turn::Stopped { cancelled: 1 }));
    assert_eq!(tokio::time::timeout(LIMIT, handle.wait()).await.unwrap().state, UtteranceState::Cancelled);

    let Turn::Spoken { handle: mut second, .. } = h.assistant.handle("say another long story").await else {
        panic!("expected Spoken");
    };
    second.wait_for_state(UtteranceState::Speaking).await;
    // New non-command input barges in.
    h.assistant.handle("never mind").await;
    assert_eq!(tokio::time::timeout(LIMIT, second.wait()).await.unwrap().state, UtteranceState::Cancelled);
}

#[tokio::test]
async fn without_an_engine_the_assistant_stays_text_only() {
    let pipeline = Recorder::default();
    let assistant = Assistant::new(None, pipeline.clone(), SpeechMode::new(true));

    let turn = assistant.handle("say hi there").await;
    let Turn::NotSpoken { text, error } = turn else {
        panic!("expected NotSpoken");
    };
    assert_eq!(text, "hi there");
    assert!(matches!(error, SpeechError::EngineUnavailable(_)));

    let turn = assistant.handle("how are you").await;
    let Turn::Reply { text, speech } = turn else {
        panic!("expected Reply");
    };
    assert_eq!(text, "reply to how are you");
    assert!(matches!(speech, ReplySpeech::Failed(SpeechError::EngineUnavailable(_))));

    assert!(matches!(assistant.handle("stop").await, Turn::Stopped { cancelled: 0 }));
    assert!(matches!(assistant.handle("exit").await, Turn::Exit));
    assert!(matches!(assistant.handle("   ").await, Turn::Empty));
    assert_eq!(pipeline.requests(), vec!["how are you"]);
}

#[tokio::test]
async fn speech_mode_cannot_be_enabled_without_an_engine() {
    let pipeline = Recorder::default();
    let assistant = Assistant::new(None, pipeline.clone(), SpeechMode::default());

    for command in ["speech on", "enable speech", "speech toggle"] {
        let turn = assistant.handle(command).await;
        assert!(
            matches!(turn, Turn::SpeechMode { enabled: false, available: false }),
            "{command}"
        );
        assert!(!assistant.speech_mode().get());
    }

    let Turn::Reply { speech, .. } = assistant.handle("how are you").await else {
        panic!("expected Reply");
    };
    assert!(matches!(speech, ReplySpeech::Off));
    assert_eq!(pipeline.requests(), vec!["how are you"]);
}

#[tokio::test]
async fn shutdown_releases_the_engine() {
    let factory = EngineFactory::new();
    let session = factory
        .initialize_with(Box::new(SimulatedBackend::new()), VoiceSettings::default(), 240)
        .unwrap();
    let skill = SpeakSkill::new(Arc::new(PlaybackController::start(session, None).unwrap()));
    let assistant = Assistant::new(Some(skill), Recorder::default(), SpeechMode::default());

    assistant.handle("say goodbye everyone").await;
    assistant.shutdown();
    assert!(!factory.is_live());
}

/// Input that never produces a byte, like an idle terminal.
struct Stalled;

impl Read for Stalled {
    fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        std::thread::sleep(Duration::from_secs(3600));
        Ok(0)
    }
}

#[tokio::test]
async fn interrupt_ends_the_session_while_waiting_for_input() {
    let factory = EngineFactory::new();
    let session = factory
        .initialize_with(Box::new(SimulatedBackend::new()), VoiceSettings::default(), 240)
        .unwrap();
    let skill = SpeakSkill::new(Arc::new(PlaybackController::start(session, None).unwrap()));
    let assistant = Assistant::new(Some(skill), Recorder::default(), SpeechMode::default());

    let lines = spawn_line_reader(BufReader::new(Stalled)).unwrap();
    let interrupt = tokio::time::sleep(Duration::from_millis(50));
    let mut turns = 0;
    tokio::time::timeout(LIMIT, assistant.serve(lines, interrupt, |_| {
        turns += 1;
        true
    }))
    .await
    .expect("session ignored the interrupt");

    assert_eq!(turns, 0);
    assert!(!factory.is_live());
}

#[tokio::test]
async fn session_serves_lines_in_order_until_exit() {
    let h = harness(5, false);
    let lines = spawn_line_reader(Cursor::new("hello\nsay hi there\nexit\nnever read\n")).unwrap();
    let mut turns = Vec::new();
    let serving = h.assistant.serve(lines, std::future::pending(), |turn| {
        turns.push(turn);
        true
    });
    tokio::time::timeout(LIMIT, serving).await.unwrap();

    assert_eq!(turns.len(), 3);
    assert!(matches!(turns[0], Turn::Reply { .. }));
    assert!(matches!(turns[1], Turn::Spoken { .. }));
    assert!(matches!(turns[2], Turn::Exit));
    assert_eq!(h.pipeline.requests(), vec!["hello"]);
}

#[tokio::test]
async fn session_ends_when_input_closes() {
    let h = harness(5, false);
    let lines = spawn_line_reader(Cursor::new("first\nsecond")).unwrap();
    let mut count = 0;
    let serving = h.assistant.serve(lines, std::future::pending(), |_| {
        count += 1;
        true
    });
    tokio::time::timeout(LIMIT, serving).await.unwrap();

    assert_eq!(count, 2);
    assert_eq!(h.pipeline.requests(), vec!["first", "second"]);
}
