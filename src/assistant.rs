//! Per-request dispatch: route a request, then invoke exactly one of the
//! speak skill or the reply pipeline (plus speaking the reply when speech
//! mode asks for it).
//!
//! Speech failures never fail a turn. Without a usable engine the assistant
//! keeps working text-only.

use std::future::Future;
use std::io::BufRead;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, SpeechError};
use crate::pipeline::Pipeline;
use crate::router::{route, Command, RequestState, RouteDecision, RouteTarget, SpeechMode};
use crate::speaker::{SpeakSkill, UtteranceHandle};
use crate::tts::VoiceSettings;

/// What happened to a pipeline reply on the speech side.
#[derive(Debug)]
pub enum ReplySpeech {
    /// Speech mode was off.
    Off,
    Queued(UtteranceHandle),
    Failed(SpeechError),
}

/// Outcome of one request.
#[derive(Debug)]
pub enum Turn {
    /// Blank input.
    Empty,
    Spoken {
        handle: UtteranceHandle,
        confirmation: String,
    },
    /// A speech request that could not be spoken; `text` is shown instead.
    NotSpoken { text: String, error: SpeechError },
    Reply { text: String, speech: ReplySpeech },
    PipelineFailed(PipelineError),
    SpeechMode { enabled: bool, available: bool },
    Stopped { cancelled: usize },
    Configured(VoiceSettings),
    Rejected(SpeechError),
    Exit,
}

pub struct Assistant<P> {
    skill: Option<SpeakSkill>,
    pipeline: P,
    speech_mode: SpeechMode,
    barge_in: bool,
}

impl<P: Pipeline> Assistant<P> {
    /// `skill` is `None` when no speech engine could be initialized.
    pub fn new(skill: Option<SpeakSkill>, pipeline: P, speech_mode: SpeechMode) -> Self {
        Self {
            skill,
            pipeline,
            speech_mode,
            barge_in: true,
        }
    }

    /// Cancel current speech whenever a new spoken or pipeline request arrives.
    pub fn with_barge_in(mut self, enabled: bool) -> Self {
        self.barge_in = enabled;
        self
    }

    pub fn speech_mode(&self) -> &SpeechMode {
        &self.speech_mode
    }

    pub fn skill(&self) -> Option<&SpeakSkill> {
        self.skill.as_ref()
    }

    pub fn speech_available(&self) -> bool {
        self.skill.is_some()
    }

    /// Route and dispatch one request.
    pub async fn handle(&self, input: &str) -> Turn {
        let input = input.trim();
        if input.is_empty() {
            return Turn::Empty;
        }
        debug!("Request {}: {input}", RequestState::Received);

        let decision = route(input, self.speech_mode.get());
        debug!(
            "Request {}: {:?} (pattern {:?}, confidence {:.2})",
            RequestState::Classified,
            decision.target,
            decision.matched_pattern,
            decision.confidence
        );

        let turn = self.dispatch(input, decision).await;
        debug!("Request {}", RequestState::Dispatched);
        turn
    }

    async fn dispatch(&self, input: &str, decision: RouteDecision) -> Turn {
        match decision.target {
            RouteTarget::Command(command) => self.run_command(command),
            RouteTarget::Speak { payload } => {
                self.barge_in();
                self.speak(&payload)
            }
            RouteTarget::Pipeline | RouteTarget::Ambiguous => {
                self.barge_in();
                self.ask(input, decision.speak_reply).await
            }
        }
    }

    fn speak(&self, payload: &str) -> Turn {
        let Some(skill) = &self.skill else {
            return Turn::NotSpoken {
                text: payload.to_string(),
                error: unavailable(),
            };
        };
        match skill.speak(payload) {
            Ok(handle) => Turn::Spoken {
                handle,
                confirmation: SpeakSkill::confirmation(payload),
            },
            Err(error) => {
                warn!("Speak failed: {error}");
                Turn::NotSpoken {
                    text: payload.to_string(),
                    error,
                }
            }
        }
    }

    async fn ask(&self, request: &str, speak_reply: bool) -> Turn {
        let text = match self.pipeline.respond(request).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Pipeline failed: {e}");
                return Turn::PipelineFailed(e);
            }
        };

        // The flag as of submission governs: turning speech mode off while
        // the pipeline was running keeps this reply silent.
        let speech = if !speak_reply || !self.speech_mode.get() {
            ReplySpeech::Off
        } else {
            match &self.skill {
                None => ReplySpeech::Failed(unavailable()),
                Some(skill) => match skill.speak_reply(&text) {
                    Ok(handle) => ReplySpeech::Queued(handle),
                    Err(e) => {
                        warn!("Could not speak reply: {e}");
                        ReplySpeech::Failed(e)
                    }
                },
            }
        };
        Turn::Reply { text, speech }
    }

    fn run_command(&self, command: Command) -> Turn {
        match command {
            Command::SpeechMode(change) => {
                let available = self.speech_available();
                let enabled = if available {
                    self.speech_mode.apply(change)
                } else {
                    // No engine: speech mode cannot be turned on.
                    self.speech_mode.set(false);
                    false
                };
                info!("Speech mode {}", if enabled { "on" } else { "off" });
                Turn::SpeechMode { enabled, available }
            }
            Command::StopSpeaking => Turn::Stopped {
                cancelled: self.skill.as_ref().map_or(0, |s| s.controller().cancel_all()),
            },
            Command::Configure(options) => match &self.skill {
                None => Turn::Rejected(unavailable()),
                Some(skill) => match skill.controller().configure(&options) {
                    Ok(settings) => Turn::Configured(settings),
                    Err(e) => Turn::Rejected(e),
                },
            },
            Command::InvalidSetting(message) => Turn::Rejected(SpeechError::InvalidConfig(message)),
            Command::Exit => Turn::Exit,
        }
    }

    fn barge_in(&self) {
        if !self.barge_in {
            return;
        }
        if let Some(skill) = &self.skill {
            if !skill.controller().is_idle() {
                let n = skill.controller().cancel_all();
                debug!("Barge-in cancelled {n} utterance(s)");
            }
        }
    }

    /// Serve `lines` until input ends, a turn returns `Exit`, `on_turn`
    /// returns false, or `interrupt` resolves. `interrupt` is honored while
    /// waiting for input and while a turn is running. Releases the engine
    /// before returning.
    pub async fn serve<F>(&self, mut lines: mpsc::Receiver<String>, interrupt: F, mut on_turn: impl FnMut(Turn) -> bool)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(interrupt);
        loop {
            let line = tokio::select! {
                _ = &mut interrupt => {
                    info!("Interrupted");
                    break;
                }
                line = lines.recv() => line,
            };
            let Some(line) = line else {
                debug!("Input closed");
                break;
            };

            let turn = tokio::select! {
                _ = &mut interrupt => {
                    info!("Interrupted");
                    break;
                }
                turn = self.handle(&line) => turn,
            };
            let exit = matches!(turn, Turn::Exit);
            if !on_turn(turn) || exit {
                break;
            }
        }

        info!("Shutting down");
        self.shutdown();
    }

    /// Stop speech and release the engine.
    pub fn shutdown(&self) {
        if let Some(skill) = &self.skill {
            skill.controller().cancel_all();
            skill.controller().shutdown();
        }
    }
}

/// Read lines from `reader` on a dedicated thread.
///
/// The thread blocks in `read` and is never joined, so a pending read
/// cannot hold up shutdown. The channel closes at end of input, on a read
/// error, or once the receiver is dropped and the next line arrives.
pub fn spawn_line_reader<R>(reader: R) -> std::io::Result<mpsc::Receiver<String>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    std::thread::Builder::new()
        .name("line-reader".into())
        .spawn(move || {
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Input read failed: {e}");
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

fn unavailable() -> SpeechError {
    SpeechError::EngineUnavailable("speech output is not available".into())
}
