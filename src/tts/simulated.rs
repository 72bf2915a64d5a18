//! Simulated speech backend: no audio device, realistic timing.
//!
//! Each chunk "plays" for as long as it would take to say at the configured
//! rate (or a fixed duration when one is set), honouring the stop signal.
//! Every chunk is recorded in a shared [`PlayLog`], which also tracks how
//! many chunks were ever playing at the same time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

use super::{SpeechBackend, StopSignal, VoiceSettings};
use crate::error::{Result, SpeechError};

const POLL: Duration = Duration::from_millis(5);

/// One chunk handed to the simulated engine.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayedChunk {
    pub text: String,
    pub voice: Option<String>,
    pub rate: u32,
    pub volume: f32,
    pub interrupted: bool,
}

#[derive(Debug, Default)]
struct LogInner {
    chunks: Mutex<Vec<PlayedChunk>>,
    started: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

/// Shared record of what the simulated engine played.
#[derive(Debug, Clone, Default)]
pub struct PlayLog(Arc<LogInner>);

impl PlayLog {
    /// Chunks that finished or were interrupted, in order.
    pub fn chunks(&self) -> Vec<PlayedChunk> {
        self.0.chunks.lock().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.0.chunks.lock().iter().map(|c| c.text.clone()).collect()
    }

    /// Chunks in the order playback started, including one still playing.
    pub fn started(&self) -> Vec<String> {
        self.0.started.lock().clone()
    }

    /// Highest number of chunks that were ever playing at once.
    pub fn max_concurrent(&self) -> usize {
        self.0.max_active.load(Ordering::SeqCst)
    }
}

pub struct SimulatedBackend {
    log: PlayLog,
    chunk_duration: Option<Duration>,
    failure: Option<(String, SpeechError)>,
    voices: Vec<String>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            log: PlayLog::default(),
            chunk_duration: None,
            failure: None,
            voices: Vec::new(),
        }
    }

    /// Play every chunk for exactly `duration` instead of deriving it.
    pub fn with_chunk_duration(mut self, duration: Duration) -> Self {
        self.chunk_duration = Some(duration);
        self
    }

    /// Fail any chunk containing `marker` with `error`.
    pub fn fail_on(mut self, marker: &str, error: SpeechError) -> Self {
        self.failure = Some((marker.to_string(), error));
        self
    }

    pub fn with_voices(mut self, voices: &[&str]) -> Self {
        self.voices = voices.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn log(&self) -> PlayLog {
        self.log.clone()
    }

    fn duration_for(&self, chunk: &str, rate: u32) -> Duration {
        if let Some(d) = self.chunk_duration {
            return d;
        }
        let words = chunk.split_whitespace().count().max(1) as f64;
        Duration::from_secs_f64(words * 60.0 / f64::from(rate.max(1)))
    }
}

impl SpeechBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn voices(&self) -> Vec<String> {
        self.voices.clone()
    }

    fn play(&mut self, chunk: &str, settings: &VoiceSettings, stop: &StopSignal) -> Result<()> {
        if let Some((marker, error)) = &self.failure {
            if chunk.contains(marker.as_str()) {
                return Err(error.clone());
            }
        }

        let inner = &self.log.0;
        let now_active = inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_active.fetch_max(now_active, Ordering::SeqCst);
        inner.started.lock().push(chunk.to_string());
        info!("(simulated speech) {chunk}");

        let deadline = Instant::now() + self.duration_for(chunk, settings.rate);
        let mut interrupted = false;
        while Instant::now() < deadline {
            if stop.is_raised() {
                interrupted = true;
                break;
            }
            std::thread::sleep(POLL.min(deadline.saturating_duration_since(Instant::now())));
        }

        inner.active.fetch_sub(1, Ordering::SeqCst);
        inner.chunks.lock().push(PlayedChunk {
            text: chunk.to_string(),
            voice: settings.voice.clone(),
            rate: settings.rate,
            volume: settings.volume,
            interrupted,
        });
        Ok(())
    }
}
