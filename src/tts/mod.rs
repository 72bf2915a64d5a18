//! TTS engine adapter: one uniform surface over platform speech engines.
//!
//! Lifecycle:
//! 1. `EngineFactory::initialize` acquires a backend and returns the only
//!    live `EngineSession` for that factory
//! 2. `EngineSession::synthesize_and_play` speaks text chunk by chunk,
//!    checking the stop signal between chunks
//! 3. `EngineSession::shutdown` (or drop) releases the backend and frees the
//!    factory for a later `initialize`

pub mod command;
#[cfg(feature = "rodio")]
pub mod rodio_out;
pub mod simulated;
pub mod text;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{BackendKind, SpeechConfig};
use crate::error::{Result, SpeechError};

pub use command::CommandBackend;
#[cfg(feature = "rodio")]
pub use rodio_out::RodioBackend;
pub use simulated::{PlayLog, PlayedChunk, SimulatedBackend};

pub const MIN_RATE: u32 = 80;
pub const MAX_RATE: u32 = 500;

/// Immutable voice configuration snapshot.
///
/// Utterances capture the snapshot current at submission; changes only ever
/// produce a new snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceSettings {
    pub voice: Option<String>,
    /// Words per minute.
    pub rate: u32,
    /// 0.0 (silent) to 1.0 (full).
    pub volume: f32,
    pub enabled: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            voice: None,
            rate: 200,
            volume: 1.0,
            enabled: true,
        }
    }
}

impl VoiceSettings {
    /// Validate a startup configuration into a snapshot.
    pub fn from_config(config: &SpeechConfig) -> Result<Self> {
        let base = Self {
            enabled: config.enabled,
            ..Self::default()
        };
        base.apply(
            &VoiceOptions {
                voice: config.voice.clone(),
                rate: Some(config.rate),
                volume: Some(config.volume),
            },
            &[],
        )
    }

    /// Produce a new snapshot with `options` applied.
    ///
    /// `installed` lists the voices the engine can use; when it is empty any
    /// non-empty voice name is accepted. On error `self` is untouched.
    pub fn apply(&self, options: &VoiceOptions, installed: &[String]) -> Result<Self> {
        let mut next = self.clone();
        if let Some(rate) = options.rate {
            if !(MIN_RATE..=MAX_RATE).contains(&rate) {
                return Err(SpeechError::InvalidConfig(format!(
                    "rate {rate} outside {MIN_RATE}..={MAX_RATE} words per minute"
                )));
            }
            next.rate = rate;
        }
        if let Some(volume) = options.volume {
            if !volume.is_finite() || !(0.0..=1.0).contains(&volume) {
                return Err(SpeechError::InvalidConfig(format!(
                    "volume {volume} outside 0.0..=1.0"
                )));
            }
            next.volume = volume;
        }
        if let Some(voice) = &options.voice {
            next.voice = Some(resolve_voice(voice, installed)?);
        }
        Ok(next)
    }
}

/// Find an installed voice by exact id/name, falling back to a unique
/// case-insensitive substring match.
fn resolve_voice(requested: &str, installed: &[String]) -> Result<String> {
    let requested = requested.trim();
    if requested.is_empty() {
        return Err(SpeechError::InvalidConfig("voice name is empty".into()));
    }
    if installed.is_empty() {
        return Ok(requested.to_string());
    }
    let wanted = requested.to_lowercase();
    if let Some(exact) = installed.iter().find(|v| v.to_lowercase() == wanted) {
        return Ok(exact.clone());
    }
    let partial: Vec<&String> = installed
        .iter()
        .filter(|v| v.to_lowercase().contains(&wanted))
        .collect();
    match partial.as_slice() {
        [only] => Ok((*only).clone()),
        [] => Err(SpeechError::InvalidConfig(format!("no installed voice matches '{requested}'"))),
        _ => Err(SpeechError::InvalidConfig(format!(
            "voice '{requested}' is ambiguous ({} matches)",
            partial.len()
        ))),
    }
}

/// Requested voice changes. Absent fields keep their current value.
///
/// Deserialization ignores unknown keys so newer callers can send options
/// this version does not know about.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct VoiceOptions {
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub rate: Option<u32>,
    #[serde(default)]
    pub volume: Option<f32>,
}

impl VoiceOptions {
    /// Parse options from a loosely typed JSON object.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        if !value.is_object() {
            return Err(SpeechError::InvalidConfig("options must be an object".into()));
        }
        serde_json::from_value(value.clone())
            .map_err(|e| SpeechError::InvalidConfig(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.voice.is_none() && self.rate.is_none() && self.volume.is_none()
    }
}

/// Cross-thread stop request for whatever the engine is playing.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A platform speech engine binding.
///
/// `play` blocks until `chunk` has been spoken or `stop` is raised. Backends
/// that cannot interrupt mid-chunk may finish the chunk; the session checks
/// the signal again before the next one.
pub trait SpeechBackend: Send {
    fn name(&self) -> &str;

    /// Installed voices, or empty when the engine cannot enumerate them.
    fn voices(&self) -> Vec<String> {
        Vec::new()
    }

    fn play(&mut self, chunk: &str, settings: &VoiceSettings, stop: &StopSignal) -> Result<()>;

    /// Release engine resources. Called exactly once per session.
    fn release(&mut self) {}
}

/// Result of one speak call with timing.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakResult {
    pub cancelled: bool,
    pub chunks_played: usize,
    pub playback_ms: f64,
}

/// Hands out at most one live engine session at a time.
#[derive(Debug, Default)]
pub struct EngineFactory {
    live: Arc<AtomicBool>,
}

impl EngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a session from this factory is currently live.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Acquire the backend named by `config.backend`.
    pub fn initialize(&self, config: &SpeechConfig) -> Result<EngineSession> {
        let settings = VoiceSettings::from_config(config)?;
        self.claim()?;
        let backend = match select_backend(config.backend) {
            Ok(b) => b,
            Err(e) => {
                self.live.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let mut session = self.open(backend, VoiceSettings { voice: None, ..settings }, config.max_chunk_chars);
        if let Some(voice) = &config.voice {
            // Dropping the session on error releases the backend.
            session.configure(&VoiceOptions {
                voice: Some(voice.clone()),
                ..VoiceOptions::default()
            })?;
        }
        Ok(session)
    }

    /// Acquire a session over an already constructed backend.
    pub fn initialize_with(
        &self,
        backend: Box<dyn SpeechBackend>,
        settings: VoiceSettings,
        max_chunk_chars: usize,
    ) -> Result<EngineSession> {
        self.claim()?;
        Ok(self.open(backend, settings, max_chunk_chars))
    }

    fn claim(&self) -> Result<()> {
        self.live
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| SpeechError::AlreadyInitialized)
    }

    fn open(
        &self,
        backend: Box<dyn SpeechBackend>,
        settings: VoiceSettings,
        max_chunk_chars: usize,
    ) -> EngineSession {
        let voices = backend.voices();
        info!(
            "Speech engine '{}' initialized ({} voices, rate {}, volume {:.2})",
            backend.name(),
            voices.len(),
            settings.rate,
            settings.volume
        );
        EngineSession {
            backend,
            settings,
            voices,
            stop: StopSignal::default(),
            max_chunk_chars,
            live: self.live.clone(),
            released: false,
        }
    }
}

fn select_backend(kind: BackendKind) -> Result<Box<dyn SpeechBackend>> {
    match kind {
        BackendKind::Simulated => Ok(Box::new(SimulatedBackend::new())),
        BackendKind::Command => CommandBackend::detect()
            .map(|b| Box::new(b) as Box<dyn SpeechBackend>)
            .ok_or_else(|| {
                SpeechError::EngineUnavailable("no speech command found (tried espeak-ng, espeak, say, spd-say)".into())
            }),
        BackendKind::Rodio => open_rodio(),
        BackendKind::Auto => open_rodio().or_else(|e| {
            debug!("rodio backend unavailable: {e}");
            select_backend(BackendKind::Command)
        }),
    }
}

#[cfg(feature = "rodio")]
fn open_rodio() -> Result<Box<dyn SpeechBackend>> {
    RodioBackend::open().map(|b| Box::new(b) as Box<dyn SpeechBackend>)
}

#[cfg(not(feature = "rodio"))]
fn open_rodio() -> Result<Box<dyn SpeechBackend>> {
    Err(SpeechError::EngineUnavailable("built without the rodio feature".into()))
}

/// The single live handle to a speech engine.
pub struct EngineSession {
    backend: Box<dyn SpeechBackend>,
    settings: VoiceSettings,
    voices: Vec<String>,
    stop: StopSignal,
    max_chunk_chars: usize,
    live: Arc<AtomicBool>,
    released: bool,
}

impl std::fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSession")
            .field("backend", &self.backend.name())
            .field("settings", &self.settings)
            .field("voices", &self.voices.len())
            .finish()
    }
}

impl EngineSession {
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn settings(&self) -> &VoiceSettings {
        &self.settings
    }

    pub fn voices(&self) -> &[String] {
        &self.voices
    }

    /// A clone of the stop signal, usable from any thread.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Speak `text` to completion on the current thread with the session's
    /// own settings. A stop raised before this call does not carry over.
    pub fn synthesize_and_play(&mut self, text: &str) -> Result<SpeakResult> {
        self.stop.reset();
        let settings = self.settings.clone();
        self.speak_with(text, &settings)
    }

    /// Speak `text` with an explicit settings snapshot.
    ///
    /// Unlike `synthesize_and_play` the stop signal is not reset, so a stop
    /// raised just before the call still cancels it.
    pub fn speak_with(&mut self, text: &str, settings: &VoiceSettings) -> Result<SpeakResult> {
        if text.trim().is_empty() {
            return Err(SpeechError::InvalidInput("text is empty".into()));
        }
        let prepared = text::prepare_for_speech(text);
        if prepared.is_empty() {
            return Err(SpeechError::InvalidInput("nothing speakable after cleanup".into()));
        }
        let chunks = text::split_chunks(&prepared, self.max_chunk_chars);

        let t0 = Instant::now();
        let mut played = 0;
        let mut cancelled = false;
        for (i, chunk) in chunks.iter().enumerate() {
            if self.stop.is_raised() {
                cancelled = true;
                debug!("Stopped before chunk {}/{}", i + 1, chunks.len());
                break;
            }
            self.backend.play(chunk, settings, &self.stop)?;
            played += 1;
        }
        if !cancelled && self.stop.is_raised() {
            cancelled = true;
        }

        Ok(SpeakResult {
            cancelled,
            chunks_played: played,
            playback_ms: t0.elapsed().as_secs_f64() * 1000.0,
        })
    }

    /// Halt any in-progress utterance. Never fails.
    pub fn stop(&self) {
        self.stop.raise();
    }

    /// Apply voice/rate/volume for later calls; prior settings are kept on error.
    pub fn configure(&mut self, options: &VoiceOptions) -> Result<()> {
        self.settings = self.settings.apply(options, &self.voices)?;
        debug!("Session settings now {:?}", self.settings);
        Ok(())
    }

    /// Release the engine and free the factory.
    pub fn shutdown(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.stop.raise();
        self.backend.release();
        self.live.store(false, Ordering::SeqCst);
        info!("Speech engine '{}' shut down", self.backend.name());
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        if !self.released {
            warn!("Engine session dropped without shutdown; releasing");
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn simulated() -> Box<dyn SpeechBackend> {
        Box::new(SimulatedBackend::new().with_chunk_duration(Duration::from_millis(1)))
    }

    #[test]
    fn second_initialize_fails_until_shutdown() {
        let factory = EngineFactory::new();
        let session = factory
            .initialize_with(simulated(), VoiceSettings::default(), 240)
            .unwrap();
        assert!(factory.is_live());
        let err = factory
            .initialize_with(simulated(), VoiceSettings::default(), 240)
            .unwrap_err();
        assert_eq!(err, SpeechError::AlreadyInitialized);

        session.shutdown();
        assert!(!factory.is_live());
        let again = factory.initialize_with(simulated(), VoiceSettings::default(), 240);
        assert!(again.is_ok());
    }

    #[test]
    fn drop_releases_the_factory() {
        let factory = EngineFactory::new();
        {
            let _session = factory
                .initialize_with(simulated(), VoiceSettings::default(), 240)
                .unwrap();
        }
        assert!(!factory.is_live());
    }

    #[test]
    fn initialize_from_config_uses_simulated_backend() {
        let factory = EngineFactory::new();
        let config = SpeechConfig {
            backend: BackendKind::Simulated,
            rate: 150,
            ..SpeechConfig::default()
        };
        let session = factory.initialize(&config).unwrap();
        assert_eq!(session.backend_name(), "simulated");
        assert_eq!(session.settings().rate, 150);
        session.shutdown();
    }

    #[test]
    fn invalid_startup_config_does_not_claim_the_factory() {
        let factory = EngineFactory::new();
        let config = SpeechConfig {
            backend: BackendKind::Simulated,
            volume: 3.0,
            ..SpeechConfig::default()
        };
        let err = factory.initialize(&config).unwrap_err();
        assert!(matches!(err, SpeechError::InvalidConfig(_)));
        assert!(!factory.is_live());
    }

    #[test]
    fn empty_text_is_invalid_input() {
        let factory = EngineFactory::new();
        let mut session = factory
            .initialize_with(simulated(), VoiceSettings::default(), 240)
            .unwrap();
        assert!(matches!(
            session.synthesize_and_play("   \n"),
            Err(SpeechError::InvalidInput(_))
        ));
        assert!(matches!(
            session.synthesize_and_play("https://example.com"),
            Err(SpeechError::InvalidInput(_))
        ));
        session.shutdown();
    }

    #[test]
    fn speaks_every_chunk() {
        let backend = SimulatedBackend::new().with_chunk_duration(Duration::from_millis(1));
        let log = backend.log();
        let factory = EngineFactory::new();
        let mut session = factory
            .initialize_with(Box::new(backend), VoiceSettings::default(), 240)
            .unwrap();
        let result = session.synthesize_and_play("First one. Second **two**.").unwrap();
        assert!(!result.cancelled);
        assert_eq!(result.chunks_played, 2);
        assert_eq!(log.texts(), vec!["First one.", "Second two."]);
        session.shutdown();
    }

    #[test]
    fn stale_stop_does_not_cancel_next_call() {
        let factory = EngineFactory::new();
        let mut session = factory
            .initialize_with(simulated(), VoiceSettings::default(), 240)
            .unwrap();
        session.stop();
        session.stop();
        let result = session.synthesize_and_play("hello").unwrap();
        assert!(!result.cancelled);
        session.shutdown();
    }

    #[test]
    fn synthesis_failure_propagates() {
        let backend = SimulatedBackend::new()
            .with_chunk_duration(Duration::from_millis(1))
            .fail_on("glitch", SpeechError::Synthesis("model crashed".into()));
        let factory = EngineFactory::new();
        let mut session = factory
            .initialize_with(Box::new(backend), VoiceSettings::default(), 240)
            .unwrap();
        let err = session.synthesize_and_play("ok. a glitch here.").unwrap_err();
        assert_eq!(err, SpeechError::Synthesis("model crashed".into()));
        session.shutdown();
    }

    #[test]
    fn configure_validates_and_keeps_prior_settings() {
        let backend = SimulatedBackend::new().with_voices(&["en-us", "en-gb", "fr-fr"]);
        let factory = EngineFactory::new();
        let mut session = factory
            .initialize_with(Box::new(backend), VoiceSettings::default(), 240)
            .unwrap();

        session
            .configure(&VoiceOptions {
                voice: Some("FR".into()),
                rate: Some(180),
                volume: Some(0.5),
            })
            .unwrap();
        assert_eq!(session.settings().voice.as_deref(), Some("fr-fr"));
        assert_eq!(session.settings().rate, 180);

        let before = session.settings().clone();
        for bad in [
            VoiceOptions { rate: Some(20), ..Default::default() },
            VoiceOptions { volume: Some(1.5), ..Default::default() },
            VoiceOptions { volume: Some(f32::NAN), ..Default::default() },
            VoiceOptions { voice: Some("en".into()), ..Default::default() },
            VoiceOptions { voice: Some("klingon".into()), ..Default::default() },
            VoiceOptions { rate: Some(220), voice: Some("   ".into()), ..Default::default() },
        ] {
            let err = session.configure(&bad).unwrap_err();
            assert!(matches!(err, SpeechError::InvalidConfig(_)), "{bad:?}");
            assert_eq!(session.settings(), &before);
        }
        session.shutdown();
    }

    #[test]
    fn options_ignore_unknown_keys() {
        let options = VoiceOptions::from_json(&serde_json::json!({
            "rate": 200,
            "pitch": 3,
            "timbre": "warm"
        }))
        .unwrap();
        assert_eq!(options.rate, Some(200));
        assert!(options.voice.is_none());
    }

    #[test]
    fn options_reject_mistyped_values() {
        let err = VoiceOptions::from_json(&serde_json::json!({ "rate": "fast" })).unwrap_err();
        assert!(matches!(err, SpeechError::InvalidConfig(_)));
        let err = VoiceOptions::from_json(&serde_json::json!({ "rate": -5 })).unwrap_err();
        assert!(matches!(err, SpeechError::InvalidConfig(_)));
    }
}
