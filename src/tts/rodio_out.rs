//! espeak-ng synthesis played in-process through rodio.
//!
//! espeak-ng renders each chunk to WAV on stdout; the WAV is decoded and
//! appended to a fresh `Sink` on the default output device. Volume is applied
//! on the sink, and a raised stop signal stops the sink immediately.

use std::io::Cursor;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use rodio::{Decoder, OutputStream, OutputStreamBuilder, Sink};
use tracing::{debug, info};

use super::command::{parse_voices, Program};
use super::{SpeechBackend, StopSignal, VoiceSettings};
use crate::error::{Result, SpeechError};

const POLL: Duration = Duration::from_millis(20);

pub struct RodioBackend {
    espeak: PathBuf,
    voices: Vec<String>,
    // Kept alive for the session; the device closes when it drops.
    output_stream: Option<OutputStream>,
}

impl RodioBackend {
    /// Open the default output device and locate espeak-ng.
    pub fn open() -> Result<Self> {
        let espeak = which::which("espeak-ng")
            .or_else(|_| which::which("espeak"))
            .map_err(|e| SpeechError::EngineUnavailable(format!("espeak-ng not found: {e}")))?;
        let stream = OutputStreamBuilder::open_default_stream()
            .map_err(|e| SpeechError::EngineUnavailable(format!("failed to open audio output: {e}")))?;

        let voices = Command::new(&espeak)
            .arg("--voices")
            .stderr(Stdio::null())
            .output()
            .map(|out| parse_voices(Program::Espeak, &String::from_utf8_lossy(&out.stdout)))
            .unwrap_or_default();
        info!("rodio output open, synthesizing with {}", espeak.display());

        Ok(Self {
            espeak,
            voices,
            output_stream: Some(stream),
        })
    }

    fn synthesize(&self, chunk: &str, settings: &VoiceSettings) -> Result<Vec<u8>> {
        let mut cmd = Command::new(&self.espeak);
        cmd.arg("--stdout").args(["-s", &settings.rate.to_string()]);
        if let Some(voice) = &settings.voice {
            cmd.args(["-v", voice]);
        }
        let out = cmd
            .arg("--")
            .arg(chunk)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| SpeechError::Synthesis(format!("failed to run espeak-ng: {e}")))?;
        if !out.status.success() {
            return Err(SpeechError::Synthesis(format!("espeak-ng exited with {}", out.status)));
        }
        if out.stdout.is_empty() {
            return Err(SpeechError::Synthesis("espeak-ng produced no audio".into()));
        }
        Ok(out.stdout)
    }
}

impl SpeechBackend for RodioBackend {
    fn name(&self) -> &str {
        "rodio"
    }

    fn voices(&self) -> Vec<String> {
        self.voices.clone()
    }

    fn play(&mut self, chunk: &str, settings: &VoiceSettings, stop: &StopSignal) -> Result<()> {
        let wav = self.synthesize(chunk, settings)?;
        if stop.is_raised() {
            return Ok(());
        }

        let stream = self
            .output_stream
            .as_ref()
            .ok_or_else(|| SpeechError::Playback("audio output already released".into()))?;
        let source = Decoder::new(Cursor::new(wav))
            .map_err(|e| SpeechError::Playback(format!("failed to decode speech audio: {e}")))?;

        // rodio 0.21: Sink::connect_new takes &Mixer
        let sink = Sink::connect_new(stream.mixer());
        sink.set_volume(settings.volume);
        sink.append(source);

        loop {
            if sink.empty() {
                return Ok(());
            }
            if stop.is_raised() {
                sink.stop();
                debug!("Stopped rodio sink mid-chunk");
                return Ok(());
            }
            std::thread::sleep(POLL);
        }
    }

    fn release(&mut self) {
        self.output_stream = None;
    }
}
