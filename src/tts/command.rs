//! Platform speech commands as a backend.
//!
//! Prefers espeak-ng (Linux), then `say` (macOS), then speech-dispatcher's
//! `spd-say`. Each chunk runs one child process; the process is polled so a
//! raised stop signal kills it mid-chunk.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{SpeechBackend, StopSignal, VoiceSettings};
use crate::error::{Result, SpeechError};

const POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Program {
    Espeak,
    Say,
    SpdSay,
}

impl Program {
    const SEARCH: [(&'static str, Program); 4] = [
        ("espeak-ng", Program::Espeak),
        ("espeak", Program::Espeak),
        ("say", Program::Say),
        ("spd-say", Program::SpdSay),
    ];
}

pub struct CommandBackend {
    program: Program,
    bin: PathBuf,
    voices: Vec<String>,
}

impl CommandBackend {
    /// Find the first supported speech command on `PATH`.
    pub fn detect() -> Option<Self> {
        Program::SEARCH.iter().find_map(|(name, program)| {
            let bin = which::which(name).ok()?;
            info!("Detected speech command {}", bin.display());
            Some(Self::with_program(*program, bin))
        })
    }

    pub fn with_program(program: Program, bin: PathBuf) -> Self {
        let voices = list_voices(program, &bin);
        debug!("{} reports {} voices", bin.display(), voices.len());
        Self {
            program,
            bin,
            voices,
        }
    }

    fn command(&self, chunk: &str, settings: &VoiceSettings) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.args(speak_args(self.program, chunk, settings))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }

    fn silence_dispatcher(&self) {
        if self.program == Program::SpdSay {
            // Killing spd-say leaves the speech-dispatcher daemon talking.
            if let Err(e) = Command::new(&self.bin).arg("-C").status() {
                warn!("Failed to cancel speech-dispatcher: {e}");
            }
        }
    }
}

/// Arguments for speaking `chunk` with `settings`.
pub fn speak_args(program: Program, chunk: &str, settings: &VoiceSettings) -> Vec<String> {
    let mut args = Vec::new();
    match program {
        Program::Espeak => {
            // espeak amplitude is 0..=200 with 100 as normal.
            let amplitude = (settings.volume * 100.0).round() as u32;
            args.extend(["-s".into(), settings.rate.to_string()]);
            args.extend(["-a".into(), amplitude.to_string()]);
            if let Some(voice) = &settings.voice {
                args.extend(["-v".into(), voice.clone()]);
            }
            args.push("--".into());
            args.push(chunk.to_string());
        }
        Program::Say => {
            args.extend(["-r".into(), settings.rate.to_string()]);
            if let Some(voice) = &settings.voice {
                args.extend(["-v".into(), voice.clone()]);
            }
            args.push("--".into());
            args.push(format!("[[volm {:.2}]] {chunk}", settings.volume));
        }
        Program::SpdSay => {
            // spd-say takes -100..=100 for both rate and volume; 200 wpm is 0.
            let rate = ((i64::from(settings.rate) - 200) / 3).clamp(-100, 100);
            let volume = ((settings.volume * 200.0).round() as i64 - 100).clamp(-100, 100);
            args.push("-w".into());
            args.extend(["-r".into(), rate.to_string()]);
            args.extend(["-i".into(), volume.to_string()]);
            if let Some(voice) = &settings.voice {
                args.extend(["-y".into(), voice.clone()]);
            }
            args.push("--".into());
            args.push(chunk.to_string());
        }
    }
    args
}

fn list_voices(program: Program, bin: &Path) -> Vec<String> {
    let arg = match program {
        Program::Espeak => "--voices",
        Program::Say => "-v",
        Program::SpdSay => "-L",
    };
    let mut cmd = Command::new(bin);
    cmd.arg(arg);
    if program == Program::Say {
        cmd.arg("?");
    }
    match cmd.stderr(Stdio::null()).output() {
        Ok(out) if out.status.success() => parse_voices(program, &String::from_utf8_lossy(&out.stdout)),
        Ok(out) => {
            debug!("{} {arg} exited with {}", bin.display(), out.status);
            Vec::new()
        }
        Err(e) => {
            debug!("Cannot list voices from {}: {e}", bin.display());
            Vec::new()
        }
    }
}

/// Parse a voice listing into selectable voice ids.
pub fn parse_voices(program: Program, listing: &str) -> Vec<String> {
    let mut voices = Vec::new();
    for line in listing.lines().skip_while(|l| l.trim().is_empty()) {
        match program {
            // Pty Language Age/Gender VoiceName File Other Languages
            Program::Espeak => {
                let cols: Vec<&str> = line.split_whitespace().collect();
                if cols.first() == Some(&"Pty") || cols.len() < 4 {
                    continue;
                }
                voices.push(cols[1].to_string());
                voices.push(cols[3].to_string());
            }
            // Alex                en_US    # Most people recognize me by my voice.
            Program::Say => {
                let Some((head, _)) = line.split_once('#') else {
                    continue;
                };
                let mut words: Vec<&str> = head.split_whitespace().collect();
                // Last column is the locale.
                if words.len() >= 2 {
                    words.pop();
                    voices.push(words.join(" "));
                }
            }
            // NAME  LANGUAGE  VARIANT
            Program::SpdSay => {
                let Some(name) = line.split_whitespace().next() else {
                    continue;
                };
                if name != "NAME" {
                    voices.push(name.to_string());
                }
            }
        }
    }
    voices.sort();
    voices.dedup();
    voices
}

impl SpeechBackend for CommandBackend {
    fn name(&self) -> &str {
        match self.program {
            Program::Espeak => "espeak",
            Program::Say => "say",
            Program::SpdSay => "spd-say",
        }
    }

    fn voices(&self) -> Vec<String> {
        self.voices.clone()
    }

    fn play(&mut self, chunk: &str, settings: &VoiceSettings, stop: &StopSignal) -> Result<()> {
        let mut child: Child = self
            .command(chunk, settings)
            .spawn()
            .map_err(|e| SpeechError::Synthesis(format!("failed to start {}: {e}", self.bin.display())))?;

        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(()),
                Ok(Some(status)) => {
                    return Err(SpeechError::Playback(format!("{} exited with {status}", self.name())));
                }
                Ok(None) => {}
                Err(e) => return Err(SpeechError::Playback(format!("lost {}: {e}", self.name()))),
            }

            if stop.is_raised() {
                let _ = child.kill();
                let _ = child.wait();
                self.silence_dispatcher();
                debug!("Killed {} mid-chunk", self.name());
                return Ok(());
            }

            std::thread::sleep(POLL);
        }
    }
}
