//! Configuration management for kite-speech.
//!
//! Loads config from YAML files in standard locations. Every section has
//! defaults, so a partial file (or none at all) is fine.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Which speech backend the engine factory should acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Best available: rodio (when compiled in), then a platform command.
    Auto,
    /// Platform speech command (espeak-ng, say, spd-say).
    Command,
    /// espeak-ng synthesis played in-process through rodio.
    Rodio,
    /// No audio; playback is simulated and logged.
    Simulated,
}

impl BackendKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "command" => Some(Self::Command),
            "rodio" => Some(Self::Rodio),
            "simulated" | "silent" => Some(Self::Simulated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub enabled: bool,
    pub backend: BackendKind,
    pub voice: Option<String>,
    pub rate: u32,
    pub volume: f32,
    /// Auto-speak generated replies from the first turn.
    pub speech_mode: bool,
    /// Cancel active speech when new user input arrives.
    pub barge_in: bool,
    pub max_chunk_chars: usize,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendKind::Auto,
            voice: None,
            rate: 200,
            volume: 1.0,
            speech_mode: false,
            barge_in: true,
            max_chunk_chars: 240,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub enabled: bool,
    pub model: String,
    pub host: String,
    pub timeout_secs: u64,
    pub system_prompt: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "llama3.2:3b".into(),
            host: "http://localhost:11434".into(),
            timeout_secs: 60,
            system_prompt: "You are a helpful assistant. Answer briefly and plainly; \
                            your reply may be read aloud."
                .into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8767,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

impl HistoryConfig {
    /// Resolved history directory, if history is enabled and a home exists.
    pub fn resolved_dir(&self) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        self.dir
            .clone()
            .or_else(|| dirs::home_dir().map(|h| h.join(".kite-speech-history")))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub speech: SpeechConfig,
    pub pipeline: PipelineConfig,
    pub api: ApiConfig,
    pub history: HistoryConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./kite.yaml
    /// 2. ~/.config/kite/kite.yaml
    /// 3. /etc/kite/kite.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("kite.yaml")),
                dirs::home_dir().map(|h| h.join(".config/kite/kite.yaml")),
                Some(PathBuf::from("/etc/kite/kite.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::from_yaml(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = Config::from_yaml("speech:\n  rate: 180\n  backend: simulated\n").unwrap();
        assert_eq!(config.speech.rate, 180);
        assert_eq!(config.speech.backend, BackendKind::Simulated);
        assert!(config.speech.enabled);
        assert_eq!(config.speech.max_chunk_chars, 240);
        assert_eq!(config.pipeline.model, "llama3.2:3b");
        assert!(!config.api.enabled);
    }

    #[test]
    fn empty_file_is_default() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.speech.rate, 200);
        assert_eq!(config.api.port, 8767);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/kite.yaml")));
        assert_eq!(config.speech.volume, 1.0);
    }

    #[test]
    fn backend_names() {
        assert_eq!(BackendKind::from_str("AUTO"), Some(BackendKind::Auto));
        assert_eq!(BackendKind::from_str("silent"), Some(BackendKind::Simulated));
        assert_eq!(BackendKind::from_str("festival"), None);
    }

    #[test]
    fn disabled_history_has_no_dir() {
        let history = HistoryConfig {
            enabled: false,
            dir: Some(PathBuf::from("/tmp/x")),
        };
        assert!(history.resolved_dir().is_none());
    }
}
