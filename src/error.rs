//! Error types for speech routing and playback.

/// Errors raised by the engine adapter, playback controller and speak skill.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpeechError {
    /// No usable speech engine could be acquired.
    #[error("speech engine unavailable: {0}")]
    EngineUnavailable(String),

    /// An engine session is already live for this factory.
    #[error("speech engine already initialized")]
    AlreadyInitialized,

    /// Text handed to the engine was unusable (empty after preparation).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The speak skill was asked to speak nothing.
    #[error("nothing to speak: text is empty")]
    EmptyInput,

    /// The engine could not synthesize a chunk.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Synthesized audio could not be played.
    #[error("playback error: {0}")]
    Playback(String),

    /// A configuration change was rejected; prior configuration is kept.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl SpeechError {
    /// Lifecycle errors are fatal for speech output; everything else only
    /// affects the current request or utterance.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::EngineUnavailable(_) | Self::AlreadyInitialized)
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SpeechError>;

/// Errors from the downstream reply pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline unreachable: {0}")]
    Unreachable(String),

    #[error("pipeline returned status {0}")]
    Status(u16),

    #[error("malformed pipeline response: {0}")]
    Malformed(String),

    #[error("pipeline returned an empty reply")]
    Empty,
}
