//! Speech queue, playback and the speak skill.
//!
//! - `controller`: single-worker queue with Normal/Interrupt priority
//! - `skill`: the speak capability exposed to the router
//! - `history`: JSONL utterance history and daily reports
//! - `api`: axum control API for external clients

pub mod api;
pub mod controller;
pub mod history;
pub mod skill;

pub use controller::{
    ControllerStatus, PlaybackController, Priority, Source, UtteranceHandle, UtteranceId, UtteranceState,
    UtteranceStatus,
};
pub use history::{HistoryLog, SpeechRecord};
pub use skill::SpeakSkill;
