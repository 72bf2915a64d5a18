//! kite-speech: speech routing and playback for a conversational assistant.
//!
//! Requests are classified by [`router`], spoken through the [`speaker`]
//! playback controller on top of a [`tts`] engine session, or answered by a
//! [`pipeline`]. [`assistant`] ties the three together per request.

pub mod assistant;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod router;
pub mod speaker;
pub mod tts;

pub use error::{PipelineError, Result, SpeechError};
