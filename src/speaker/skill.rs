//! Speak skill: validates text and hands it to the playback controller.

use std::sync::Arc;

use super::controller::{PlaybackController, Priority, Source, UtteranceHandle, UtteranceStatus};
use crate::error::{Result, SpeechError};

const CONFIRMATION_CHARS: usize = 100;

#[derive(Clone)]
pub struct SpeakSkill {
    controller: Arc<PlaybackController>,
}

impl SpeakSkill {
    pub fn new(controller: Arc<PlaybackController>) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Arc<PlaybackController> {
        &self.controller
    }

    /// Queue `text` behind anything already waiting.
    pub fn speak(&self, text: &str) -> Result<UtteranceHandle> {
        self.submit(text, Priority::Normal, Source::Speak)
    }

    /// Stop a Normal utterance that is playing and say `text` next.
    pub fn interrupt_speak(&self, text: &str) -> Result<UtteranceHandle> {
        self.submit(text, Priority::Interrupt, Source::Interrupt)
    }

    /// Speak a generated reply.
    pub fn speak_reply(&self, text: &str) -> Result<UtteranceHandle> {
        self.submit(text, Priority::Normal, Source::Reply)
    }

    pub fn submit(&self, text: &str, priority: Priority, source: Source) -> Result<UtteranceHandle> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SpeechError::EmptyInput);
        }
        self.controller.submit_from(text, priority, source)
    }

    /// Speak and suspend the calling task until the utterance is terminal.
    ///
    /// Other callers' utterances keep playing meanwhile.
    pub async fn speak_and_wait(&self, text: &str) -> Result<UtteranceStatus> {
        let mut handle = self.speak(text)?;
        Ok(handle.wait().await)
    }

    /// One-line confirmation of what was spoken, truncated for display.
    pub fn confirmation(text: &str) -> String {
        let text = text.trim();
        let preview: String = text.chars().take(CONFIRMATION_CHARS).collect();
        let ellipsis = if text.chars().count() > CONFIRMATION_CHARS { "..." } else { "" };
        format!("[Spoke] {preview}{ellipsis}")
    }
}
