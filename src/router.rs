//! Request classification: speech command, control command or pipeline query.
//!
//! Precedence:
//! 1. control commands and explicit speech phrasings ("say X", "read X aloud")
//! 2. everything else goes to the pipeline; with speech mode on, the reply
//!    is spoken afterwards
//!
//! A speech phrasing with nothing to say is `Ambiguous` and is handled as a
//! pipeline query, so user input is never dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::tts::VoiceOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeChange {
    On,
    Off,
    Toggle,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SpeechMode(ModeChange),
    /// Barge-in: clear the queue and stop playback.
    StopSpeaking,
    Configure(VoiceOptions),
    /// A `set ...` command whose value could not be parsed.
    InvalidSetting(String),
    Exit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteTarget {
    Speak { payload: String },
    Pipeline,
    Ambiguous,
    Command(Command),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub target: RouteTarget,
    pub matched_pattern: Option<&'static str>,
    pub confidence: f32,
    /// The pipeline's reply should be forwarded to the speak skill.
    pub speak_reply: bool,
}

/// Lifecycle of one request through the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Classified,
    Dispatched,
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Received => write!(f, "RECEIVED"),
            Self::Classified => write!(f, "CLASSIFIED"),
            Self::Dispatched => write!(f, "DISPATCHED"),
        }
    }
}

/// Session-scoped speech-mode flag, read before every dispatch.
#[derive(Debug, Clone, Default)]
pub struct SpeechMode(Arc<AtomicBool>);

impl SpeechMode {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }

    /// Apply a change and return the new value.
    pub fn apply(&self, change: ModeChange) -> bool {
        match change {
            ModeChange::On => self.set(true),
            ModeChange::Off => self.set(false),
            ModeChange::Toggle => {
                self.0.fetch_xor(true, Ordering::SeqCst);
            }
        }
        self.get()
    }
}

enum Shape {
    /// Leading words, payload after.
    Prefix(&'static [&'static str]),
    /// Leading and trailing words, payload between.
    Wrapped(&'static [&'static str], &'static [&'static str]),
}

struct SpeechPattern {
    name: &'static str,
    shape: Shape,
    confidence: f32,
}

const SPEECH_PATTERNS: &[SpeechPattern] = &[
    SpeechPattern {
        name: "read aloud <text>",
        shape: Shape::Prefix(&["read", "aloud"]),
        confidence: 0.95,
    },
    SpeechPattern {
        name: "read <text> aloud",
        shape: Shape::Wrapped(&["read"], &["aloud"]),
        confidence: 0.85,
    },
    SpeechPattern {
        name: "say <text>",
        shape: Shape::Prefix(&["say"]),
        confidence: 0.95,
    },
    SpeechPattern {
        name: "speak <text>",
        shape: Shape::Prefix(&["speak"]),
        confidence: 0.95,
    },
];

fn control_phrase(phrase: &str) -> Option<(&'static str, Command)> {
    let (name, command) = match phrase {
        "enable speech" | "speech on" | "turn on speech" => ("enable speech", Command::SpeechMode(ModeChange::On)),
        "disable speech" | "speech off" | "turn off speech" => {
            ("disable speech", Command::SpeechMode(ModeChange::Off))
        }
        "speech toggle" | "toggle speech" => ("toggle speech", Command::SpeechMode(ModeChange::Toggle)),
        "stop" | "stop talking" | "stop speaking" | "be quiet" | "quiet" | "shut up" | "silence" => {
            ("stop", Command::StopSpeaking)
        }
        "exit" | "quit" => ("exit", Command::Exit),
        _ => return None,
    };
    Some((name, command))
}

const AMBIGUOUS_CONFIDENCE: f32 = 0.5;
const PIPELINE_CONFIDENCE: f32 = 0.9;

/// Classify one request given the current speech-mode flag.
pub fn route(input: &str, speech_mode: bool) -> RouteDecision {
    let words: Vec<&str> = input.split_whitespace().collect();
    let lowered: Vec<String> = words.iter().map(|w| normalize_word(w)).collect();

    if let Some((name, command)) = match_control(&lowered, &words) {
        return RouteDecision {
            target: RouteTarget::Command(command),
            matched_pattern: Some(name),
            confidence: 1.0,
            speak_reply: false,
        };
    }

    for pattern in SPEECH_PATTERNS {
        let Some(payload) = match_shape(&pattern.shape, &lowered, &words) else {
            continue;
        };
        let payload = unquote(&payload);
        if payload.is_empty() {
            return RouteDecision {
                target: RouteTarget::Ambiguous,
                matched_pattern: Some(pattern.name),
                confidence: AMBIGUOUS_CONFIDENCE,
                speak_reply: speech_mode,
            };
        }
        return RouteDecision {
            target: RouteTarget::Speak {
                payload: payload.to_string(),
            },
            matched_pattern: Some(pattern.name),
            confidence: pattern.confidence,
            speak_reply: false,
        };
    }

    RouteDecision {
        target: RouteTarget::Pipeline,
        matched_pattern: None,
        confidence: PIPELINE_CONFIDENCE,
        speak_reply: speech_mode,
    }
}

/// Lowercase and drop trailing punctuation ("Say:" → "say", "stop!" → "stop").
fn normalize_word(word: &str) -> String {
    word.trim_end_matches([':', ',', '.', '!', '?']).to_lowercase()
}

fn match_control(lowered: &[String], words: &[&str]) -> Option<(&'static str, Command)> {
    if let Some(found) = control_phrase(&lowered.join(" ")) {
        return Some(found);
    }

    if lowered.first().map(String::as_str) != Some("set") || lowered.len() < 2 {
        return None;
    }
    let value = words[2..].join(" ");
    let command = match lowered[1].as_str() {
        "rate" | "speed" => Some(parse_rate(&value)),
        "volume" => Some(parse_volume(&value)),
        "voice" => Some(if value.is_empty() {
            Command::InvalidSetting("set voice needs a voice name".into())
        } else {
            Command::Configure(VoiceOptions {
                voice: Some(value),
                ..VoiceOptions::default()
            })
        }),
        _ => None,
    }?;
    let name = match lowered[1].as_str() {
        "volume" => "set volume <0.0-1.0>",
        "voice" => "set voice <name>",
        _ => "set rate <wpm>",
    };
    Some((name, command))
}

fn parse_rate(value: &str) -> Command {
    match value.trim().parse::<u32>() {
        Ok(rate) => Command::Configure(VoiceOptions {
            rate: Some(rate),
            ..VoiceOptions::default()
        }),
        Err(_) => Command::InvalidSetting(format!("rate must be whole words per minute, got '{value}'")),
    }
}

fn parse_volume(value: &str) -> Command {
    let value = value.trim();
    let parsed = match value.strip_suffix('%') {
        Some(percent) => percent.trim().parse::<f32>().map(|p| p / 100.0),
        None => value.parse::<f32>(),
    };
    match parsed {
        Ok(volume) => Command::Configure(VoiceOptions {
            volume: Some(volume),
            ..VoiceOptions::default()
        }),
        Err(_) => Command::InvalidSetting(format!("volume must be a number from 0.0 to 1.0, got '{value}'")),
    }
}

/// Payload words (original case) for `shape`, or `None` if it doesn't match.
fn match_shape(shape: &Shape, lowered: &[String], words: &[&str]) -> Option<String> {
    match shape {
        Shape::Prefix(prefix) => {
            if lowered.len() < prefix.len() || !starts_with(lowered, prefix) {
                return None;
            }
            Some(words[prefix.len()..].join(" "))
        }
        Shape::Wrapped(prefix, suffix) => {
            if lowered.len() < prefix.len() + suffix.len() || !starts_with(lowered, prefix) {
                return None;
            }
            let tail = &lowered[lowered.len() - suffix.len()..];
            if tail.iter().zip(suffix.iter()).any(|(w, s)| w != s) {
                return None;
            }
            Some(words[prefix.len()..words.len() - suffix.len()].join(" "))
        }
    }
}

fn starts_with(lowered: &[String], prefix: &[&str]) -> bool {
    lowered.iter().zip(prefix.iter()).all(|(w, p)| w == p)
}

/// Strip one pair of matching quotes around the whole payload.
fn unquote(payload: &str) -> &str {
    let payload = payload.trim();
    for (open, close) in [('"', '"'), ('\'', '\''), ('“', '”')] {
        if let Some(inner) = payload.strip_prefix(open).and_then(|p| p.strip_suffix(close)) {
            return inner.trim();
        }
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speak_payload(decision: &RouteDecision) -> Option<&str> {
        match &decision.target {
            RouteTarget::Speak { payload } => Some(payload.as_str()),
            _ => None,
        }
    }

    #[test]
    fn say_extracts_payload() {
        let decision = route("say hello world", false);
        assert_eq!(speak_payload(&decision), Some("hello world"));
        assert_eq!(decision.matched_pattern, Some("say <text>"));
        assert!(!decision.speak_reply);
    }

    #[test]
    fn matching_is_case_insensitive_and_normalizes_whitespace() {
        let decision = route("  SAY   Hello\tThere  ", false);
        assert_eq!(speak_payload(&decision), Some("Hello There"));
        let decision = route("Speak: good morning", true);
        assert_eq!(speak_payload(&decision), Some("good morning"));
    }

    #[test]
    fn read_aloud_variants() {
        assert_eq!(speak_payload(&route("read this sentence aloud", false)), Some("this sentence"));
        assert_eq!(speak_payload(&route("Read aloud the news", false)), Some("the news"));
        assert_eq!(speak_payload(&route("read the book", false)), None);
    }

    #[test]
    fn quoted_payload_is_unwrapped() {
        assert_eq!(speak_payload(&route("say \"hi there\"", false)), Some("hi there"));
        assert_eq!(route("say \"\"", false).target, RouteTarget::Ambiguous);
    }

    #[test]
    fn empty_payload_is_ambiguous() {
        let decision = route("say ", false);
        assert_eq!(decision.target, RouteTarget::Ambiguous);
        assert_eq!(decision.matched_pattern, Some("say <text>"));
        assert!(decision.confidence < PIPELINE_CONFIDENCE);
        assert!(route("read aloud", true).speak_reply);
    }

    #[test]
    fn plain_text_goes_to_pipeline() {
        let decision = route("hello world", false);
        assert_eq!(decision.target, RouteTarget::Pipeline);
        assert!(!decision.speak_reply);
        assert!(route("hello world", true).speak_reply);
        assert_eq!(route("saying goodbye", false).target, RouteTarget::Pipeline);
    }

    #[test]
    fn mode_commands() {
        assert_eq!(
            route("Enable speech", false).target,
            RouteTarget::Command(Command::SpeechMode(ModeChange::On))
        );
        assert_eq!(
            route("speech off", true).target,
            RouteTarget::Command(Command::SpeechMode(ModeChange::Off))
        );
        assert_eq!(
            route("speech toggle", true).target,
            RouteTarget::Command(Command::SpeechMode(ModeChange::Toggle))
        );
    }

    #[test]
    fn stop_and_exit_commands() {
        assert_eq!(route("Stop!", false).target, RouteTarget::Command(Command::StopSpeaking));
        assert_eq!(route("be quiet", false).target, RouteTarget::Command(Command::StopSpeaking));
        assert_eq!(route("quit", false).target, RouteTarget::Command(Command::Exit));
        assert_eq!(route("stop the car", false).target, RouteTarget::Pipeline);
    }

    #[test]
    fn set_commands() {
        let RouteTarget::Command(Command::Configure(options)) = route("set rate 200", false).target else {
            panic!("expected configure");
        };
        assert_eq!(options.rate, Some(200));

        let RouteTarget::Command(Command::Configure(options)) = route("set volume 40%", false).target else {
            panic!("expected configure");
        };
        assert_eq!(options.volume, Some(0.4));

        let RouteTarget::Command(Command::Configure(options)) = route("set voice English_(Great_Britain)", false).target
        else {
            panic!("expected configure");
        };
        assert_eq!(options.voice.as_deref(), Some("English_(Great_Britain)"));

        assert!(matches!(
            route("set rate fast", false).target,
            RouteTarget::Command(Command::InvalidSetting(_))
        ));
        assert!(matches!(
            route("set voice", false).target,
            RouteTarget::Command(Command::InvalidSetting(_))
        ));
        assert_eq!(route("set the table", false).target, RouteTarget::Pipeline);
    }

    #[test]
    fn speech_mode_flag() {
        let mode = SpeechMode::new(false);
        assert!(mode.apply(ModeChange::Toggle));
        assert!(!mode.apply(ModeChange::Toggle));
        assert!(mode.apply(ModeChange::On));
        assert!(!mode.apply(ModeChange::Off));
        let shared = mode.clone();
        shared.set(true);
        assert!(mode.get());
    }
}
