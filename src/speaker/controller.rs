//! Speech queue and playback controller.
//!
//! One worker thread owns the `EngineSession` and is the only caller of the
//! engine. Callers hand utterances over through a shared queue guarded by a
//! mutex and condvar; `submit` and `cancel` never wait on playback.
//!
//! Queued → Speaking → Completed | Cancelled | Failed
//!
//! Interrupt-priority utterances are always taken before Normal ones and
//! preempt a Normal utterance that is currently speaking.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use chrono::{DateTime, Local};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::history::{HistoryLog, SpeechRecord};
use crate::error::{Result, SpeechError};
use crate::tts::{EngineSession, StopSignal, VoiceOptions, VoiceSettings};

/// Terminal reports kept for `state()` lookups after eviction.
const LEDGER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UtteranceId(u64);

impl UtteranceId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "u{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UtteranceState {
    Queued,
    Speaking,
    Completed,
    Cancelled,
    Failed,
}

impl UtteranceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl std::fmt::Display for UtteranceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "QUEUED"),
            Self::Speaking => write!(f, "SPEAKING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Where an utterance came from; recorded in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Speak,
    Interrupt,
    Reply,
    Api,
}

/// State plus failure/cancellation detail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UtteranceStatus {
    pub state: UtteranceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl UtteranceStatus {
    fn new(state: UtteranceState, detail: Option<String>) -> Self {
        Self { state, detail }
    }
}

/// Caller's view of a submitted utterance.
#[derive(Debug, Clone)]
pub struct UtteranceHandle {
    id: UtteranceId,
    rx: watch::Receiver<UtteranceStatus>,
}

impl UtteranceHandle {
    pub fn id(&self) -> UtteranceId {
        self.id
    }

    pub fn status(&self) -> UtteranceStatus {
        self.rx.borrow().clone()
    }

    pub fn state(&self) -> UtteranceState {
        self.rx.borrow().state
    }

    /// Wait until the utterance reaches a terminal state.
    pub async fn wait(&mut self) -> UtteranceStatus {
        let done = self.rx.wait_for(|s| s.state.is_terminal()).await.map(|s| s.clone()).ok();
        // Sender gone: whatever was last published is final.
        done.unwrap_or_else(|| self.rx.borrow().clone())
    }

    /// Wait until the utterance reaches `state` or a terminal state.
    pub async fn wait_for_state(&mut self, state: UtteranceState) -> UtteranceStatus {
        let reached = self
            .rx
            .wait_for(|s| s.state == state || s.state.is_terminal())
            .await
            .map(|s| s.clone())
            .ok();
        reached.unwrap_or_else(|| self.rx.borrow().clone())
    }
}

struct Utterance {
    id: UtteranceId,
    text: String,
    priority: Priority,
    source: Source,
    submitted_at: DateTime<Local>,
    settings: Arc<VoiceSettings>,
    status: watch::Sender<UtteranceStatus>,
}

struct Speaking {
    utterance: Arc<Utterance>,
    started: Instant,
}

#[derive(Default)]
struct QueueState {
    interrupt: VecDeque<Arc<Utterance>>,
    normal: VecDeque<Arc<Utterance>>,
    speaking: Option<Speaking>,
    /// Worker is inside an engine call (possibly finishing a cancelled one).
    engine_busy: bool,
    ledger: VecDeque<(UtteranceId, UtteranceStatus)>,
    shutting_down: bool,
}

impl QueueState {
    fn queued(&self) -> usize {
        self.interrupt.len() + self.normal.len()
    }

    fn remove_queued(&mut self, id: UtteranceId) -> Option<Arc<Utterance>> {
        for queue in [&mut self.interrupt, &mut self.normal] {
            if let Some(pos) = queue.iter().position(|u| u.id == id) {
                return queue.remove(pos);
            }
        }
        None
    }

    /// Move `utt` to a terminal state. Returns the history record, or `None`
    /// when the utterance was already terminal.
    fn finish(
        &mut self,
        utt: &Utterance,
        state: UtteranceState,
        detail: Option<String>,
        playback_ms: f64,
    ) -> Option<SpeechRecord> {
        let status = UtteranceStatus::new(state, detail);
        let changed = utt.status.send_if_modified(|current| {
            if current.state.is_terminal() {
                false
            } else {
                *current = status.clone();
                true
            }
        });
        if !changed {
            return None;
        }

        match state {
            UtteranceState::Failed => warn!(
                "Utterance {} failed: {}",
                utt.id,
                status.detail.as_deref().unwrap_or("unknown error")
            ),
            _ => debug!("Utterance {} → {state}", utt.id),
        }

        if self.ledger.len() == LEDGER_CAPACITY {
            self.ledger.pop_front();
        }
        self.ledger.push_back((utt.id, status.clone()));

        Some(SpeechRecord {
            timestamp: Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            submitted_at: utt.submitted_at.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            utterance: utt.id.raw(),
            source: utt.source,
            chars: utt.text.chars().count(),
            state,
            detail: status.detail,
            playback_ms: playback_ms as i64,
            voice: utt.settings.voice.clone(),
            rate: utt.settings.rate,
        })
    }
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub backend: String,
    pub speaking: Option<UtteranceId>,
    pub queued: usize,
    pub idle: bool,
    pub settings: VoiceSettings,
}

struct Shared {
    queue: Mutex<QueueState>,
    wake: Condvar,
    settings: RwLock<Arc<VoiceSettings>>,
    voices: Vec<String>,
    backend: String,
    stop: StopSignal,
    next_id: AtomicU64,
    /// Feeds the history writer thread; taken on shutdown.
    history: Mutex<Option<mpsc::UnboundedSender<SpeechRecord>>>,
}

impl Shared {
    /// Hand records to the history writer. Never touches the filesystem.
    fn record(&self, records: impl IntoIterator<Item = SpeechRecord>) {
        let history = self.history.lock();
        let Some(tx) = history.as_ref() else {
            return;
        };
        for record in records {
            if tx.send(record).is_err() {
                debug!("History writer gone, dropping record");
                break;
            }
        }
    }
}

/// Single authority over the engine session.
pub struct PlaybackController {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    history_writer: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackController {
    /// Take ownership of `session` and start the worker thread.
    pub fn start(session: EngineSession, history: Option<HistoryLog>) -> Result<Self> {
        let (history_tx, history_writer) = match history {
            Some(log) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let writer = std::thread::Builder::new()
                    .name("speech-history".into())
                    .spawn(move || run_history_writer(log, rx))
                    .map_err(|e| SpeechError::EngineUnavailable(format!("failed to start history writer: {e}")))?;
                (Some(tx), Some(writer))
            }
            None => (None, None),
        };

        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState::default()),
            wake: Condvar::new(),
            settings: RwLock::new(Arc::new(session.settings().clone())),
            voices: session.voices().to_vec(),
            backend: session.backend_name().to_string(),
            stop: session.stop_signal(),
            next_id: AtomicU64::new(1),
            history: Mutex::new(history_tx),
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("speech-worker".into())
            .spawn(move || run_worker(worker_shared, session))
            .map_err(|e| SpeechError::EngineUnavailable(format!("failed to start speech worker: {e}")))?;

        info!("Playback controller started on '{}'", shared.backend);
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
            history_writer: Mutex::new(history_writer),
        })
    }

    /// Enqueue `text` and return immediately.
    pub fn submit(&self, text: &str, priority: Priority) -> Result<UtteranceHandle> {
        let source = match priority {
            Priority::Normal => Source::Speak,
            Priority::Interrupt => Source::Interrupt,
        };
        self.submit_from(text, priority, source)
    }

    pub fn submit_from(&self, text: &str, priority: Priority, source: Source) -> Result<UtteranceHandle> {
        if text.trim().is_empty() {
            return Err(SpeechError::InvalidInput("text is empty".into()));
        }

        let settings = self.shared.settings.read().clone();
        let id = UtteranceId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let (status, rx) = watch::channel(UtteranceStatus::new(UtteranceState::Queued, None));
        let enabled = settings.enabled;
        let utterance = Arc::new(Utterance {
            id,
            text: text.to_string(),
            priority,
            source,
            submitted_at: Local::now(),
            settings,
            status,
        });
        let handle = UtteranceHandle { id, rx };

        let mut records = Vec::new();
        {
            let mut q = self.shared.queue.lock();
            if !enabled || q.shutting_down {
                let reason = if enabled { "controller shut down" } else { "speech disabled" };
                records.extend(q.finish(&utterance, UtteranceState::Cancelled, Some(reason.into()), 0.0));
            } else {
                if priority == Priority::Interrupt {
                    if let Some(current) = q.speaking.take_if(|s| s.utterance.priority == Priority::Normal) {
                        let elapsed = current.started.elapsed().as_secs_f64() * 1000.0;
                        info!("Utterance {id} preempts {}", current.utterance.id);
                        records.extend(q.finish(
                            &current.utterance,
                            UtteranceState::Cancelled,
                            Some(format!("preempted by {id}")),
                            elapsed,
                        ));
                        self.shared.stop.raise();
                    }
                    q.interrupt.push_back(utterance);
                } else {
                    q.normal.push_back(utterance);
                }
                debug!("Utterance {id} queued ({priority:?}, {} waiting)", q.queued());
                self.shared.wake.notify_all();
            }
        }
        self.shared.record(records);
        Ok(handle)
    }

    /// Cancel one utterance. Returns false if it was unknown or already terminal.
    pub fn cancel(&self, id: UtteranceId) -> bool {
        let mut records = Vec::new();
        {
            let mut q = self.shared.queue.lock();
            if let Some(current) = q.speaking.take_if(|s| s.utterance.id == id) {
                let elapsed = current.started.elapsed().as_secs_f64() * 1000.0;
                self.shared.stop.raise();
                records.extend(q.finish(&current.utterance, UtteranceState::Cancelled, None, elapsed));
            } else if let Some(queued) = q.remove_queued(id) {
                records.extend(q.finish(&queued, UtteranceState::Cancelled, None, 0.0));
            }
            self.shared.wake.notify_all();
        }
        let cancelled = !records.is_empty();
        self.shared.record(records);
        cancelled
    }

    /// Clear the queue and stop current playback (barge-in).
    /// Returns how many utterances were cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut records = Vec::new();
        {
            let mut guard = self.shared.queue.lock();
            let q = &mut *guard;
            if let Some(current) = q.speaking.take() {
                let elapsed = current.started.elapsed().as_secs_f64() * 1000.0;
                self.shared.stop.raise();
                records.extend(q.finish(&current.utterance, UtteranceState::Cancelled, None, elapsed));
            }
            let queued: Vec<_> = q.interrupt.drain(..).chain(q.normal.drain(..)).collect();
            for utt in queued {
                records.extend(q.finish(&utt, UtteranceState::Cancelled, None, 0.0));
            }
            self.shared.wake.notify_all();
        }
        let count = records.len();
        if count > 0 {
            info!("Cancelled {count} utterance(s)");
        }
        self.shared.record(records);
        count
    }

    /// Latest known status of `id`, including recently finished utterances.
    pub fn state(&self, id: UtteranceId) -> Option<UtteranceStatus> {
        let q = self.shared.queue.lock();
        if let Some(current) = q.speaking.as_ref().filter(|s| s.utterance.id == id) {
            return Some(current.utterance.status.borrow().clone());
        }
        if let Some(queued) = q.interrupt.iter().chain(q.normal.iter()).find(|u| u.id == id) {
            return Some(queued.status.borrow().clone());
        }
        q.ledger
            .iter()
            .rev()
            .find(|(ledger_id, _)| *ledger_id == id)
            .map(|(_, status)| status.clone())
    }

    /// Nothing queued, nothing speaking, engine not busy.
    pub fn is_idle(&self) -> bool {
        let q = self.shared.queue.lock();
        q.queued() == 0 && q.speaking.is_none() && !q.engine_busy
    }

    pub fn status(&self) -> ControllerStatus {
        let q = self.shared.queue.lock();
        ControllerStatus {
            backend: self.shared.backend.clone(),
            speaking: q.speaking.as_ref().map(|s| s.utterance.id),
            queued: q.queued(),
            idle: q.queued() == 0 && q.speaking.is_none() && !q.engine_busy,
            settings: (**self.shared.settings.read()).clone(),
        }
    }

    /// Current configuration snapshot.
    pub fn settings(&self) -> Arc<VoiceSettings> {
        self.shared.settings.read().clone()
    }

    /// Apply voice options for utterances submitted from now on.
    pub fn configure(&self, options: &VoiceOptions) -> Result<VoiceSettings> {
        let mut current = self.shared.settings.write();
        let next = current.apply(options, &self.shared.voices)?;
        info!(
            "Voice settings: voice={:?} rate={} volume={:.2}",
            next.voice, next.rate, next.volume
        );
        *current = Arc::new(next.clone());
        Ok(next)
    }

    /// Turn speech output on or off for utterances submitted from now on.
    pub fn set_enabled(&self, enabled: bool) {
        let mut current = self.shared.settings.write();
        if current.enabled != enabled {
            *current = Arc::new(VoiceSettings {
                enabled,
                ..(**current).clone()
            });
            info!("Speech output {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    /// Installed voices reported by the engine.
    pub fn voices(&self) -> &[String] {
        &self.shared.voices
    }

    /// Cancel everything, stop the worker and release the engine session.
    pub fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        // Submissions are refused from here on.
        self.shared.queue.lock().shutting_down = true;
        self.cancel_all();
        if worker.join().is_err() {
            warn!("Speech worker panicked during shutdown");
        }
        // Closing the channel lets the writer flush what is left and exit.
        self.shared.history.lock().take();
        if let Some(writer) = self.history_writer.lock().take() {
            if writer.join().is_err() {
                warn!("History writer panicked during shutdown");
            }
        }
        info!("Playback controller stopped");
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: Arc<Shared>, mut session: EngineSession) {
    loop {
        let utterance = {
            let mut q = shared.queue.lock();
            let next = loop {
                if q.shutting_down {
                    break None;
                }
                if let Some(u) = q.interrupt.pop_front().or_else(|| q.normal.pop_front()) {
                    break Some(u);
                }
                shared.wake.wait(&mut q);
            };
            let Some(utterance) = next else {
                break;
            };
            // Only this thread resets the signal, and only while no
            // utterance is marked Speaking.
            shared.stop.reset();
            utterance
                .status
                .send_replace(UtteranceStatus::new(UtteranceState::Speaking, None));
            debug!("Utterance {} → {}", utterance.id, UtteranceState::Speaking);
            q.speaking = Some(Speaking {
                utterance: utterance.clone(),
                started: Instant::now(),
            });
            q.engine_busy = true;
            utterance
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            session.speak_with(&utterance.text, &utterance.settings)
        }));

        let record = {
            let mut q = shared.queue.lock();
            q.engine_busy = false;
            let started = match q.speaking.take_if(|s| s.utterance.id == utterance.id) {
                Some(s) => s.started,
                None => Instant::now(),
            };
            let (state, detail) = match outcome {
                Ok(Ok(result)) if result.cancelled => (UtteranceState::Cancelled, None),
                Ok(Ok(_)) => (UtteranceState::Completed, None),
                Ok(Err(e)) => (UtteranceState::Failed, Some(e.to_string())),
                Err(_) => (UtteranceState::Failed, Some("speech engine panicked".to_string())),
            };
            let playback_ms = started.elapsed().as_secs_f64() * 1000.0;
            shared.wake.notify_all();
            q.finish(&utterance, state, detail, playback_ms)
        };
        shared.record(record);
    }

    session.shutdown();
}

fn run_history_writer(log: HistoryLog, mut rx: mpsc::UnboundedReceiver<SpeechRecord>) {
    while let Some(record) = rx.blocking_recv() {
        log.append(&record);
    }
    debug!("History writer stopped");
}
