//! Run identity and run-id guarded shared output.
//!
//! Every write to observable session state carries the writer's [`RunId`]
//! and is compared against the session's active run under the same lock.
//! Writes from a superseded or cancelled run are dropped silently, even
//! if its task is still unwinding.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lt_domain::tool::Message;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::cancel::CancelToken;
use crate::event::SessionEvent;

/// Monotonic per-session run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RunId(u64);

impl RunId {
    pub fn get(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn for_tests(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A think span as currently known to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThinkSpan {
    pub span_id: usize,
    pub text: String,
    pub complete: bool,
    /// Cancelled before the span closed.
    pub interrupted: bool,
}

/// Point-in-time copy of the shared output.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSnapshot {
    pub active_run: Option<RunId>,
    pub visible_text: String,
    pub think_spans: Vec<ThinkSpan>,
    /// Conversation as shown to the user: hidden turns are omitted.
    pub transcript: Vec<Message>,
}

#[derive(Default)]
struct OutputState {
    last_run: u64,
    snapshot: SessionSnapshot,
}

/// Output shared between the session and its runs.
#[derive(Default)]
pub struct SharedOutput {
    state: Mutex<OutputState>,
}

impl SharedOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate the next run id and make it the only writer. Visible text
    /// and think spans are reset; the transcript is replaced by `history`.
    pub fn begin_run(&self, history: &[Message]) -> RunId {
        let mut st = self.state.lock();
        st.last_run += 1;
        let id = RunId(st.last_run);
        st.snapshot = SessionSnapshot {
            active_run: Some(id),
            visible_text: String::new(),
            think_spans: Vec::new(),
            transcript: visible_messages(history),
        };
        id
    }

    pub fn active_run(&self) -> Option<RunId> {
        self.state.lock().snapshot.active_run
    }

    pub fn is_current(&self, run: RunId) -> bool {
        self.active_run() == Some(run)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.lock().snapshot.clone()
    }

    /// Apply `f` only if `run` is still the active run.
    fn write_if_current(&self, run: RunId, f: impl FnOnce(&mut SessionSnapshot)) -> bool {
        let mut st = self.state.lock();
        if st.snapshot.active_run != Some(run) {
            tracing::trace!(%run, "dropping write from stale run");
            return false;
        }
        f(&mut st.snapshot);
        true
    }
}

fn visible_messages(history: &[Message]) -> Vec<Message> {
    history.iter().filter(|m| !m.hidden).cloned().collect()
}

/// The write side held by one run: shared output plus its event channel.
pub struct RunWriter {
    run_id: RunId,
    shared: Arc<SharedOutput>,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancelToken,
    abandoned: AtomicBool,
}

impl RunWriter {
    pub fn new(
        run_id: RunId,
        shared: Arc<SharedOutput>,
        events: mpsc::Sender<SessionEvent>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            run_id,
            shared,
            events,
            cancel,
            abandoned: AtomicBool::new(false),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn is_current(&self) -> bool {
        self.shared.is_current(self.run_id)
    }

    /// The consumer dropped its event receiver.
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire) || self.events.is_closed()
    }

    pub fn append_visible(&self, text: &str) -> bool {
        self.shared
            .write_if_current(self.run_id, |s| s.visible_text.push_str(text))
    }

    pub fn update_think(&self, span_id: usize, delta: &str, complete: bool) -> bool {
        self.shared.write_if_current(self.run_id, |s| {
            match s.think_spans.iter_mut().find(|t| t.span_id == span_id) {
                Some(span) => {
                    span.text.push_str(delta);
                    span.complete |= complete;
                }
                None => s.think_spans.push(ThinkSpan {
                    span_id,
                    text: delta.to_string(),
                    complete,
                    interrupted: false,
                }),
            }
        })
    }

    pub fn interrupt_think(&self, span_ids: &[usize]) -> bool {
        self.shared.write_if_current(self.run_id, |s| {
            for span in s.think_spans.iter_mut().filter(|t| span_ids.contains(&t.span_id)) {
                span.interrupted = true;
            }
        })
    }

    pub fn set_transcript(&self, history: &[Message]) -> bool {
        self.shared
            .write_if_current(self.run_id, |s| s.transcript = visible_messages(history))
    }

    /// Deliver an event if this run is still current. A closed receiver
    /// marks the run abandoned.
    ///
    /// Waiting for channel capacity never outlives cancellation: once the
    /// run is cancelled, an event that does not fit is dropped.
    pub async fn emit(&self, event: SessionEvent) {
        if !self.is_current() {
            return;
        }
        let event = match self.events.try_send(event) {
            Ok(()) => return,
            Err(TrySendError::Closed(_)) => {
                self.abandoned.store(true, Ordering::Release);
                return;
            }
            Err(TrySendError::Full(event)) => event,
        };
        tokio::select! {
            biased;
            sent = self.events.send(event) => {
                if sent.is_err() {
                    self.abandoned.store(true, Ordering::Release);
                }
            }
            _ = self.cancel.cancelled() => {
                tracing::debug!(run = %self.run_id, "event channel full after cancel, dropping event");
            }
        }
    }

    /// Terminal events are delivered even after supersession so the
    /// consumer of this run always learns how it ended.
    pub async fn emit_terminal(&self, event: SessionEvent) {
        let _ = self.events.send(event).await;
    }
}
