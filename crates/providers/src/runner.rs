//! Bridge from a blocking, callback-driven native runtime to the async
//! [`TokenSource`] contract.
//!
//! Native runtimes generate on their own thread and report progress via
//! callbacks (`on_token`, `on_done`, `on_error`). The bridge runs the
//! blocking call on the tokio blocking pool and forwards callbacks through
//! an unbounded channel. Dropping the stream before it finishes asks the
//! runtime to stop. The blocking task is tracked until it returns, so
//! [`TokenSource::drain`] and the next `generate` or `unload` wait for a
//! runtime that is slow to unwind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lt_domain::error::{Error, Result};
use lt_domain::stream::TokenStream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::traits::{GenerationRequest, RenderedPrompt, TokenSource};

/// A native model runtime with a blocking, callback-based API.
pub trait NativeRunner: Send + Sync + 'static {
    /// Generate from `prompt`, reporting through `sink`. Blocks until the
    /// generation finishes, fails, or is cancelled.
    fn generate(&self, prompt: &str, max_tokens: Option<u32>, sink: RunnerSink);

    /// Request cancellation of any in-flight generation. Safe to call
    /// from any thread.
    fn cancel_current(&self);

    /// Release the model. Never called while a generation is active.
    fn unload(&self);

    fn runner_id(&self) -> &str;
}

/// Callback sink handed to [`NativeRunner::generate`].
pub struct RunnerSink {
    tx: mpsc::UnboundedSender<Result<String>>,
    backend: String,
}

impl RunnerSink {
    /// Report one decoded piece. Returns `false` once the consumer is
    /// gone; the runner should stop generating.
    pub fn on_token(&self, token: &str) -> bool {
        self.tx.send(Ok(token.to_string())).is_ok()
    }

    /// Report normal completion.
    pub fn on_done(self) {}

    /// Report a failure. Messages such as "prefill aborted" are treated as
    /// the transient backend race by the session engine.
    pub fn on_error(self, message: impl Into<String>) {
        let _ = self.tx.send(Err(Error::Backend {
            backend: self.backend,
            message: message.into(),
        }));
    }
}

/// Cancels the runner if the stream is dropped before it finished.
struct CancelOnDrop<R: NativeRunner> {
    runner: Arc<R>,
    armed: AtomicBool,
}

impl<R: NativeRunner> CancelOnDrop<R> {
    fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }
}

impl<R: NativeRunner> Drop for CancelOnDrop<R> {
    fn drop(&mut self) {
        if self.armed.load(Ordering::Acquire) {
            tracing::debug!(runner = self.runner.runner_id(), "token stream dropped, cancelling runner");
            self.runner.cancel_current();
        }
    }
}

/// [`TokenSource`] over a [`NativeRunner`].
pub struct RunnerTokenSource<R: NativeRunner> {
    runner: Arc<R>,
    id: String,
    /// The blocking `generate` call, until it has returned.
    inflight: Mutex<Option<JoinHandle<()>>>,
}

impl<R: NativeRunner> RunnerTokenSource<R> {
    pub fn new(runner: R) -> Self {
        let id = runner.runner_id().to_string();
        Self {
            runner: Arc::new(runner),
            id,
            inflight: Mutex::new(None),
        }
    }

    pub fn runner(&self) -> &Arc<R> {
        &self.runner
    }

    async fn join_inflight(&self) {
        let Some(handle) = self.inflight.lock().take() else {
            return;
        };
        if let Err(e) = handle.await {
            tracing::warn!(runner = %self.id, error = %e, "native generate task panicked");
        }
    }
}

#[async_trait::async_trait]
impl<R: NativeRunner> TokenSource for RunnerTokenSource<R> {
    async fn generate(&self, req: GenerationRequest) -> Result<TokenStream> {
        let prompt = match req.prompt {
            RenderedPrompt::Flat(p) => p,
            RenderedPrompt::Structured(_) => {
                return Err(Error::Template(
                    "native runners need a flat prompt; disable template.structured".into(),
                ));
            }
        };

        // One native generation at a time, even across a cancel.
        self.join_inflight().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = RunnerSink {
            tx,
            backend: self.id.clone(),
        };
        let runner = self.runner.clone();
        let max_tokens = req.max_tokens;
        let handle = tokio::task::spawn_blocking(move || runner.generate(&prompt, max_tokens, sink));
        *self.inflight.lock() = Some(handle);

        let guard = CancelOnDrop {
            runner: self.runner.clone(),
            armed: AtomicBool::new(true),
        };
        let stream = async_stream::stream! {
            let guard = guard;
            while let Some(item) = rx.recv().await {
                let failed = item.is_err();
                yield item;
                if failed {
                    break;
                }
            }
            guard.disarm();
        };
        Ok(Box::pin(stream))
    }

    fn cancel(&self) {
        self.runner.cancel_current();
    }

    async fn drain(&self) {
        self.join_inflight().await;
    }

    async fn unload(&self) -> Result<()> {
        self.join_inflight().await;
        let runner = self.runner.clone();
        tokio::task::spawn_blocking(move || runner.unload())
            .await
            .map_err(|e| Error::Other(format!("unload task failed: {e}")))
    }

    fn source_id(&self) -> &str {
        &self.id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Emits its prompt word by word, optionally failing at the end.
    struct WordRunner {
        fail_with: Option<&'static str>,
        cancel: AtomicBool,
        cancels: AtomicUsize,
        unloads: AtomicUsize,
        slow: bool,
    }

    impl WordRunner {
        fn new() -> Self {
            Self {
                fail_with: None,
                cancel: AtomicBool::new(false),
                cancels: AtomicUsize::new(0),
                unloads: AtomicUsize::new(0),
                slow: false,
            }
        }
    }

    impl NativeRunner for WordRunner {
        fn generate(&self, prompt: &str, _max_tokens: Option<u32>, sink: RunnerSink) {
            self.cancel.store(false, Ordering::Release);
            for word in prompt.split_inclusive(' ') {
                if self.cancel.load(Ordering::Acquire) {
                    return sink.on_done();
                }
                if self.slow {
                    std::thread::sleep(Duration::from_millis(20));
                }
                if !sink.on_token(word) {
                    return;
                }
            }
            match self.fail_with {
                Some(msg) => sink.on_error(msg),
                None => sink.on_done(),
            }
        }

        fn cancel_current(&self) {
            self.cancels.fetch_add(1, Ordering::AcqRel);
            self.cancel.store(true, Ordering::Release);
        }

        fn unload(&self) {
            self.unloads.fetch_add(1, Ordering::AcqRel);
        }

        fn runner_id(&self) -> &str {
            "words"
        }
    }

    fn flat(p: &str) -> GenerationRequest {
        GenerationRequest {
            prompt: RenderedPrompt::Flat(p.into()),
            max_tokens: None,
        }
    }

    #[tokio::test]
    async fn callbacks_become_stream_items() {
        let source = RunnerTokenSource::new(WordRunner::new());
        let items: Vec<String> = source
            .generate(flat("hello there world"))
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(items, vec!["hello ", "there ", "world"]);
        assert_eq!(source.runner().cancels.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn on_error_surfaces_backend_error() {
        let runner = WordRunner {
            fail_with: Some("prefill aborted"),
            ..WordRunner::new()
        };
        let source = RunnerTokenSource::new(runner);
        let items: Vec<Result<String>> = source.generate(flat("a")).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        let err = items.into_iter().last().unwrap().unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn dropping_stream_cancels_runner() {
        let runner = WordRunner {
            slow: true,
            ..WordRunner::new()
        };
        let source = RunnerTokenSource::new(runner);
        let mut stream = source.generate(flat("a b c d e f g")).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "a ");
        drop(stream);
        assert_eq!(source.runner().cancels.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn structured_prompt_is_rejected() {
        let source = RunnerTokenSource::new(WordRunner::new());
        let req = GenerationRequest {
            prompt: RenderedPrompt::Structured(Vec::new()),
            max_tokens: None,
        };
        assert!(matches!(source.generate(req).await, Err(Error::Template(_))));
    }

    /// Streams one token, then spins until cancelled and takes a while to
    /// unwind, like a runtime finishing its current decode step.
    struct SlowUnwindRunner {
        cancel: AtomicBool,
        generating: AtomicBool,
        overlaps: AtomicUsize,
    }

    impl SlowUnwindRunner {
        fn new() -> Self {
            Self {
                cancel: AtomicBool::new(false),
                generating: AtomicBool::new(false),
                overlaps: AtomicUsize::new(0),
            }
        }
    }

    impl NativeRunner for SlowUnwindRunner {
        fn generate(&self, _prompt: &str, _max_tokens: Option<u32>, sink: RunnerSink) {
            if self.generating.swap(true, Ordering::AcqRel) {
                self.overlaps.fetch_add(1, Ordering::AcqRel);
            }
            self.cancel.store(false, Ordering::Release);
            sink.on_token("partial");
            while !self.cancel.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(5));
            }
            std::thread::sleep(Duration::from_millis(150));
            self.generating.store(false, Ordering::Release);
            sink.on_done();
        }

        fn cancel_current(&self) {
            self.cancel.store(true, Ordering::Release);
        }

        fn unload(&self) {
            if self.generating.load(Ordering::Acquire) {
                self.overlaps.fetch_add(1, Ordering::AcqRel);
            }
        }

        fn runner_id(&self) -> &str {
            "slow-unwind"
        }
    }

    #[tokio::test]
    async fn drain_waits_for_cancelled_generate_to_return() {
        let source = RunnerTokenSource::new(SlowUnwindRunner::new());
        let mut stream = source.generate(flat("go")).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "partial");

        source.cancel();
        drop(stream);
        assert!(source.runner().generating.load(Ordering::Acquire));

        source.drain().await;
        assert!(!source.runner().generating.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn unload_and_next_generate_never_overlap_an_unwinding_generate() {
        let source = RunnerTokenSource::new(SlowUnwindRunner::new());
        let mut stream = source.generate(flat("go")).await.unwrap();
        assert!(stream.next().await.is_some());
        drop(stream);

        let mut next = source.generate(flat("again")).await.unwrap();
        assert_eq!(next.next().await.unwrap().unwrap(), "partial");
        source.cancel();
        drop(next);

        source.unload().await.unwrap();
        assert_eq!(source.runner().overlaps.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn unload_runs_on_blocking_pool() {
        let source = RunnerTokenSource::new(WordRunner::new());
        source.unload().await.unwrap();
        assert_eq!(source.runner().unloads.load(Ordering::Acquire), 1);
    }
}
