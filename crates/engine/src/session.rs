//! The streaming session: one user turn from prompt to finalized output.
//!
//! `start_run` spawns a driver task that acquires the generation role,
//! streams segments from the token source, dispatches tool calls between
//! segments, and finalizes. The caller observes the run through the
//! [`RunHandle`] event channel; every non-terminal event and every write
//! to shared output is guarded by the run id, so a superseded run can
//! never overwrite its successor.

use std::sync::Arc;

use futures_util::StreamExt;
use lt_domain::config::SessionConfig;
use lt_domain::error::{Error, ErrorKind, Result};
use lt_domain::tool::{Message, ToolCall, ToolDefinition};
use lt_providers::{GenerationRequest, PromptRenderer, TemplateMeta, TokenSource, ToolExecutor};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::backoff::RetryBackoff;
use crate::cancel::CancelToken;
use crate::coordinator::{GenerationPermit, ResourceCoordinator};
use crate::delta::DeltaReconciler;
use crate::event::{FinalOutput, RunOutcome, SessionEvent};
use crate::markers::{ControlMarkerParser, DetectedMarker, ScanUpdate, ThinkUpdate};
use crate::orchestrator::{ContinuationState, ToolCallOrchestrator};
use crate::perf::PerfAccumulator;
use crate::run::{RunId, RunWriter, SessionSnapshot, SharedOutput};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// StreamingSession
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct StreamingSession {
    index: usize,
    config: SessionConfig,
    meta: TemplateMeta,
    source: Arc<dyn TokenSource>,
    tools: Arc<dyn ToolExecutor>,
    renderer: Arc<dyn PromptRenderer>,
    coordinator: Arc<ResourceCoordinator>,
    shared: Arc<SharedOutput>,
    /// The live run and its cancel token. Cleared when the run ends.
    current: Arc<Mutex<Option<(RunId, CancelToken)>>>,
}

impl StreamingSession {
    pub fn new(
        source: Arc<dyn TokenSource>,
        tools: Arc<dyn ToolExecutor>,
        renderer: Arc<dyn PromptRenderer>,
        config: SessionConfig,
        meta: TemplateMeta,
    ) -> Self {
        Self {
            index: 0,
            config,
            meta,
            source,
            tools,
            renderer,
            coordinator: ResourceCoordinator::new(),
            shared: SharedOutput::new(),
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Share a coordinator with other sessions bound to the same model.
    pub fn with_coordinator(mut self, coordinator: Arc<ResourceCoordinator>) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// Session index, used only to tell sessions apart in logs.
    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    pub fn coordinator(&self) -> &Arc<ResourceCoordinator> {
        &self.coordinator
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start a run over `history`, which must end with the new user turn.
    ///
    /// A run still in progress is superseded: it is cancelled, and its
    /// later writes are discarded.
    pub fn start_run(&self, history: Vec<Message>) -> RunHandle {
        let cancel = CancelToken::new();
        let run_id = {
            let mut current = self.current.lock();
            if let Some((previous, token)) = current.take() {
                tracing::debug!(%previous, "superseding previous run");
                token.cancel();
            }
            let run_id = self.shared.begin_run(&history);
            *current = Some((run_id, cancel.clone()));
            run_id
        };

        let (tx, rx) = mpsc::channel::<SessionEvent>(self.config.event_buffer.max(1));
        let driver = RunDriver {
            run: RunWriter::new(run_id, self.shared.clone(), tx, cancel.clone()),
            cancel,
            current: self.current.clone(),
            config: self.config.clone(),
            meta: self.meta,
            source: self.source.clone(),
            renderer: self.renderer.clone(),
            definitions: self.tools.definitions(),
            coordinator: self.coordinator.clone(),
            orchestrator: ToolCallOrchestrator::new(self.source.clone(), self.tools.clone()),
            parser: ControlMarkerParser::new(self.source.channel(), self.config.stop_sequences.clone()),
            reconciler: DeltaReconciler::new(self.source.chunk_mode()),
            state: ContinuationState::new(
                self.config.max_tool_turns,
                RetryBackoff::from(&self.config.retry),
            ),
            history,
            buffer: String::new(),
            segment_visible_start: 0,
            segment_chunks: 0,
        };

        let run_span = tracing::info_span!(
            "run",
            %run_id,
            session = self.index,
            source = %self.source.source_id(),
        );
        let join = tokio::spawn(driver.run().instrument(run_span));

        RunHandle {
            run_id,
            events: rx,
            join,
        }
    }

    /// Cancel `run_id` if it is still running. Partial output stays
    /// visible. Returns whether a live run was found.
    pub fn cancel(&self, run_id: RunId) -> bool {
        let mut current = self.current.lock();
        match current.as_ref() {
            Some((id, token)) if *id == run_id => {
                token.cancel();
                *current = None;
                true
            }
            _ => false,
        }
    }

    /// Cancel whatever run is in progress.
    pub fn cancel_current(&self) -> Option<RunId> {
        let (run_id, token) = self.current.lock().take()?;
        token.cancel();
        Some(run_id)
    }

    pub fn active_run(&self) -> Option<RunId> {
        self.shared.active_run()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot()
    }

    /// Tear the model down once any in-flight generation has drained.
    ///
    /// Returns `Ok(true)` if this call performed the unload and
    /// `Ok(false)` if a concurrent caller already did.
    pub async fn unload_model(&self) -> Result<bool> {
        let Some(_permit) = self.coordinator.acquire_unload().await else {
            tracing::debug!(session = self.index, "unload already performed by another caller");
            return Ok(false);
        };
        tracing::info!(session = self.index, source = %self.source.source_id(), "unloading model");
        self.source.unload().await?;
        Ok(true)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RunHandle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Caller side of a started run.
///
/// Dropping the handle (or its receiver) abandons the run: the driver
/// notices the closed channel and stops generating.
pub struct RunHandle {
    run_id: RunId,
    events: mpsc::Receiver<SessionEvent>,
    join: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Next event, or `None` once the run has ended and all events were
    /// delivered.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Drain every remaining event and wait for the outcome.
    pub async fn wait(mut self) -> (Vec<SessionEvent>, RunOutcome) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let outcome = match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => RunOutcome::Failed {
                kind: ErrorKind::Stream,
                message: format!("run task failed: {e}"),
            },
        };
        (events, outcome)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RunDriver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Why a run stopped early.
enum Halt {
    Cancelled,
    Failed(Error),
}

/// How one generation segment ended.
enum SegmentEnd {
    /// The stream ran out.
    Natural,
    /// A stop sequence matched; the buffer was truncated there.
    Stopped,
    /// An actionable tool call with budget left to dispatch it.
    Tool {
        call: ToolCall,
        marker: DetectedMarker,
    },
    /// An actionable tool call after the tool-turn budget ran out.
    BudgetExhausted,
}

struct RunDriver {
    run: RunWriter,
    cancel: CancelToken,
    current: Arc<Mutex<Option<(RunId, CancelToken)>>>,
    config: SessionConfig,
    meta: TemplateMeta,
    source: Arc<dyn TokenSource>,
    renderer: Arc<dyn PromptRenderer>,
    definitions: Vec<ToolDefinition>,
    coordinator: Arc<ResourceCoordinator>,
    orchestrator: ToolCallOrchestrator,
    parser: ControlMarkerParser,
    reconciler: DeltaReconciler,
    state: ContinuationState,
    history: Vec<Message>,
    /// Everything the model wrote this run, plus appended tool results.
    buffer: String,
    /// Offset into the parser's visible text where the current segment
    /// began.
    segment_visible_start: usize,
    /// Chunks received by the current attempt.
    segment_chunks: usize,
}

impl RunDriver {
    async fn run(mut self) -> RunOutcome {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = self.coordinator.acquire_generation() => Some(permit),
        };
        let Some(permit) = permit else {
            return self.cancelled().await;
        };
        if self.cancel.is_cancelled() {
            drop(permit);
            return self.cancelled().await;
        }
        tracing::debug!("generation role acquired");

        let mut perf = PerfAccumulator::start();
        match self.drive(&mut perf).await {
            Ok(output) => {
                let perf = perf.finish(u64::from(self.config.prompt_overhead_tokens));
                // Finalization must not hold the generation role.
                self.release(permit).await;
                let tool_rounds = self.state.tool_rounds();
                tracing::info!(
                    tokens = perf.generated_tokens,
                    tool_rounds,
                    duration_ms = perf.duration_ms,
                    "run finalized"
                );
                self.run
                    .emit_terminal(SessionEvent::Finalized {
                        run_id: self.run.run_id(),
                        output: output.clone(),
                        perf: perf.clone(),
                    })
                    .await;
                RunOutcome::Completed {
                    output,
                    perf,
                    tool_rounds,
                }
            }
            Err(Halt::Cancelled) => {
                self.source.cancel();
                self.release(permit).await;
                self.cancelled().await
            }
            Err(Halt::Failed(err)) => {
                self.source.cancel();
                self.release(permit).await;
                let kind = err.kind();
                let message = err.to_string();
                tracing::warn!(?kind, error = %message, "run failed");
                self.run
                    .emit_terminal(SessionEvent::Failed {
                        run_id: self.run.run_id(),
                        kind,
                        message: message.clone(),
                    })
                    .await;
                RunOutcome::Failed { kind, message }
            }
        }
    }

    /// Give the generation role back once the backend has fully stopped.
    async fn release(&self, permit: GenerationPermit) {
        self.source.drain().await;
        drop(permit);
        self.retire();
    }

    /// Forget this run as the session's live run.
    fn retire(&self) {
        let mut current = self.current.lock();
        if matches!(current.as_ref(), Some((id, _)) if *id == self.run.run_id()) {
            *current = None;
        }
    }

    async fn cancelled(mut self) -> RunOutcome {
        self.retire();
        let run_id = self.run.run_id();
        let open = self.parser.interrupt();
        if !open.is_empty() {
            self.run.interrupt_think(&open);
            for span_id in open {
                self.run
                    .emit(SessionEvent::Think {
                        run_id,
                        span_id,
                        delta: String::new(),
                        complete: false,
                        interrupted: true,
                    })
                    .await;
            }
        }
        tracing::info!("run cancelled");
        self.run.emit_terminal(SessionEvent::Cancelled { run_id }).await;
        RunOutcome::Cancelled
    }

    /// Segment loop: stream, dispatch tools, repeat until the model ends
    /// its answer or the tool budget is spent.
    async fn drive(&mut self, perf: &mut PerfAccumulator) -> std::result::Result<FinalOutput, Halt> {
        let mut budget_exhausted = false;
        loop {
            match self.stream_segment(perf).await? {
                SegmentEnd::Natural | SegmentEnd::Stopped => break,
                SegmentEnd::BudgetExhausted => {
                    budget_exhausted = true;
                    break;
                }
                SegmentEnd::Tool { call, marker } => self.dispatch(call, marker).await?,
            }
        }
        self.finalize(budget_exhausted).await
    }

    /// One segment, retried while the backend reports the transient race
    /// before yielding anything.
    async fn stream_segment(
        &mut self,
        perf: &mut PerfAccumulator,
    ) -> std::result::Result<SegmentEnd, Halt> {
        loop {
            match self.attempt(perf).await {
                Ok(end) => {
                    self.state.reset_retries();
                    return Ok(end);
                }
                Err(Halt::Failed(err)) if err.is_transient() && self.segment_chunks == 0 => {
                    let attempt = self.state.retry_attempt() + 1;
                    let Some(delay) = self.state.next_retry_delay() else {
                        tracing::warn!(attempt, error = %err, "retry ceiling reached");
                        return Err(Halt::Failed(err));
                    };
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient backend failure, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(Halt::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(halt) => return Err(halt),
            }
        }
    }

    async fn attempt(&mut self, perf: &mut PerfAccumulator) -> std::result::Result<SegmentEnd, Halt> {
        let continuation = self.state.tool_rounds() > 0;
        self.segment_chunks = 0;

        let prompt = self
            .renderer
            .render(&self.history, &self.definitions, &self.meta)
            .map_err(Halt::Failed)?;
        let req = GenerationRequest {
            prompt,
            max_tokens: self.config.max_tokens,
        };

        let mut stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Halt::Cancelled),
            stream = self.source.generate(req) => stream.map_err(Halt::Failed)?,
        };

        // Reconciled text of this segment; cumulative chunks restate it.
        let mut segment = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Halt::Cancelled),
                next = stream.next() => next,
            };
            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => return Err(Halt::Failed(err)),
            };
            self.segment_chunks += 1;

            let delta = self.reconciler.delta(&segment, &chunk).to_string();
            if delta.is_empty() {
                continue;
            }
            perf.record_token();
            segment.push_str(&delta);
            self.buffer.push_str(&delta);

            if let Some(end) = self.process().await? {
                return Ok(end);
            }
        }

        if continuation && self.segment_chunks == 0 {
            return Err(Halt::Failed(Error::EmptyOutput));
        }
        tracing::debug!(chunks = self.segment_chunks, "segment ended");
        Ok(SegmentEnd::Natural)
    }

    /// Scan the buffer after an append and act on what was found.
    async fn process(&mut self) -> std::result::Result<Option<SegmentEnd>, Halt> {
        loop {
            let ScanUpdate {
                visible_delta,
                think,
                marker,
                stop_at,
            } = self.parser.scan(&self.buffer);
            self.publish(visible_delta, think).await?;

            if let Some(at) = stop_at {
                tracing::debug!(offset = at, "stop sequence matched");
                self.source.cancel();
                self.buffer.truncate(at);
                return Ok(Some(SegmentEnd::Stopped));
            }
            let Some(marker) = marker else {
                return Ok(None);
            };

            match self.orchestrator.actionable(&marker) {
                Ok(Some(call)) => {
                    if self.state.take_tool_turn() {
                        return Ok(Some(SegmentEnd::Tool { call, marker }));
                    }
                    tracing::info!(tool = %call.tool_name, "tool-turn budget exhausted, call left undispatched");
                    self.source.cancel();
                    self.buffer.truncate(marker.span.start);
                    return Ok(Some(SegmentEnd::BudgetExhausted));
                }
                Ok(None) => {
                    tracing::debug!(marker = %marker.raw, "marker names no tool, skipping");
                    self.parser.commit(&self.buffer, marker.span.end);
                }
                Err(err) => {
                    self.source.cancel();
                    return Err(Halt::Failed(err));
                }
            }
        }
    }

    /// Run a tool and fold its result into the buffer and history.
    async fn dispatch(&mut self, call: ToolCall, marker: DetectedMarker) -> std::result::Result<(), Halt> {
        let run_id = self.run.run_id();
        let assistant_text = self
            .parser
            .visible_text()
            .get(self.segment_visible_start..)
            .unwrap_or_default()
            .to_string();

        self.run
            .emit(SessionEvent::ToolCall {
                run_id,
                call_id: call.call_id.clone(),
                tool_name: call.tool_name.clone(),
                arguments: call.arguments.clone(),
                marker: marker.raw.clone(),
            })
            .await;

        let round = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Halt::Cancelled),
            round = self.orchestrator.handle(call, &marker, &self.buffer, assistant_text) => round,
        };

        self.run
            .emit(SessionEvent::ToolResult {
                run_id,
                call_id: round.call.call_id.clone(),
                tool_name: round.call.tool_name.clone(),
                result: round.result.clone(),
                is_error: round.is_error,
            })
            .await;

        // Settle through the marker, then append the result echo so the
        // parser hides it, then keep whatever followed the marker.
        self.parser.commit(&self.buffer, marker.span.end);
        self.buffer.truncate(marker.span.end);
        self.buffer.push_str(&round.result_marker);
        self.buffer.push('\n');
        let result_end = self.buffer.len();
        self.buffer.push_str(&round.trailing);
        self.parser.commit(&self.buffer, result_end);

        self.history.push(Message::assistant_tool_call(
            round.pending.assistant_text.clone(),
            round.call.clone(),
        ));
        if self.meta.native_tool_role {
            self.history
                .push(Message::tool_result(round.call.tool_name.clone(), round.tool_content()));
        } else {
            self.history.push(Message::hidden_user(round.result_marker.clone()));
        }
        self.run.set_transcript(&self.history);

        if !round.trailing.is_empty() {
            let update = self.parser.scan(&self.buffer);
            self.publish(update.visible_delta, update.think).await?;
        }
        self.segment_visible_start = self.parser.visible_text().len();
        tracing::debug!(
            tool = %round.call.tool_name,
            is_error = round.is_error,
            remaining = self.state.remaining_tool_turns(),
            "tool result folded into history"
        );
        Ok(())
    }

    async fn finalize(&mut self, budget_exhausted: bool) -> std::result::Result<FinalOutput, Halt> {
        let update = self.parser.finish(&self.buffer);
        self.publish(update.visible_delta, update.think).await?;

        let visible = self.parser.visible_text();
        let output = if !visible.trim().is_empty() {
            FinalOutput::Text(visible.to_string())
        } else if budget_exhausted {
            FinalOutput::AwaitingTool
        } else {
            FinalOutput::Empty
        };

        let answer = visible.get(self.segment_visible_start..).unwrap_or_default();
        if !answer.trim().is_empty() {
            self.history.push(Message::assistant(answer));
        }
        self.run.set_transcript(&self.history);
        Ok(output)
    }

    /// Forward scan results to shared output and the event channel.
    async fn publish(
        &mut self,
        visible_delta: String,
        think: Vec<ThinkUpdate>,
    ) -> std::result::Result<(), Halt> {
        let run_id = self.run.run_id();
        if !visible_delta.is_empty() {
            self.run.append_visible(&visible_delta);
            self.run
                .emit(SessionEvent::Token {
                    run_id,
                    text: visible_delta,
                })
                .await;
        }
        for update in think {
            self.run.update_think(update.span_id, &update.delta, update.complete);
            self.run
                .emit(SessionEvent::Think {
                    run_id,
                    span_id: update.span_id,
                    delta: update.delta,
                    complete: update.complete,
                    interrupted: false,
                })
                .await;
        }
        if self.run.is_abandoned() {
            tracing::debug!("event receiver dropped, abandoning run");
            return Err(Halt::Cancelled);
        }
        Ok(())
    }
}
