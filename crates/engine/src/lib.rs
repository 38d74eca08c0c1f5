//! Streaming session engine for locally loaded language models.
//!
//! Drives one user turn against a [`TokenSource`](lt_providers::TokenSource):
//! reconciles cumulative chunks, detects in-band control markers, pauses to
//! run tools and resumes with their results, and keeps generation and model
//! teardown mutually exclusive through a [`ResourceCoordinator`].

pub mod backoff;
pub mod cancel;
pub mod coordinator;
pub mod delta;
pub mod event;
pub mod markers;
pub mod orchestrator;
pub mod perf;
pub mod run;
pub mod session;

pub use coordinator::{GenerationPermit, ResourceCoordinator};
pub use delta::DeltaReconciler;
pub use event::{FinalOutput, RunOutcome, SessionEvent};
pub use markers::ControlMarkerParser;
pub use orchestrator::{ContinuationState, PendingToolCall, ToolCallOrchestrator};
pub use perf::{PerfAccumulator, PerfSummary};
pub use run::{RunId, SessionSnapshot};
pub use session::{RunHandle, StreamingSession};
