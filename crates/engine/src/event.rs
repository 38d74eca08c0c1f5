use lt_domain::error::ErrorKind;
use serde::Serialize;
use serde_json::Value;

use crate::perf::PerfSummary;
use crate::run::RunId;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionEvent: the callback contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted during a run, in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Display text appended.
    Token { run_id: RunId, text: String },

    /// A think span grew or closed. `delta` is only the new text.
    Think {
        run_id: RunId,
        span_id: usize,
        delta: String,
        complete: bool,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        interrupted: bool,
    },

    /// A tool-call marker was detected and is being dispatched.
    ToolCall {
        run_id: RunId,
        call_id: String,
        tool_name: String,
        arguments: Value,
        /// Marker text as written by the model.
        marker: String,
    },

    /// Tool execution finished; the result was folded into history.
    ToolResult {
        run_id: RunId,
        call_id: String,
        tool_name: String,
        result: Value,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },

    /// The run completed.
    Finalized {
        run_id: RunId,
        output: FinalOutput,
        perf: PerfSummary,
    },

    /// The run failed.
    Failed {
        run_id: RunId,
        kind: ErrorKind,
        message: String,
    },

    /// The run was cancelled or superseded. Partial text is kept.
    Cancelled { run_id: RunId },
}

impl SessionEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            SessionEvent::Token { run_id, .. }
            | SessionEvent::Think { run_id, .. }
            | SessionEvent::ToolCall { run_id, .. }
            | SessionEvent::ToolResult { run_id, .. }
            | SessionEvent::Finalized { run_id, .. }
            | SessionEvent::Failed { run_id, .. }
            | SessionEvent::Cancelled { run_id } => *run_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::Finalized { .. } | SessionEvent::Failed { .. } | SessionEvent::Cancelled { .. }
        )
    }
}

/// What the user should be shown once a run finalizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum FinalOutput {
    Text(String),
    /// The model produced no visible answer.
    Empty,
    /// No visible answer because the run ended on an undispatched tool
    /// call after the tool-turn budget ran out.
    AwaitingTool,
}

impl FinalOutput {
    pub fn text(&self) -> &str {
        match self {
            FinalOutput::Text(t) => t,
            FinalOutput::Empty | FinalOutput::AwaitingTool => "",
        }
    }
}

/// How a run ended, as returned by its join handle.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        output: FinalOutput,
        perf: PerfSummary,
        tool_rounds: u32,
    },
    Cancelled,
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let ev = SessionEvent::Think {
            run_id: RunId::for_tests(3),
            span_id: 0,
            delta: "hm".into(),
            complete: false,
            interrupted: false,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "think");
        assert_eq!(v["run_id"], 3);
        assert!(v.get("interrupted").is_none());
    }

    #[test]
    fn final_output_shapes() {
        let v = serde_json::to_value(FinalOutput::Text("hi".into())).unwrap();
        assert_eq!(v, serde_json::json!({"kind": "text", "text": "hi"}));
        let v = serde_json::to_value(FinalOutput::AwaitingTool).unwrap();
        assert_eq!(v, serde_json::json!({"kind": "awaiting_tool"}));
    }
}
