//! `localturn run`: one-shot execution command.
//!
//! Sends a single message, streams the visible answer to stdout and
//! reasoning to stderr, and exits. Ctrl-C cancels the run and keeps the
//! partial answer.

use std::io::Write;
use std::path::PathBuf;

use lt_domain::config::Config;
use lt_domain::tool::Message;
use lt_engine::{FinalOutput, RunOutcome, SessionEvent};

use crate::bootstrap;

/// Execute a single turn and print the response.
pub async fn run(
    config: Config,
    message: String,
    replay: Option<PathBuf>,
    json_output: bool,
    session_index: usize,
) -> anyhow::Result<()> {
    let session = bootstrap::build_session(&config, replay.as_deref(), session_index)?;
    let mut handle = session.start_run(vec![Message::user(message)]);
    let run_id = handle.run_id();

    let mut collected_events: Vec<SessionEvent> = Vec::new();
    let mut interrupted = false;

    loop {
        let event = tokio::select! {
            event = handle.next_event() => event,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                session.cancel(run_id);
                continue;
            }
        };
        let Some(event) = event else { break };
        if json_output {
            collected_events.push(event);
        } else {
            print_event(&event);
        }
    }

    if json_output {
        let json = serde_json::to_string_pretty(&collected_events)
            .map_err(|e| anyhow::anyhow!("serializing events: {e}"))?;
        println!("{json}");
    }

    let (_, outcome) = handle.wait().await;
    if let RunOutcome::Failed { .. } = outcome {
        std::process::exit(1);
    }
    Ok(())
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Token { text, .. } => {
            print!("{text}");
            std::io::stdout().flush().ok();
        }
        SessionEvent::Think { delta, complete, .. } => {
            // Dim output to stderr so it doesn't pollute stdout.
            eprint!("\x1b[2m{delta}\x1b[0m");
            if *complete {
                eprintln!();
            }
            std::io::stderr().flush().ok();
        }
        SessionEvent::ToolCall { tool_name, .. } => {
            eprintln!("\x1b[2m[tool: {tool_name}]\x1b[0m");
        }
        SessionEvent::ToolResult {
            tool_name,
            is_error: true,
            result,
            ..
        } => {
            eprintln!("\x1b[2m[tool {tool_name} failed: {result}]\x1b[0m");
        }
        SessionEvent::ToolResult { .. } => {}
        SessionEvent::Finalized { output, perf, .. } => {
            match output {
                FinalOutput::Text(_) => println!(),
                FinalOutput::Empty => eprintln!("(no answer)"),
                FinalOutput::AwaitingTool => eprintln!("(tool budget exhausted before an answer)"),
            }
            tracing::debug!(
                tokens = perf.token_count,
                ttft_ms = ?perf.time_to_first_token_ms,
                tokens_per_second = ?perf.tokens_per_second,
                "turn complete"
            );
        }
        SessionEvent::Failed { kind, message, .. } => {
            eprintln!("error ({kind:?}): {message}");
        }
        SessionEvent::Cancelled { .. } => {
            println!();
            eprintln!("run cancelled");
        }
    }
}
