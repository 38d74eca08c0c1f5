use serde::{Deserialize, Serialize};
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-turn limits for the streaming session engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Successive tool turns allowed per user message. Once exhausted,
    /// further tool-call markers are left undispatched.
    #[serde(default = "d_2")]
    pub max_tool_turns: u32,
    /// Literal stop sequences. A match inside an open think span is ignored.
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    /// Token overhead (system prompt, retrieved context) added to the
    /// performance summary at finalize time.
    #[serde(default)]
    pub prompt_overhead_tokens: u32,
    /// Maximum tokens per generation request. `None` lets the backend choose.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Event channel capacity per run.
    #[serde(default = "d_64")]
    pub event_buffer: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_tool_turns: 2,
            stop_sequences: Vec::new(),
            prompt_overhead_tokens: 0,
            max_tokens: None,
            event_buffer: 64,
            retry: RetryConfig::default(),
        }
    }
}

/// Bounded exponential backoff for the transient backend race.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries allowed per generation segment before the error surfaces.
    #[serde(default = "d_3")]
    pub max_attempts: u32,
    #[serde(default = "d_250")]
    pub base_delay_ms: u64,
    #[serde(default = "d_factor")]
    pub backoff_factor: f64,
    #[serde(default = "d_4000")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            backoff_factor: 2.0,
            max_delay_ms: 4_000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_2() -> u32 {
    2
}
fn d_3() -> u32 {
    3
}
fn d_64() -> usize {
    64
}
fn d_250() -> u64 {
    250
}
fn d_4000() -> u64 {
    4_000
}
fn d_factor() -> f64 {
    2.0
}
