use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend selection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where tokens come from. The engine is agnostic; this only picks the
/// adapter the binary wires in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Replay,
    Loopback,
}

/// Whether the token source runs on-device or behind a remote endpoint
/// that pre-validates tool grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default)]
    pub channel: Channel,
    #[serde(default)]
    pub loopback: LoopbackConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
}

/// OpenAI-compatible streaming endpoint served on the same device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopbackConfig {
    #[serde(default = "d_base_url")]
    pub base_url: String,
    #[serde(default = "d_model")]
    pub model: String,
    #[serde(default = "d_120000")]
    pub timeout_ms: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            base_url: d_base_url(),
            model: d_model(),
            timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplayConfig {
    /// JSON file holding the scripted generations.
    #[serde(default)]
    pub script: Option<PathBuf>,
}

fn d_base_url() -> String {
    "http://127.0.0.1:8080/v1".into()
}
fn d_model() -> String {
    "local".into()
}
fn d_120000() -> u64 {
    120_000
}
