//! Scripted token source.
//!
//! Each call to `generate` consumes the next script. Scripts can yield
//! chunks, fail after their chunks, or yield nothing at all, which makes
//! the source useful for reproducing backend races deterministically.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lt_domain::config::Channel;
use lt_domain::error::{Error, Result};
use lt_domain::stream::TokenStream;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::traits::{ChunkMode, GenerationRequest, RenderedPrompt, TokenSource};

/// One scripted generation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub chunks: Vec<String>,
    /// Backend error raised after all chunks were yielded.
    #[serde(default)]
    pub error: Option<String>,
}

impl Script {
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            error: None,
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            chunks: Vec::new(),
            error: Some(message.into()),
        }
    }

    /// A generation that ends without yielding anything.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// On-disk replay file layout.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayFile {
    pub scripts: Vec<Script>,
    /// Keep replaying the last script once the list is exhausted.
    #[serde(default)]
    pub repeat_last: bool,
    #[serde(default)]
    pub chunk_delay_ms: Option<u64>,
}

pub struct ReplayTokenSource {
    id: String,
    scripts: Mutex<VecDeque<Script>>,
    repeat_last: Option<Script>,
    chunk_delay: Option<Duration>,
    channel: Channel,
    chunk_mode: ChunkMode,
    cancelled: Arc<AtomicBool>,
    cancel_calls: AtomicUsize,
    unload_calls: AtomicUsize,
    prompts: Mutex<Vec<RenderedPrompt>>,
}

impl ReplayTokenSource {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self {
            id: "replay".into(),
            scripts: Mutex::new(scripts.into_iter().collect()),
            repeat_last: None,
            chunk_delay: None,
            channel: Channel::Local,
            chunk_mode: ChunkMode::Auto,
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_calls: AtomicUsize::new(0),
            unload_calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Load scripts from a JSON [`ReplayFile`].
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let file: ReplayFile = serde_json::from_str(&raw)?;
        let mut source = Self::new(file.scripts);
        if file.repeat_last {
            source.repeat_last = source.scripts.lock().back().cloned();
        }
        source.chunk_delay = file.chunk_delay_ms.map(Duration::from_millis);
        Ok(source)
    }

    /// Replay `script` forever once the queue is empty.
    pub fn repeating(mut self, script: Script) -> Self {
        self.repeat_last = Some(script);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_chunk_mode(mut self, mode: ChunkMode) -> Self {
        self.chunk_mode = mode;
        self
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<RenderedPrompt> {
        self.prompts.lock().clone()
    }

    pub fn generate_calls(&self) -> usize {
        self.prompts.lock().len()
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::Acquire)
    }

    pub fn unload_calls(&self) -> usize {
        self.unload_calls.load(Ordering::Acquire)
    }

    fn next_script(&self) -> Script {
        self.scripts
            .lock()
            .pop_front()
            .or_else(|| self.repeat_last.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl TokenSource for ReplayTokenSource {
    async fn generate(&self, req: GenerationRequest) -> Result<TokenStream> {
        self.prompts.lock().push(req.prompt);
        self.cancelled.store(false, Ordering::Release);

        let script = self.next_script();
        let cancelled = self.cancelled.clone();
        let delay = self.chunk_delay;
        let backend = self.id.clone();

        let stream = async_stream::stream! {
            for chunk in script.chunks {
                if let Some(d) = delay {
                    tokio::time::sleep(d).await;
                }
                if cancelled.load(Ordering::Acquire) {
                    return;
                }
                yield Ok(chunk);
            }
            if let Some(message) = script.error {
                yield Err(Error::Backend { backend, message });
            }
        };
        Ok(Box::pin(stream))
    }

    fn cancel(&self) {
        self.cancel_calls.fetch_add(1, Ordering::AcqRel);
        self.cancelled.store(true, Ordering::Release);
    }

    async fn unload(&self) -> Result<()> {
        self.unload_calls.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn channel(&self) -> Channel {
        self.channel
    }

    fn chunk_mode(&self) -> ChunkMode {
        self.chunk_mode
    }

    fn source_id(&self) -> &str {
        &self.id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
