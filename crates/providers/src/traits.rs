use lt_domain::config::{Channel, TemplateConfig, TemplateFamily};
use lt_domain::error::Result;
use lt_domain::stream::TokenStream;
use lt_domain::tool::{Message, Role, ToolDefinition};
use serde::Serialize;
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / prompt types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One role/content pair of a structured prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptEntry {
    pub role: Role,
    pub content: String,
}

/// Output of a [`PromptRenderer`].
#[derive(Debug, Clone, PartialEq)]
pub enum RenderedPrompt {
    /// A fully templated prompt string for native runtimes.
    Flat(String),
    /// Role/content pairs for backends that apply their own template.
    Structured(Vec<PromptEntry>),
}

impl RenderedPrompt {
    /// Concatenated prompt text, used for logging and assertions.
    pub fn text(&self) -> String {
        match self {
            RenderedPrompt::Flat(s) => s.clone(),
            RenderedPrompt::Structured(entries) => entries
                .iter()
                .map(|e| format!("{}: {}", e.role.as_str(), e.content))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// A single generation request handed to a [`TokenSource`].
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: RenderedPrompt,
    /// Maximum tokens in the response. `None` lets the backend choose.
    pub max_tokens: Option<u32>,
}

/// How a token source chunks its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkMode {
    /// Chunks may restate earlier text; reconcile every chunk.
    #[default]
    Auto,
    /// Chunks are guaranteed deltas; append verbatim.
    Delta,
}

/// Family-specific template metadata passed to the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateMeta {
    pub family: TemplateFamily,
    /// Whether tool results may be sent as a distinct tool-role entry.
    pub native_tool_role: bool,
    pub structured: bool,
}

impl From<&TemplateConfig> for TemplateMeta {
    fn from(cfg: &TemplateConfig) -> Self {
        Self {
            family: cfg.family,
            native_tool_role: cfg.native_tool_role(),
            structured: cfg.structured,
        }
    }
}

impl Default for TemplateMeta {
    fn default() -> Self {
        Self::from(&TemplateConfig::default())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Collaborator traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An already-loaded model that produces text chunks.
///
/// Implementations wrap a native runtime, a loopback HTTP server, or a
/// scripted replay. The session engine never knows which.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    /// Start generating and return the chunk stream.
    async fn generate(&self, req: GenerationRequest) -> Result<TokenStream>;

    /// Best-effort, synchronous request to stop the in-flight generation.
    /// The stream must end soon after; it may still yield a few chunks.
    fn cancel(&self);

    /// Wait until the backend has fully stopped generating, including any
    /// work still unwinding after [`cancel`](Self::cancel). The session
    /// awaits this before giving up the generation role.
    async fn drain(&self) {}

    /// Release the model. Called only while no generation is active.
    async fn unload(&self) -> Result<()> {
        Ok(())
    }

    fn channel(&self) -> Channel {
        Channel::Local
    }

    fn chunk_mode(&self) -> ChunkMode {
        ChunkMode::Auto
    }

    /// A unique identifier for this source (used in logs and errors).
    fn source_id(&self) -> &str;
}

/// Executes tools requested by the model.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run `tool_name` with `arguments`. `Err` carries a structured error
    /// message that is reported back to the model, not a transport failure.
    async fn execute(&self, tool_name: &str, arguments: &Value) -> std::result::Result<Value, String>;

    /// Tool definitions to advertise in the prompt.
    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }
}

/// Turns conversation history into a prompt. Must be pure.
pub trait PromptRenderer: Send + Sync {
    fn render(
        &self,
        history: &[Message],
        tools: &[ToolDefinition],
        meta: &TemplateMeta,
    ) -> Result<RenderedPrompt>;
}
