pub mod loopback;
pub mod replay;
pub mod runner;
pub mod template;
pub mod traits;

// Re-exports for convenience.
pub use loopback::LoopbackTokenSource;
pub use replay::{ReplayTokenSource, Script};
pub use runner::{NativeRunner, RunnerSink, RunnerTokenSource};
pub use template::ChatTemplateRenderer;
pub use traits::{
    ChunkMode, GenerationRequest, PromptEntry, PromptRenderer, RenderedPrompt, TemplateMeta,
    TokenSource, ToolExecutor,
};
