use serde::Serialize;

/// Shared error type used across all localturn crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("backend {backend}: {message}")]
    Backend { backend: String, message: String },

    /// The backend aborted prefill/generation, typically right after a
    /// previous stream was cancelled.
    #[error("generation aborted: {0}")]
    GenerationAborted(String),

    /// A continuation produced no tokens and no tool call.
    #[error("backend produced no output")]
    EmptyOutput,

    #[error("malformed tool call: {0}")]
    MalformedToolCall(String),

    #[error("tool {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("template: {0}")]
    Template(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stable error classification reported through the `failed` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient backend race that outlived the retry ceiling.
    Transient,
    /// The tool-call marker could not be turned into a dispatchable call.
    ToolDispatch,
    /// Any other failure from the token source or transport.
    Stream,
    /// Prompt rendering or configuration problems.
    Setup,
}

const TRANSIENT_SIGNATURES: &[&str] = &["prefill aborted", "generation aborted", "decode aborted"];

impl Error {
    /// Whether this error matches the known transient backend race
    /// (aborted prefill right after a cancel, or an empty continuation).
    pub fn is_transient(&self) -> bool {
        match self {
            Error::GenerationAborted(_) | Error::EmptyOutput => true,
            Error::Backend { message, .. } => {
                let lower = message.to_ascii_lowercase();
                TRANSIENT_SIGNATURES.iter().any(|sig| lower.contains(sig))
            }
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_transient() {
            return ErrorKind::Transient;
        }
        match self {
            Error::MalformedToolCall(_) | Error::Tool { .. } => ErrorKind::ToolDispatch,
            Error::Template(_) | Error::Config(_) => ErrorKind::Setup,
            _ => ErrorKind::Stream,
        }
    }
}
