//! Error taxonomy for the task-lifecycle core.
//!
//! Transient transport failures are distinguished from terminal policy and
//! workflow failures so call sites can apply bounded retries where the
//! contract allows them.

use thiserror::Error;

/// Errors produced by the agent core.
#[derive(Error, Debug)]
pub enum AgentError {
    /// A forge or broker request failed at the transport level.
    #[error("transport error: {0}")]
    Transport(String),

    /// The forge API answered with a non-success status.
    #[error("forge API returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The LLM completion endpoint failed.
    #[error("LLM request failed: {0}")]
    Llm(String),

    /// No parseable JSON object was found in an LLM reply.
    #[error("no parseable JSON in LLM reply")]
    Parse,

    /// A tool invocation on the MCP server failed.
    #[error("tool call failed: {0}")]
    Tool(String),

    /// Invalid or missing configuration, surfaced at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A converter workflow step failed after compensation ran.
    #[error("workflow step failed: {0}")]
    Workflow(String),

    /// Queue backend failure.
    #[error("queue error: {0}")]
    Queue(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl AgentError {
    /// Whether the operation that produced this error may be retried at the
    /// call site with a bounded attempt count.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Llm(_) | Self::Queue(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
