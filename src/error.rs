use thiserror::Error;

/// Errors produced by the exploration and batch tooling.
///
/// A timed-out generation is deliberately not in here; see `client::PollOutcome`.
#[derive(Error, Debug)]
pub enum Error {
    /// The config file (or something derived from it) is malformed.
    /// Always raised before any request reaches the server.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A mapped node id is missing from the workflow graph.
    #[error("node {node_id} not found in workflow")]
    NodeNotFound { node_id: String },

    /// The node exists, but has no such input field.
    #[error("node {node_id} has no input field '{field}'")]
    FieldNotFound { node_id: String, field: String },

    /// The field is wired to another node's output, so there is no literal to replace.
    #[error("input field '{field}' of node {node_id} is a link, refusing to overwrite it")]
    FieldIsLink { node_id: String, field: String },

    /// ComfyUI could not be reached, even after retrying.
    #[error("{context}: {source}")]
    Connection {
        context: String,
        source: reqwest::Error,
    },

    /// ComfyUI answered with a non-success status.
    #[error("ComfyUI returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// ComfyUI rejected the graph at validation time.
    #[error("workflow node errors: {0}")]
    NodeErrors(String),

    /// The response was missing fields we depend on.
    #[error("invalid response from ComfyUI: {0}")]
    InvalidResponse(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether retrying the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Connection { .. } => true,
            Error::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Errors that only concern the item being processed (one output, one image).
    /// Everything else means the server or the config is unusable.
    pub fn is_item_error(&self) -> bool {
        matches!(self, Error::Io { .. } | Error::Http { .. } | Error::InvalidResponse(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
