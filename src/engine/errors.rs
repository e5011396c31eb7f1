use thiserror::Error;

/// Errors surfaced by the engine state machine. The HTTP layer maps these
/// onto status codes; `Storage` bubbles storage-layer failures unchanged.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    IllegalTransition(String),

    #[error("run token does not match")]
    TokenMismatch,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
