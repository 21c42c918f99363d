//! Error types shared by the sandbox lifecycle and the HTTP layer.

use crate::engine::EngineError;
use axum::http::StatusCode;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

#[derive(Error, Debug)]
pub enum SandboxError {
    /// Caller sent something we will never be able to run.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Container {container} failed to start within {waited:?}")]
    FailedToStart { container: String, waited: Duration },

    #[error("Container {0} disappeared from the engine")]
    ContainerVanished(String),

    #[error("Container engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SandboxError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
