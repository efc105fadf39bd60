// Guardian Server - HTTP front for Guardian
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for the Guardian server

use thiserror::Error;

#[cfg(feature = "replay")]
use crate::replay::ReplayError;

/// Errors raised while starting the server. Request handling never fails
/// with these; admission failures become 503 responses instead.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] guardian::GuardianError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid health URL: {0}")]
    InvalidUrl(String),

    #[cfg(feature = "replay")]
    #[error("Replay error: {0}")]
    Replay(#[from] ReplayError),
}

/// Result type alias for server setup
pub type Result<T> = std::result::Result<T, ServerError>;
