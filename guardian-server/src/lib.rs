// Guardian Server - HTTP front for Guardian
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! HTTP front for Guardian: serves the health contract, wraps a request
//! pipeline in the admission gate and exports Prometheus metrics.

pub mod app;
pub mod error;
pub mod metrics;
pub mod remote;

#[cfg(feature = "replay")]
pub mod replay;

pub use app::{router, AppState};
pub use error::{Result, ServerError};
pub use remote::{GateSource, RemoteHealthSource};
