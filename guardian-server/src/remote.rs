// Guardian Server - Remote health source
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Health source that polls a publisher in another process over HTTP.

use crate::error::{Result, ServerError};
use guardian::{GuardianError, HealthReport, HealthSource, PublisherSource};
use std::future::Future;
use std::time::Duration;

/// Polls a remote health endpoint serving the version 1 JSON contract.
#[derive(Debug, Clone)]
pub struct RemoteHealthSource {
    client: reqwest::Client,
    url: String,
}

impl RemoteHealthSource {
    /// Create a source for `url`.
    ///
    /// `connect_timeout` only bounds connection setup; the gate applies its
    /// own deadline to the whole fetch.
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let url = url.into();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ServerError::InvalidUrl(url));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl HealthSource for RemoteHealthSource {
    fn fetch(&self) -> impl Future<Output = guardian::Result<HealthReport>> + Send {
        let request = self.client.get(&self.url);
        async move {
            let response = request
                .send()
                .await
                .map_err(|e| GuardianError::HealthUnreachable(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(GuardianError::HealthUnreachable(format!(
                    "health endpoint returned HTTP {}",
                    status
                )));
            }
            let body = response
                .bytes()
                .await
                .map_err(|e| GuardianError::HealthUnreachable(e.to_string()))?;
            HealthReport::from_slice(&body)
        }
    }
}

/// Where the admission gate reads health from.
#[derive(Debug, Clone)]
pub enum GateSource {
    /// The in-process publisher
    Local(PublisherSource),
    /// A publisher in another process
    Remote(RemoteHealthSource),
}

impl HealthSource for GateSource {
    fn fetch(&self) -> impl Future<Output = guardian::Result<HealthReport>> + Send {
        let source = self.clone();
        async move {
            match source {
                Self::Local(local) => local.fetch().await,
                Self::Remote(remote) => remote.fetch().await,
            }
        }
    }
}
