// Guardian - Resource-health admission control
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Admission gate
//!
//! Per-request admission control over a cached read of a [`HealthSource`].
//!
//! - Fresh cache (younger than `cache_ttl_ms`): reuse the snapshot.
//! - Stale cache: one request refreshes under a `fetch_timeout_s` deadline;
//!   requests arriving meanwhile use whatever is cached.
//! - Failed or timed-out refresh: bump the unknown streak and keep using
//!   the previous snapshot if there is one, otherwise report `unknown`.
//!   The gate fails open while the streak is under the hysteresis count
//!   and fails closed once it reaches it.
//!
//! Every failure ends in an [`AdmissionDecision`]; nothing is raised to
//! the caller.

use crate::config::GateConfig;
use crate::error::{GuardianError, Result};
use crate::publisher::HealthPublisher;
use crate::report::HealthReport;
use log::{debug, warn};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{timeout, Instant};

/// Header naming the guardian state on admitted responses
pub const STATE_HEADER: &str = "X-Guardian-State";
/// Header carrying a degradation warning
pub const WARNING_HEADER: &str = "X-Guardian-Warning";
/// Standard retry hint on blocked responses
pub const RETRY_AFTER_HEADER: &str = "Retry-After";

/// Capability to query the current health report.
pub trait HealthSource: Send + Sync + 'static {
    /// Fetch one report. The gate bounds this with its own timeout and
    /// drops the future when the deadline passes.
    fn fetch(&self) -> impl Future<Output = Result<HealthReport>> + Send;
}

/// Health source backed by an in-process [`HealthPublisher`].
///
/// Sampling runs on the blocking pool, so a sampler stuck on I/O is
/// abandoned by the gate's timeout instead of stalling the request.
/// At most one sampling task exists at a time: while an abandoned task is
/// still blocked, further fetches fail fast with "sampler busy" instead of
/// queueing more blocking work behind the publisher lock.
#[derive(Debug, Clone)]
pub struct PublisherSource {
    publisher: Arc<HealthPublisher>,
    sampling: Arc<AtomicBool>,
}

impl PublisherSource {
    pub fn new(publisher: Arc<HealthPublisher>) -> Self {
        Self {
            publisher,
            sampling: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The publisher this source samples
    pub fn publisher(&self) -> &Arc<HealthPublisher> {
        &self.publisher
    }

    /// Whether a sampling task is still running, possibly abandoned.
    pub fn is_sampling(&self) -> bool {
        self.sampling.load(Ordering::Acquire)
    }
}

impl HealthSource for PublisherSource {
    fn fetch(&self) -> impl Future<Output = Result<HealthReport>> + Send {
        let publisher = Arc::clone(&self.publisher);
        let slot = SamplingSlot::try_acquire(&self.sampling);
        async move {
            // The slot moves into the blocking task and is released when the
            // sample finishes, not when this future is dropped.
            let slot = slot.ok_or_else(|| {
                GuardianError::HealthUnreachable("sampler busy".to_string())
            })?;
            tokio::task::spawn_blocking(move || {
                let _slot = slot;
                publisher.query()
            })
            .await
            .map_err(|e| GuardianError::HealthUnreachable(format!("sampling task failed: {}", e)))
        }
    }
}

/// Owned counterpart of [`RefreshGuard`] that can cross into a blocking task.
struct SamplingSlot {
    flag: Arc<AtomicBool>,
}

impl SamplingSlot {
    fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                flag: Arc::clone(flag),
            })
    }
}

impl Drop for SamplingSlot {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Status vocabulary understood by the gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardianStatus {
    Normal,
    Brownout,
    Degraded,
    Emergency,
    Lockdown,
    /// No snapshot available
    Unknown,
    /// Any other string; blocked conservatively
    Unrecognized(String),
}

impl GuardianStatus {
    /// Parse a status string, case-insensitively.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "normal" => Self::Normal,
            "brownout" => Self::Brownout,
            "degraded" => Self::Degraded,
            "emergency" => Self::Emergency,
            "lockdown" => Self::Lockdown,
            "unknown" => Self::Unknown,
            _ => Self::Unrecognized(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Normal => "normal",
            Self::Brownout => "brownout",
            Self::Degraded => "degraded",
            Self::Emergency => "emergency",
            Self::Lockdown => "lockdown",
            Self::Unknown => "unknown",
            Self::Unrecognized(raw) => raw,
        }
    }
}

impl fmt::Display for GuardianStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gate-owned cache of the last good snapshot plus the failure streak.
///
/// Only replaced whole, under the gate's lock: a success swaps snapshot
/// and fetch time and clears the streak together; a failure only bumps
/// the streak.
#[derive(Debug, Clone, Default)]
pub struct CachedStatus {
    snapshot: Option<HealthReport>,
    fetched_at: Option<Instant>,
    unknown_streak: u32,
}

impl CachedStatus {
    /// Whether the snapshot is younger than `ttl` at `now`
    pub fn is_fresh(&self, now: Instant, ttl: std::time::Duration) -> bool {
        self.fetched_at
            .is_some_and(|at| now.saturating_duration_since(at) < ttl)
    }

    pub fn record_success(&mut self, report: HealthReport, at: Instant) {
        *self = Self {
            snapshot: Some(report),
            fetched_at: Some(at),
            unknown_streak: 0,
        };
    }

    pub fn record_failure(&mut self) {
        self.unknown_streak = self.unknown_streak.saturating_add(1);
    }

    pub fn snapshot(&self) -> Option<&HealthReport> {
        self.snapshot.as_ref()
    }

    pub fn unknown_streak(&self) -> u32 {
        self.unknown_streak
    }

    /// Status to decide on: the snapshot's state, or unknown without one
    pub fn status(&self) -> GuardianStatus {
        self.snapshot
            .as_ref()
            .map_or(GuardianStatus::Unknown, |r| GuardianStatus::parse(&r.state))
    }
}

/// JSON body of a blocked response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedBody {
    pub error: String,
    pub guardian_state: String,
    pub retry_after: u64,
}

/// Outcome of one admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub status_code: u16,
    pub message: String,
    pub headers: Vec<(&'static str, String)>,
    pub retry_after: Option<u64>,
    /// Status the decision was based on
    pub guardian_state: String,
}

impl AdmissionDecision {
    fn allow(status: &GuardianStatus) -> Self {
        Self {
            allowed: true,
            status_code: 200,
            message: String::new(),
            headers: Vec::new(),
            retry_after: None,
            guardian_state: status.as_str().to_string(),
        }
    }

    fn block(status: &GuardianStatus, retry_after: u64, message: String) -> Self {
        Self {
            allowed: false,
            status_code: 503,
            message,
            headers: vec![
                (RETRY_AFTER_HEADER, retry_after.to_string()),
                (STATE_HEADER, header_safe(status.as_str())),
            ],
            retry_after: Some(retry_after),
            guardian_state: status.as_str().to_string(),
        }
    }

    fn with_header(mut self, name: &'static str, value: &str) -> Self {
        self.headers.push((name, header_safe(value)));
        self
    }

    /// Decision for requests that skip the gate
    pub fn bypass() -> Self {
        Self {
            guardian_state: "bypass".to_string(),
            ..Self::allow(&GuardianStatus::Normal)
        }
    }

    /// Apply the decision table.
    pub fn for_status(
        status: &GuardianStatus,
        report: Option<&HealthReport>,
        unknown_streak: u32,
        hysteresis: u32,
    ) -> Self {
        match status {
            GuardianStatus::Normal => Self::allow(status),
            GuardianStatus::Brownout => Self::allow(status).with_header(STATE_HEADER, "brownout"),
            GuardianStatus::Degraded => {
                let warning = report
                    .map(|r| r.reason.as_str())
                    .filter(|r| !r.is_empty())
                    .unwrap_or("service degraded");
                let mut decision = Self::allow(status)
                    .with_header(STATE_HEADER, "degraded")
                    .with_header(WARNING_HEADER, warning);
                decision.message = warning.to_string();
                decision
            }
            GuardianStatus::Emergency => Self::block(
                status,
                15,
                "Service temporarily unavailable: resource emergency".to_string(),
            ),
            GuardianStatus::Lockdown => Self::block(
                status,
                60,
                "Service unavailable: guardian lockdown in effect".to_string(),
            ),
            GuardianStatus::Unknown if unknown_streak < hysteresis => {
                Self::allow(status).with_header(STATE_HEADER, "unknown")
            }
            GuardianStatus::Unknown => Self::block(
                status,
                5,
                "Service temporarily unavailable: health status unknown".to_string(),
            ),
            GuardianStatus::Unrecognized(raw) => {
                warn!("{}", GuardianError::UnrecognizedStatus(raw.clone()));
                Self::block(
                    status,
                    10,
                    format!("Service temporarily unavailable: unrecognized guardian state '{}'", raw),
                )
            }
        }
    }

    /// Body for blocked responses
    pub fn body(&self) -> Option<BlockedBody> {
        if self.allowed {
            return None;
        }
        Some(BlockedBody {
            error: self.message.clone(),
            guardian_state: self.guardian_state.clone(),
            retry_after: self.retry_after.unwrap_or(0),
        })
    }

    /// Short label for counters and logs
    pub fn outcome(&self) -> &'static str {
        match (self.allowed, self.headers.is_empty()) {
            _ if self.guardian_state == "bypass" => "bypass",
            (true, true) => "allow",
            (true, false) => "allow_degraded",
            (false, _) => "block",
        }
    }
}

fn header_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '?' })
        .collect()
}

/// Clears the refresh flag on drop, including when the request is cancelled.
struct RefreshGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RefreshGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Per-request admission gate shared across all request handlers.
pub struct AdmissionGate<S> {
    source: S,
    config: GateConfig,
    cache: Mutex<CachedStatus>,
    refreshing: AtomicBool,
}

impl<S> AdmissionGate<S> {
    /// Health source the gate polls
    pub fn source(&self) -> &S {
        &self.source
    }

    fn lock_cache(&self) -> MutexGuard<'_, CachedStatus> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<S: fmt::Debug> fmt::Debug for AdmissionGate<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("source", &self.source)
            .field("config", &self.config)
            .field("cache", &*self.lock_cache())
            .finish()
    }
}

impl<S: HealthSource> AdmissionGate<S> {
    /// Create a gate with default configuration
    pub fn new(source: S) -> Self {
        Self::with_config(source, GateConfig::default())
    }

    /// Create a gate with custom configuration
    pub fn with_config(source: S, config: GateConfig) -> Self {
        Self {
            source,
            config,
            cache: Mutex::new(CachedStatus::default()),
            refreshing: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Copy of the cache slot
    pub fn cached(&self) -> CachedStatus {
        self.lock_cache().clone()
    }

    pub fn unknown_streak(&self) -> u32 {
        self.lock_cache().unknown_streak
    }

    /// Decide whether a request for `path` may enter the pipeline.
    pub async fn check(&self, path: &str) -> AdmissionDecision {
        if self.config.is_bypassed(path) {
            return AdmissionDecision::bypass();
        }

        let view = self.resolve().await;
        let decision = AdmissionDecision::for_status(
            &view.status(),
            view.snapshot(),
            view.unknown_streak(),
            self.config.unknown_hysteresis_count,
        );
        if !decision.allowed {
            debug!(
                "rejecting {}: state={}, retry_after={:?}",
                path, decision.guardian_state, decision.retry_after
            );
        }
        decision
    }

    /// Resolve the cache slot to decide on, refreshing it when stale.
    async fn resolve(&self) -> CachedStatus {
        let ttl = self.config.cache_ttl();
        {
            let cache = self.lock_cache();
            if cache.is_fresh(Instant::now(), ttl) {
                return cache.clone();
            }
        }

        let Some(_guard) = RefreshGuard::try_acquire(&self.refreshing) else {
            debug!("health refresh already in flight; using cached status");
            return self.cached();
        };

        // Another request may have refreshed between the check and the acquire.
        {
            let cache = self.lock_cache();
            if cache.is_fresh(Instant::now(), ttl) {
                return cache.clone();
            }
        }

        let fetch_timeout = self.config.fetch_timeout();
        let result = match timeout(fetch_timeout, self.source.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(GuardianError::Timeout {
                timeout_ms: fetch_timeout.as_millis() as u64,
            }),
        };

        let mut cache = self.lock_cache();
        match result {
            Ok(report) => cache.record_success(report, Instant::now()),
            Err(e) => {
                cache.record_failure();
                warn!(
                    "guardian health fetch failed ({} consecutive): {}",
                    cache.unknown_streak, e
                );
            }
        }
        cache.clone()
    }
}
