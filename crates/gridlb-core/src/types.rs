//! Request, response, and measurement types shared across gridlb crates.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Unique identifier for a worker VM.
pub type WorkerId = String;

/// Workload parameters, kept sorted by key.
pub type Params = BTreeMap<String, String>;

// ── Requests ──────────────────────────────────────────────────────

/// An inbound request for a named workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRequest {
    /// Workload name (e.g. `fifteenpuzzle`).
    pub workload: String,
    /// Sizing parameters, opaque beyond complexity estimation.
    pub params: Params,
}

impl WorkloadRequest {
    pub fn new(workload: impl Into<String>, params: Params) -> Self {
        Self {
            workload: workload.into(),
            params,
        }
    }

    /// Canonical `k=v#k=v` rendering of the parameters, sorted by key.
    pub fn canonical_params(&self) -> String {
        canonical_params(&self.params)
    }

    /// Percent-encoded `k=v&k=v` query string for relaying to a worker.
    ///
    /// Parameters arrive already decoded, so reserved characters in a value
    /// must be escaped again before they go back on the wire.
    pub fn query_string(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.params.iter())
            .finish()
    }
}

/// Render parameters deterministically: sorted by key, `k=v` joined by `#`.
///
/// This string is both the local cache key suffix and the durable store's
/// sort key, so it must not change between releases.
pub fn canonical_params(params: &Params) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("#")
}

// ── Responses ─────────────────────────────────────────────────────

/// Result of relaying a request to a worker or a serverless function.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    pub status: u16,
    pub body: Bytes,
    /// Measured execution statistics, when the worker was asked to capture them.
    pub stats: Option<ExecutionStats>,
}

impl WorkerResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: ExecutionStats) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Post-execution statistics reported by an instrumented worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionStats {
    /// Executed basic blocks.
    pub nblocks: u64,
    /// Executed methods.
    pub nmethod: u64,
    /// Executed instructions.
    pub ninsts: u64,
    pub ndata_writes: u64,
    pub ndata_reads: u64,
}
