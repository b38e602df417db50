// src/oracle.rs
//
// Oracle HTTP client. Every call is a JSON POST with a tight per-call
// timeout and no retries: the oracle is an optimization, never a dependency,
// and callers decide the local fallback when it is unreachable. `/report`
// responses are proxied verbatim back to the reporting filter, so that call
// returns the raw status and body instead of a decoded structure.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::metrics::StatsSnapshot;
use crate::types::{ReportType, SyncResponse, Verdict};

const ANALYZE_TIMEOUT: Duration = Duration::from_secs(4);
const REPORT_TIMEOUT: Duration = Duration::from_secs(5);
const SYNC_TIMEOUT: Duration = Duration::from_secs(5);
const STATS_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle unreachable: {0}")]
    Transport(String),
    #[error("oracle returned status {0}")]
    Status(u16),
    #[error("oracle response malformed: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait Oracle: Send + Sync + 'static {
    /// Ask for a verdict on one digest.
    async fn analyze(&self, node_id: &str, digest: &str) -> Result<Verdict, OracleError>;

    /// Forward a spam/ham report. The oracle's status and body are returned
    /// untouched for proxying.
    async fn report(
        &self,
        node_id: &str,
        signatures: &[String],
        report_type: ReportType,
    ) -> Result<(u16, String), OracleError>;

    /// Pull the next delta of the global band index.
    async fn sync(
        &self,
        node_id: &str,
        current_seq: i64,
        version: &str,
    ) -> Result<SyncResponse, OracleError>;

    /// Push one cycle of rolled-up counters.
    async fn stats(&self, node_id: &str, snapshot: &StatsSnapshot) -> Result<(), OracleError>;
}

// ── HTTP implementation ───────────────────────────────────────────────────────

pub struct HttpOracle {
    client:   reqwest::Client,
    base_url: String,
}

impl HttpOracle {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client:   reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl Oracle for HttpOracle {
    async fn analyze(&self, node_id: &str, digest: &str) -> Result<Verdict, OracleError> {
        let resp = self
            .client
            .post(self.url("/analyze"))
            .timeout(ANALYZE_TIMEOUT)
            .json(&json!({ "node_id": node_id, "email_body_hash": digest }))
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(OracleError::Status(resp.status().as_u16()));
        }

        #[derive(serde::Deserialize)]
        struct Envelope {
            result: Verdict,
        }
        let envelope: Envelope = resp
            .json()
            .await
            .map_err(|e| OracleError::Malformed(e.to_string()))?;
        Ok(envelope.result)
    }

    async fn report(
        &self,
        node_id: &str,
        signatures: &[String],
        report_type: ReportType,
    ) -> Result<(u16, String), OracleError> {
        let resp = self
            .client
            .post(self.url("/report"))
            .timeout(REPORT_TIMEOUT)
            .json(&json!({
                "node_id": node_id,
                "signatures": signatures,
                "report_type": report_type,
            }))
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        debug!(status, "oracle report forwarded");
        Ok((status, body))
    }

    async fn sync(
        &self,
        node_id: &str,
        current_seq: i64,
        version: &str,
    ) -> Result<SyncResponse, OracleError> {
        let resp = self
            .client
            .post(self.url("/sync"))
            .timeout(SYNC_TIMEOUT)
            .json(&json!({
                "node_id": node_id,
                "current_seq": current_seq,
                "version": version,
            }))
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(OracleError::Status(resp.status().as_u16()));
        }
        resp.json()
            .await
            .map_err(|e| OracleError::Malformed(e.to_string()))
    }

    async fn stats(&self, node_id: &str, snapshot: &StatsSnapshot) -> Result<(), OracleError> {
        let mut payload = serde_json::to_value(snapshot)
            .map_err(|e| OracleError::Malformed(e.to_string()))?;
        payload["node_id"] = json!(node_id);
        let resp = self
            .client
            .post(self.url("/stats"))
            .timeout(STATS_TIMEOUT)
            .json(&payload)
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(OracleError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

// ── Scripted implementation ───────────────────────────────────────────────────

/// Scripted oracle for tests and for development without network access:
/// every call records its input and answers from a programmable slot, where
/// `None` plays an unreachable oracle.
#[derive(Default)]
pub struct ScriptedOracle {
    pub analyze_verdict: std::sync::Mutex<Option<Verdict>>,
    pub report_reply:    std::sync::Mutex<Option<(u16, String)>>,
    pub sync_reply:      std::sync::Mutex<Option<SyncResponse>>,
    pub stats_reachable: std::sync::atomic::AtomicBool,

    pub analyze_calls: std::sync::Mutex<Vec<String>>,
    pub report_calls:  std::sync::Mutex<Vec<(Vec<String>, ReportType)>>,
    pub stats_calls:   std::sync::Mutex<Vec<StatsSnapshot>>,
}

impl ScriptedOracle {
    /// An oracle that accepts reports with a plain 200 and fails the rest.
    pub fn accepting_reports() -> Self {
        let oracle = Self::default();
        *oracle.report_reply.lock().unwrap() = Some((200, r#"{"status":"ok"}"#.to_string()));
        oracle
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn analyze(&self, _node_id: &str, digest: &str) -> Result<Verdict, OracleError> {
        self.analyze_calls.lock().unwrap().push(digest.to_string());
        self.analyze_verdict
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| OracleError::Transport("scripted: unreachable".into()))
    }

    async fn report(
        &self,
        _node_id: &str,
        signatures: &[String],
        report_type: ReportType,
    ) -> Result<(u16, String), OracleError> {
        self.report_calls
            .lock()
            .unwrap()
            .push((signatures.to_vec(), report_type));
        self.report_reply
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| OracleError::Transport("scripted: unreachable".into()))
    }

    async fn sync(
        &self,
        _node_id: &str,
        _current_seq: i64,
        _version: &str,
    ) -> Result<SyncResponse, OracleError> {
        self.sync_reply
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| OracleError::Transport("scripted: unreachable".into()))
    }

    async fn stats(&self, _node_id: &str, snapshot: &StatsSnapshot) -> Result<(), OracleError> {
        if !self.stats_reachable.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(OracleError::Transport("scripted: unreachable".into()));
        }
        self.stats_calls.lock().unwrap().push(*snapshot);
        Ok(())
    }
}
