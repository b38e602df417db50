// src/types.rs
//
// Shared domain types flowing through the guardian: typed signatures,
// verdicts, scan records, and the oracle sync protocol.

use serde::{Deserialize, Serialize};

/// Source of a signature. Drives the distance threshold used when matching:
/// the more mutation-prone the source, the more lenient the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureKind {
    Normalized,  // canonicalized body - most lenient
    Raw,         // text + html as received
    Url,         // joined distinct URLs - strict (phishing)
    Subject,     // repeated subject line
    Attachment,  // decoded attachment bytes - strictest
}

impl SignatureKind {
    /// Distance at or under which a candidate counts as a match.
    pub fn threshold(self) -> u32 {
        match self {
            Self::Normalized => 70,
            Self::Raw        => 60,
            Self::Url        => 50,
            Self::Subject    => 55,
            Self::Attachment => 45,
        }
    }
}

impl std::fmt::Display for SignatureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normalized => write!(f, "normalized"),
            Self::Raw        => write!(f, "raw"),
            Self::Url        => write!(f, "url"),
            Self::Subject    => write!(f, "subject"),
            Self::Attachment => write!(f, "attachment"),
        }
    }
}

/// Distance window above the per-kind threshold that still surfaces as a
/// non-blocking soft-spam warning.
pub const SOFT_SPAM_DELTA: u32 = 20;

/// A digest paired with the kind of content it was computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedSignature {
    pub digest: String,
    pub kind:   SignatureKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Allow,
    Spam,
    SoftSpam,
    /// Anything else the oracle may answer with. Never produced locally;
    /// treated as non-spam wherever it is read back.
    #[serde(other)]
    Other,
}

/// Outcome of one analysis, also the JSON shape cached per digest under the
/// oracle verdict cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub proximity_match: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_type: Option<String>,
}

impl Verdict {
    pub fn allow() -> Self {
        Self {
            action:          Action::Allow,
            label:           None,
            proximity_match: false,
            distance:        None,
            confidence:      None,
            match_type:      None,
        }
    }

    pub fn is_spam(&self) -> bool {
        self.action == Action::Spam
    }
}

/// What `/analyze` persists per message-id so a later `/report` can learn
/// from the exact signatures the scan produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    pub hashes:    Vec<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportType {
    Spam,
    Ham,
}

impl std::fmt::Display for ReportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spam => write!(f, "spam"),
            Self::Ham  => write!(f, "ham"),
        }
    }
}

/// Body of `POST /report`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportRequest {
    #[serde(rename = "message-id")]
    pub message_id:  String,
    pub report_type: ReportType,
}

// ── Oracle sync protocol ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncAction {
    #[serde(rename = "UPDATE_DELTA")]
    UpdateDelta,
    #[serde(rename = "RESET_DB")]
    ResetDb,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOpAction {
    Add,
    Del,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOp {
    pub action: SyncOpAction,
    pub bands:  Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub new_seq: i64,
    pub action:  SyncAction,
    #[serde(default)]
    pub ops:     Vec<SyncOp>,
}
