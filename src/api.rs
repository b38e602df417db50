// src/api.rs
//
// The public HTTP surface: /status, /analyze, /report, /whitelist and
// /metrics, served on a loopback bind for trusted-network callers (MTA
// filters and delivery hooks). No authentication by design; exposure is
// controlled at the bind address.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use http_body_util::BodyExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::learner::{self, ReportOutcome};
use crate::matcher;
use crate::oracle::Oracle;
use crate::signature::{self, sender_identities};
use crate::store::{keys, message_id_hash, IndexStore};
use crate::types::{Action, ReportRequest, ScanRecord, Verdict};
use crate::{App, VERSION};

/// Largest message body processed; anything longer is truncated, not
/// rejected, matching what the filter integrations expect.
pub const MAX_MESSAGE_SIZE: usize = 15 * 1024 * 1024;

/// How long a scan record stays available for reports.
const SCAN_RECORD_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

pub fn router<S: IndexStore, O: Oracle>(app: Arc<App<S, O>>) -> Router {
    Router::new()
        .route("/status", get(status::<S, O>))
        .route("/analyze", post(analyze::<S, O>))
        .route("/report", post(report::<S, O>))
        .route(
            "/whitelist",
            get(whitelist_list::<S, O>)
                .post(whitelist_add::<S, O>)
                .delete(whitelist_remove::<S, O>),
        )
        .route("/metrics", get(metrics_text::<S, O>))
        .layer(middleware::from_fn(log_request))
        .with_state(app)
}

async fn log_request(request: Request, next: Next) -> Response {
    debug!(method = %request.method(), path = %request.uri().path(), "request");
    next.run(request).await
}

fn store_unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "Store unavailable").into_response()
}

// ── /status ───────────────────────────────────────────────────────────────────

async fn status<S: IndexStore, O: Oracle>(State(app): State<Arc<App<S, O>>>) -> Response {
    let current_seq = match app.store.get_i64(keys::SYNC_SEQ).await {
        Ok(seq) => seq.unwrap_or(0),
        Err(err) => {
            warn!(%err, "status probe failed");
            return store_unavailable();
        }
    };

    // Heal the persisted identity if the store lost it.
    if let Ok(None) = app.store.get(keys::NODE_ID).await {
        let _ = app.store.set(keys::NODE_ID, &app.node_id).await;
    }

    let mut response = axum::Json(json!({
        "node_id": app.node_id,
        "current_seq": current_seq,
        "version": VERSION,
    }))
    .into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

// ── /analyze ──────────────────────────────────────────────────────────────────

async fn analyze<S: IndexStore, O: Oracle>(
    State(app): State<Arc<App<S, O>>>,
    request: Request,
) -> Response {
    app.metrics.record_scan();

    let body = match read_truncated(request.into_body()).await {
        Ok(body) => body,
        Err(err) => {
            warn!(%err, "failed to read analyze body");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error reading body").into_response();
        }
    };

    let envelope = match signature::parse_envelope(&body) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(%err, "rejecting unparseable message");
            return (StatusCode::BAD_REQUEST, "Invalid MIME").into_response();
        }
    };

    // Whitelisted senders bypass analysis entirely: no signatures, no scan
    // record, deterministic allow.
    if let Some(from) = envelope.from.as_deref() {
        match whitelist_reason(&app, from).await {
            Ok(Some(reason)) => {
                info!(reason, "whitelisted sender allowed");
                return axum::Json(json!({
                    "action": Action::Allow,
                    "label": "whitelisted",
                    "proximity_match": false,
                    "whitelisted": true,
                    "reason": reason,
                    "hashes": [],
                }))
                .into_response();
            }
            Ok(None) => {}
            Err(_) => return store_unavailable(),
        }
    }

    let signatures = signature::extract_signatures(&envelope);
    let hashes: Vec<String> = signatures.iter().map(|s| s.digest.clone()).collect();

    // Persist the scan record off the request path; the store adapter's own
    // deadline bounds the write.
    if let Some(message_id) = envelope.message_id.clone() {
        let store = Arc::clone(&app.store);
        let record = ScanRecord { hashes: hashes.clone(), timestamp: Utc::now().timestamp() };
        tokio::spawn(async move {
            let key = keys::scan_record(&message_id_hash(&message_id));
            let encoded = match serde_json::to_string(&record) {
                Ok(encoded) => encoded,
                Err(_) => return,
            };
            if let Err(err) = store.set_ex(&key, &encoded, SCAN_RECORD_TTL).await {
                warn!(%err, "scan record write failed");
            }
        });
    }

    let verdict = match matcher::run(&app, &signatures).await {
        Ok(verdict) => verdict,
        Err(err) => {
            warn!(%err, "analysis aborted, store unavailable");
            return store_unavailable();
        }
    };

    analyze_response(verdict, hashes)
}

fn analyze_response(verdict: Verdict, hashes: Vec<String>) -> Response {
    let mut body = serde_json::to_value(&verdict).unwrap_or_else(|_| json!({}));
    body["hashes"] = json!(hashes);
    axum::Json(body).into_response()
}

/// Read at most [`MAX_MESSAGE_SIZE`] bytes of the body, discarding the rest.
async fn read_truncated(body: Body) -> Result<Vec<u8>, axum::Error> {
    let mut body = body;
    let mut buf = Vec::new();
    while let Some(frame) = body.frame().await {
        let frame = frame?;
        let Some(data) = frame.data_ref() else {
            continue;
        };
        let room = MAX_MESSAGE_SIZE - buf.len();
        if data.len() >= room {
            buf.extend_from_slice(&data[..room]);
            break;
        }
        buf.extend_from_slice(data);
    }
    Ok(buf)
}

async fn whitelist_reason<S: IndexStore, O: Oracle>(
    app: &App<S, O>,
    from: &str,
) -> Result<Option<String>, crate::store::StoreError> {
    let (email, domain) = sender_identities(from);
    if let Some(domain) = domain {
        if app.store.sismember(keys::WHITELIST_DOMAIN, &domain).await? {
            return Ok(Some(format!("domain:{domain}")));
        }
    }
    if let Some(email) = email {
        if app.store.sismember(keys::WHITELIST_EMAIL, &email).await? {
            return Ok(Some(format!("email:{email}")));
        }
    }
    Ok(None)
}

// ── /report ───────────────────────────────────────────────────────────────────

async fn report<S: IndexStore, O: Oracle>(
    State(app): State<Arc<App<S, O>>>,
    body: axum::body::Bytes,
) -> Response {
    let request: ReportRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid JSON body").into_response(),
    };

    let outcome =
        match learner::handle_report(&app, &request.message_id, request.report_type).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%err, "report aborted, store unavailable");
                return store_unavailable();
            }
        };

    match outcome {
        ReportOutcome::Duplicate => (
            StatusCode::CONFLICT,
            axum::Json(json!({"status": "duplicate", "message": "Already reported"})),
        )
            .into_response(),
        ReportOutcome::NoScanData => {
            (StatusCode::NOT_FOUND, "No scan data found").into_response()
        }
        ReportOutcome::EmptyHashes => {
            (StatusCode::BAD_REQUEST, "No hashes to report").into_response()
        }
        ReportOutcome::KnownLocally => axum::Json(json!({
            "status": "skipped_oracle",
            "reason": "known_locally",
        }))
        .into_response(),
        ReportOutcome::Forwarded { status, body } => {
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response()
        }
        ReportOutcome::OracleUnreachable => {
            (StatusCode::SERVICE_UNAVAILABLE, "Oracle unreachable").into_response()
        }
    }
}

// ── /whitelist ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WhitelistEntry {
    #[serde(rename = "type")]
    kind:  WhitelistKind,
    value: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WhitelistKind {
    Domain,
    Email,
}

impl WhitelistKind {
    fn key(self) -> &'static str {
        match self {
            Self::Domain => keys::WHITELIST_DOMAIN,
            Self::Email => keys::WHITELIST_EMAIL,
        }
    }
}

async fn whitelist_add<S: IndexStore, O: Oracle>(
    State(app): State<Arc<App<S, O>>>,
    body: axum::body::Bytes,
) -> Response {
    let Ok(entry) = serde_json::from_slice::<WhitelistEntry>(&body) else {
        return (StatusCode::BAD_REQUEST, "Invalid JSON body").into_response();
    };
    let value = entry.value.trim().to_lowercase();
    if value.is_empty() {
        return (StatusCode::BAD_REQUEST, "Empty value").into_response();
    }
    match app.store.sadd(entry.kind.key(), &value).await {
        Ok(()) => axum::Json(json!({"status": "ok"})).into_response(),
        Err(_) => store_unavailable(),
    }
}

async fn whitelist_remove<S: IndexStore, O: Oracle>(
    State(app): State<Arc<App<S, O>>>,
    body: axum::body::Bytes,
) -> Response {
    let Ok(entry) = serde_json::from_slice::<WhitelistEntry>(&body) else {
        return (StatusCode::BAD_REQUEST, "Invalid JSON body").into_response();
    };
    let value = entry.value.trim().to_lowercase();
    match app.store.srem(entry.kind.key(), &value).await {
        Ok(()) => axum::Json(json!({"status": "ok"})).into_response(),
        Err(_) => store_unavailable(),
    }
}

async fn whitelist_list<S: IndexStore, O: Oracle>(
    State(app): State<Arc<App<S, O>>>,
) -> Response {
    let domains = app.store.smembers(keys::WHITELIST_DOMAIN).await;
    let emails = app.store.smembers(keys::WHITELIST_EMAIL).await;
    match (domains, emails) {
        (Ok(domain), Ok(email)) => {
            axum::Json(json!({"domain": domain, "email": email})).into_response()
        }
        _ => store_unavailable(),
    }
}

// ── /metrics ──────────────────────────────────────────────────────────────────

async fn metrics_text<S: IndexStore, O: Oracle>(
    State(app): State<Arc<App<S, O>>>,
) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        app.metrics.render_prometheus(),
    )
        .into_response()
}
