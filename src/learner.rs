// src/learner.rs
//
// The report pipeline behind POST /report. A report resolves each scanned
// digest to a canonical in-index digest when a near neighbor already exists,
// so variants of one campaign collapse onto a single score instead of
// bloating the index. Spam raises the score and (re)installs the bands; ham
// lowers the score of a known neighbor and is a no-op against unknown
// content. Duplicate reports are absorbed by a SETNX guard keyed on
// (message-id, report-type), which makes the endpoint idempotent for a day.

use std::time::Duration;

use tracing::{debug, info};

use crate::fingerprint::{self, MIN_BAND_MATCHES};
use crate::oracle::Oracle;
use crate::store::{keys, message_id_hash, IndexStore, StoreError};
use crate::types::{ReportType, ScanRecord};
use crate::App;

/// Duplicate-report suppression window.
const REPORT_GUARD_TTL: Duration = Duration::from_secs(24 * 3600);

/// A reported digest within this distance of an indexed one folds onto it.
const NEIGHBOR_THRESHOLD: u32 = 70;

/// How a report request resolved; the HTTP layer maps these onto statuses.
#[derive(Debug)]
pub enum ReportOutcome {
    /// Same (message-id, report-type) seen within the guard window.
    Duplicate,
    /// No scan record for this message-id (other node, or past its TTL).
    NoScanData,
    /// A scan record exists but carries no signatures.
    EmptyHashes,
    /// Spam already known locally; nothing to escalate.
    KnownLocally,
    /// Forwarded; the oracle's reply is proxied verbatim.
    Forwarded { status: u16, body: String },
    /// Forwarding failed at the transport level.
    OracleUnreachable,
}

pub async fn handle_report<S: IndexStore, O: Oracle>(
    app: &App<S, O>,
    message_id: &str,
    report_type: ReportType,
) -> Result<ReportOutcome, StoreError> {
    let mid_hash = message_id_hash(message_id);

    let guard_key = keys::report_guard(&mid_hash, &report_type.to_string());
    if !app
        .store
        .set_nx_ex(&guard_key, "1", REPORT_GUARD_TTL)
        .await?
    {
        debug!(message_id, %report_type, "duplicate report ignored");
        return Ok(ReportOutcome::Duplicate);
    }

    let Some(raw) = app.store.get(&keys::scan_record(&mid_hash)).await? else {
        return Ok(ReportOutcome::NoScanData);
    };
    let record: ScanRecord = match serde_json::from_str(&raw) {
        Ok(record) => record,
        Err(_) => return Ok(ReportOutcome::EmptyHashes),
    };
    if record.hashes.is_empty() {
        return Ok(ReportOutcome::EmptyHashes);
    }

    info!(message_id, %report_type, hashes = record.hashes.len(), "processing report");

    let mut known_locally = false;
    for digest in &record.hashes {
        if learn_digest(app, digest, report_type).await? {
            known_locally = true;
        }
    }

    if report_type == ReportType::Spam && known_locally {
        info!(message_id, "skipping oracle report, content already known locally");
        return Ok(ReportOutcome::KnownLocally);
    }

    match app
        .oracle
        .report(&app.node_id, &record.hashes, report_type)
        .await
    {
        Ok((status, body)) => Ok(ReportOutcome::Forwarded { status, body }),
        Err(err) => {
            debug!(%err, "oracle report failed");
            Ok(ReportOutcome::OracleUnreachable)
        }
    }
}

/// Apply one report to one digest. Returns whether a near neighbor was
/// already indexed (which is what lets a spam report skip the oracle).
async fn learn_digest<S: IndexStore, O: Oracle>(
    app: &App<S, O>,
    digest: &str,
    report_type: ReportType,
) -> Result<bool, StoreError> {
    let bands = fingerprint::bands(digest);
    if bands.is_empty() {
        // Malformed digests never enter the index.
        debug!(digest, "skipping malformed digest in report");
        return Ok(false);
    }

    let band_keys: Vec<String> = bands.iter().map(|b| keys::local_band(b)).collect();
    let exists = app.store.exists_many(&band_keys).await?;
    let matched: Vec<String> = band_keys
        .into_iter()
        .zip(exists)
        .filter(|(_, hit)| *hit)
        .map(|(key, _)| key)
        .collect();

    // Nearest indexed neighbor, if enough bands collide to look for one.
    let mut nearest: Option<(String, u32)> = None;
    if matched.len() >= MIN_BAND_MATCHES {
        let member_lists = app.store.smembers_many(&matched).await?;
        let mut seen = std::collections::HashSet::new();
        let mut candidates = Vec::new();
        for members in member_lists {
            for member in members {
                if seen.insert(member.clone()) {
                    candidates.push(member);
                }
            }
        }
        for (candidate, dist) in fingerprint::batch_distance(digest, &candidates) {
            if nearest.as_ref().map_or(true, |(_, best)| dist < *best) {
                nearest = Some((candidate, dist));
            }
        }
    }

    let near = nearest
        .as_ref()
        .filter(|entry| entry.1 <= NEIGHBOR_THRESHOLD);
    let target = near.map_or(digest, |entry| entry.0.as_str());

    let retention = app.tunables.retention();
    let score_key = keys::local_score(target);

    match report_type {
        ReportType::Spam => {
            let score = app
                .store
                .incr_by(&score_key, app.tunables.spam_weight())
                .await?;
            let entries: Vec<(String, String)> = fingerprint::bands(target)
                .iter()
                .map(|b| (keys::local_band(b), target.to_string()))
                .collect();
            app.store.sadd_many(&entries, Some(retention)).await?;
            app.store.expire(&score_key, retention).await?;
            info!(target, score, "learned spam digest");
            Ok(near.is_some())
        }
        ReportType::Ham => {
            if near.is_some() {
                let score = app
                    .store
                    .incr_by(&score_key, -app.tunables.ham_weight())
                    .await?;
                // Keep the entry alive even when negative so later ham
                // reports can depress it further.
                app.store.expire(&score_key, retention).await?;
                info!(target, score, "ham report applied");
            }
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Tunables};
    use crate::oracle::ScriptedOracle;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    const SPAM_BODY: &str = "Your account has been locked pending verification. Review \
        the attached statement and confirm your details through the secure portal \
        before access is suspended permanently.";

    fn test_app() -> Arc<App<MemoryStore, ScriptedOracle>> {
        let cfg = Config::load(None).unwrap();
        App::new(
            MemoryStore::new(),
            ScriptedOracle::accepting_reports(),
            Tunables::from_config(&cfg),
            "node-test".to_string(),
        )
    }

    async fn store_scan(app: &App<MemoryStore, ScriptedOracle>, message_id: &str, hashes: Vec<String>) {
        let record = ScanRecord { hashes, timestamp: 0 };
        app.store
            .set(
                &keys::scan_record(&message_id_hash(message_id)),
                &serde_json::to_string(&record).unwrap(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn spam_report_installs_bands_and_score() {
        let app = test_app();
        let digest = fingerprint::compute(SPAM_BODY.as_bytes()).unwrap();
        store_scan(&app, "<m1@x>", vec![digest.clone()]).await;

        let outcome = handle_report(&app, "<m1@x>", ReportType::Spam).await.unwrap();
        assert!(matches!(outcome, ReportOutcome::Forwarded { status: 200, .. }));

        for band in fingerprint::bands(&digest) {
            assert!(app
                .store
                .sismember(&keys::local_band(&band), &digest)
                .await
                .unwrap());
        }
        assert_eq!(
            app.store.get_i64(&keys::local_score(&digest)).await.unwrap(),
            Some(1)
        );
        assert_eq!(app.oracle.report_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_report_is_suppressed() {
        let app = test_app();
        let digest = fingerprint::compute(SPAM_BODY.as_bytes()).unwrap();
        store_scan(&app, "<m1@x>", vec![digest.clone()]).await;

        let first = handle_report(&app, "<m1@x>", ReportType::Spam).await.unwrap();
        assert!(matches!(first, ReportOutcome::Forwarded { .. }));
        let second = handle_report(&app, "<m1@x>", ReportType::Spam).await.unwrap();
        assert!(matches!(second, ReportOutcome::Duplicate));

        // The score was incremented exactly once.
        assert_eq!(
            app.store.get_i64(&keys::local_score(&digest)).await.unwrap(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn ham_after_spam_is_a_separate_guard() {
        let app = test_app();
        let digest = fingerprint::compute(SPAM_BODY.as_bytes()).unwrap();
        store_scan(&app, "<m1@x>", vec![digest.clone()]).await;

        handle_report(&app, "<m1@x>", ReportType::Spam).await.unwrap();
        let ham = handle_report(&app, "<m1@x>", ReportType::Ham).await.unwrap();
        assert!(matches!(ham, ReportOutcome::Forwarded { .. }));

        // spam_weight - ham_weight = 1 - 2 = -1.
        assert_eq!(
            app.store.get_i64(&keys::local_score(&digest)).await.unwrap(),
            Some(-1)
        );
    }

    #[tokio::test]
    async fn ham_against_unknown_content_is_a_noop() {
        let app = test_app();
        let digest = fingerprint::compute(SPAM_BODY.as_bytes()).unwrap();
        store_scan(&app, "<m1@x>", vec![digest.clone()]).await;

        let outcome = handle_report(&app, "<m1@x>", ReportType::Ham).await.unwrap();
        // Still forwarded to the oracle, but no local state was created.
        assert!(matches!(outcome, ReportOutcome::Forwarded { .. }));
        assert_eq!(
            app.store.get_i64(&keys::local_score(&digest)).await.unwrap(),
            None
        );
        assert!(app.store.keys_with_prefix("lg_f:").is_empty());
    }

    #[tokio::test]
    async fn missing_scan_record_is_reported() {
        let app = test_app();
        let outcome = handle_report(&app, "<unknown@x>", ReportType::Spam)
            .await
            .unwrap();
        assert!(matches!(outcome, ReportOutcome::NoScanData));
    }

    #[tokio::test]
    async fn empty_hashes_are_rejected() {
        let app = test_app();
        store_scan(&app, "<m1@x>", vec![]).await;
        let outcome = handle_report(&app, "<m1@x>", ReportType::Spam).await.unwrap();
        assert!(matches!(outcome, ReportOutcome::EmptyHashes));
    }

    #[tokio::test]
    async fn second_spam_variant_folds_onto_the_first_digest() {
        let app = test_app();
        let digest = fingerprint::compute(SPAM_BODY.as_bytes()).unwrap();
        store_scan(&app, "<m1@x>", vec![digest.clone()]).await;
        handle_report(&app, "<m1@x>", ReportType::Spam).await.unwrap();

        // Re-report the exact same digest under a fresh message-id: the
        // canonical target is the already-indexed digest and the oracle is
        // spared.
        store_scan(&app, "<m2@x>", vec![digest.clone()]).await;
        let outcome = handle_report(&app, "<m2@x>", ReportType::Spam).await.unwrap();
        assert!(matches!(outcome, ReportOutcome::KnownLocally));
        assert_eq!(
            app.store.get_i64(&keys::local_score(&digest)).await.unwrap(),
            Some(2)
        );
        assert_eq!(app.oracle.report_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_digest_in_record_is_skipped() {
        let app = test_app();
        let good = fingerprint::compute(SPAM_BODY.as_bytes()).unwrap();
        store_scan(
            &app,
            "<m1@x>",
            vec!["not-a-digest".to_string(), good.clone()],
        )
        .await;

        handle_report(&app, "<m1@x>", ReportType::Spam).await.unwrap();
        assert_eq!(
            app.store.get_i64(&keys::local_score("not-a-digest")).await.unwrap(),
            None
        );
        assert_eq!(
            app.store.get_i64(&keys::local_score(&good)).await.unwrap(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn unreachable_oracle_is_surfaced() {
        let app = test_app();
        *app.oracle.report_reply.lock().unwrap() = None;
        let digest = fingerprint::compute(SPAM_BODY.as_bytes()).unwrap();
        store_scan(&app, "<m1@x>", vec![digest]).await;

        let outcome = handle_report(&app, "<m1@x>", ReportType::Spam).await.unwrap();
        assert!(matches!(outcome, ReportOutcome::OracleUnreachable));
    }

    #[tokio::test]
    async fn learning_keys_carry_the_sliding_retention() {
        let app = test_app();
        let digest = fingerprint::compute(SPAM_BODY.as_bytes()).unwrap();
        store_scan(&app, "<m1@x>", vec![digest.clone()]).await;
        handle_report(&app, "<m1@x>", ReportType::Spam).await.unwrap();

        let band_key = keys::local_band(&fingerprint::bands(&digest)[0]);
        assert!(app.store.ttl_of(&band_key).unwrap() > Duration::from_secs(14 * 24 * 3600));
        assert!(
            app.store.ttl_of(&keys::local_score(&digest)).unwrap()
                > Duration::from_secs(14 * 24 * 3600)
        );
    }
}
