// src/matcher.rs
//
// The classification engine. Each typed signature walks four lookup stages
// in a fixed order, from cheapest to most expensive:
//
//   1. exact oracle-verdict cache
//   2. oracle-cache LSH (recent oracle spam and its near variants)
//   3. local-learning LSH (operator spam reports)
//   4. global oracle band index, escalating to a network call
//
// Two short-circuit scopes exist: a spam hit in stages 1, 2 or 4 terminates
// the whole analysis, while stage 3 only ever ends the current signature and
// lets the remaining signatures run. Stage 3 additionally swallows stage 4
// whenever enough local bands collide, which is what keeps oracle traffic
// rare. The per-signature outcome enum makes those scopes explicit.

use tracing::{debug, info};

use crate::fingerprint::{self, MIN_BAND_MATCHES};
use crate::oracle::Oracle;
use crate::store::{keys, IndexStore, StoreError};
use crate::types::{Action, SignatureKind, TypedSignature, Verdict, SOFT_SPAM_DELTA};
use crate::App;

use std::time::Duration;

/// TTL for cached oracle spam verdicts and the oracle-cache band index.
const ORACLE_SPAM_TTL: Duration = Duration::from_secs(3600);
/// TTL for cached oracle non-spam verdicts.
const ORACLE_MISS_TTL: Duration = Duration::from_secs(300);

/// How one signature left the stage walk.
enum SignatureOutcome {
    /// A final verdict was reached; skip the remaining signatures.
    Terminated,
    /// This signature is settled; evaluate the next one.
    NextSignature,
}

/// Confidence of a match at `distance` under `threshold`: 1.0 for identical
/// content, tapering to 0.5 at the threshold. Observability only.
fn confidence(distance: u32, threshold: u32) -> f64 {
    let c = 1.0 - (f64::from(distance) / f64::from(threshold)) * 0.5;
    c.max(0.5)
}

/// Run the full analysis over the extracted signatures.
pub async fn run<S: IndexStore, O: Oracle>(
    app: &App<S, O>,
    signatures: &[TypedSignature],
) -> Result<Verdict, StoreError> {
    let mut verdict = Verdict::allow();

    for signature in signatures {
        match evaluate_signature(app, signature, &mut verdict).await? {
            SignatureOutcome::Terminated => break,
            SignatureOutcome::NextSignature => {
                // Stage 3 spam ends its signature, not the analysis; the
                // short-circuit for the rest of the message happens here.
                if verdict.is_spam() {
                    break;
                }
            }
        }
    }

    Ok(verdict)
}

async fn evaluate_signature<S: IndexStore, O: Oracle>(
    app: &App<S, O>,
    signature: &TypedSignature,
    verdict: &mut Verdict,
) -> Result<SignatureOutcome, StoreError> {
    let digest = signature.digest.as_str();
    let threshold = signature.kind.threshold();
    let soft_limit = threshold + SOFT_SPAM_DELTA;

    // Stage 1: exact verdict cache. A cached spam answer is final.
    if let Some(raw) = app.store.get(&keys::oracle_verdict(digest)).await? {
        if let Ok(cached) = serde_json::from_str::<Verdict>(&raw) {
            if cached.is_spam() {
                app.metrics.record_cached_positive();
                *verdict = with_match_type(cached, signature.kind);
                return Ok(SignatureOutcome::Terminated);
            }
        }
    }

    let bands = fingerprint::bands(digest);
    if bands.is_empty() {
        return Ok(SignatureOutcome::NextSignature);
    }

    // Stage 2: LSH over recently oracle-confirmed spam.
    let oracle_band_keys: Vec<String> = bands.iter().map(|b| keys::oracle_band(b)).collect();
    let matched = matched_keys(app, &oracle_band_keys).await?;
    if matched.len() >= MIN_BAND_MATCHES {
        let candidates = collect_candidates(app, &matched).await?;
        let mut best: Option<u32> = None;
        for (candidate, dist) in fingerprint::batch_distance(digest, &candidates) {
            if dist <= threshold {
                info!(
                    kind = %signature.kind,
                    %candidate,
                    distance = dist,
                    "oracle cache proximity match"
                );
                app.metrics.record_cached_positive();
                *verdict = Verdict {
                    action:          Action::Spam,
                    label:           Some("oracle_cache_match".to_string()),
                    proximity_match: true,
                    distance:        Some(dist),
                    confidence:      Some(confidence(dist, threshold)),
                    match_type:      Some(signature.kind.to_string()),
                };
                return Ok(SignatureOutcome::Terminated);
            }
            if best.map_or(true, |b| dist < b) {
                best = Some(dist);
            }
        }
        if let Some(dist) = best {
            if dist <= soft_limit && verdict.action == Action::Allow {
                verdict.action = Action::SoftSpam;
                verdict.label = Some("oracle_cache_match".to_string());
                verdict.distance = Some(dist);
                verdict.match_type = Some(signature.kind.to_string());
            }
        }
    }

    // Stage 3: LSH over locally learned spam. Handles the signature
    // entirely when enough bands collide, whatever the outcome.
    let local_band_keys: Vec<String> = bands.iter().map(|b| keys::local_band(b)).collect();
    let matched = matched_keys(app, &local_band_keys).await?;
    if matched.len() >= MIN_BAND_MATCHES {
        // Reading the index keeps it alive: sliding retention.
        app.store
            .expire_many(&matched, app.tunables.retention())
            .await?;

        let candidates = collect_candidates(app, &matched).await?;
        let mut best: Option<(u32, i64)> = None;
        for (candidate, dist) in fingerprint::batch_distance(digest, &candidates) {
            if dist > soft_limit {
                continue;
            }
            let score = app
                .store
                .get_i64(&keys::local_score(&candidate))
                .await?
                .unwrap_or(0);
            if dist <= threshold && score > 0 {
                info!(
                    kind = %signature.kind,
                    %candidate,
                    distance = dist,
                    score,
                    "local spam match"
                );
                app.metrics.record_local_spam();
                *verdict = Verdict {
                    action:          Action::Spam,
                    label:           Some("local_spam".to_string()),
                    proximity_match: true,
                    distance:        Some(dist),
                    confidence:      Some(confidence(dist, threshold)),
                    match_type:      Some(signature.kind.to_string()),
                };
                return Ok(SignatureOutcome::NextSignature);
            }
            if best.map_or(true, |(b, _)| dist < b) {
                best = Some((dist, score));
            }
        }

        if let Some((dist, score)) = best {
            if dist <= soft_limit && score > 0 && verdict.action == Action::Allow {
                verdict.action = Action::SoftSpam;
                verdict.label = Some("local_spam".to_string());
                verdict.distance = Some(dist);
                verdict.match_type = Some(signature.kind.to_string());
            }
        }

        // Close enough to known content that the oracle has nothing to add.
        verdict.proximity_match = true;
        return Ok(SignatureOutcome::NextSignature);
    }

    // Stage 4: global band index, then the oracle itself.
    let global_band_keys: Vec<String> = bands.iter().map(|b| keys::global_band(b)).collect();
    let matched = matched_keys(app, &global_band_keys).await?;
    if matched.len() >= MIN_BAND_MATCHES {
        match oracle_decision(app, signature).await? {
            Some(oracle_verdict) if oracle_verdict.is_spam() => {
                info!(kind = %signature.kind, "oracle confirmed spam");
                app.metrics.record_oracle_spam();
                *verdict = with_match_type(oracle_verdict, signature.kind);
                return Ok(SignatureOutcome::Terminated);
            }
            _ => {
                debug!(kind = %signature.kind, "oracle partial match");
                app.metrics.record_partial_match();
                verdict.proximity_match = true;
            }
        }
    }

    Ok(SignatureOutcome::NextSignature)
}

/// The exact-cache consult plus the network call behind stage 4. Returns
/// `None` when the oracle is unreachable or answered nonsense; the caller
/// falls back to a proximity signal.
async fn oracle_decision<S: IndexStore, O: Oracle>(
    app: &App<S, O>,
    signature: &TypedSignature,
) -> Result<Option<Verdict>, StoreError> {
    let digest = signature.digest.as_str();
    let cache_key = keys::oracle_verdict(digest);

    if let Some(raw) = app.store.get(&cache_key).await? {
        if let Ok(cached) = serde_json::from_str::<Verdict>(&raw) {
            if cached.is_spam() {
                app.metrics.record_cached_positive();
            } else {
                app.metrics.record_cached_negative();
            }
            return Ok(Some(cached));
        }
    }

    let oracle_verdict = match app.oracle.analyze(&app.node_id, digest).await {
        Ok(v) => v,
        Err(err) => {
            debug!(%err, "oracle analyze failed, proceeding locally");
            return Ok(None);
        }
    };

    let encoded = match serde_json::to_string(&oracle_verdict) {
        Ok(s) => s,
        Err(_) => return Ok(Some(oracle_verdict)),
    };

    if oracle_verdict.is_spam() {
        // Exact cache for repeats, band index for near variants.
        app.store
            .set_ex(&cache_key, &encoded, ORACLE_SPAM_TTL)
            .await?;
        let entries: Vec<(String, String)> = fingerprint::bands(digest)
            .iter()
            .map(|b| (keys::oracle_band(b), digest.to_string()))
            .collect();
        app.store
            .sadd_many(&entries, Some(ORACLE_SPAM_TTL))
            .await?;
    } else {
        app.store
            .set_ex(&cache_key, &encoded, ORACLE_MISS_TTL)
            .await?;
    }

    Ok(Some(oracle_verdict))
}

async fn matched_keys<S: IndexStore, O: Oracle>(
    app: &App<S, O>,
    band_keys: &[String],
) -> Result<Vec<String>, StoreError> {
    let exists = app.store.exists_many(band_keys).await?;
    Ok(band_keys
        .iter()
        .zip(exists)
        .filter(|(_, hit)| *hit)
        .map(|(key, _)| key.clone())
        .collect())
}

/// Union of the matched band sets, deduplicated in first-seen order.
async fn collect_candidates<S: IndexStore, O: Oracle>(
    app: &App<S, O>,
    matched: &[String],
) -> Result<Vec<String>, StoreError> {
    let member_lists = app.store.smembers_many(matched).await?;
    let mut seen = std::collections::HashSet::new();
    let mut candidates = Vec::new();
    for members in member_lists {
        for member in members {
            if seen.insert(member.clone()) {
                candidates.push(member);
            }
        }
    }
    Ok(candidates)
}

fn with_match_type(mut verdict: Verdict, kind: SignatureKind) -> Verdict {
    if let Some(distance) = verdict.distance {
        verdict.confidence = Some(confidence(distance.min(kind.threshold()), kind.threshold()));
    }
    verdict.match_type = Some(kind.to_string());
    verdict
}
