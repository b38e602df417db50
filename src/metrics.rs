// src/metrics.rs
//
// Process counters. Two families share the same events:
//
//   * the six stats counters the stats worker flushes to the oracle; these
//     are swapped to zero each cycle and restored on delivery failure, so
//     they are NOT monotonic
//   * the Prometheus families served on /metrics, which only ever grow
//
// Keeping them separate is what lets the flush cycle zero its counters
// without breaking scrape-side rate() math.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    // Flushed to the oracle (swap-and-restore semantics).
    scanned:         AtomicI64,
    partial_match:   AtomicI64,
    spam_confirmed:  AtomicI64,
    cached_positive: AtomicI64,
    cached_negative: AtomicI64,
    local_spam:      AtomicI64,

    // Monotonic exposition families.
    scanned_total:              AtomicU64,
    local_match_total:          AtomicU64,
    oracle_match_complete:      AtomicU64,
    oracle_match_partial:       AtomicU64,
    cache_hits_positive:        AtomicU64,
    cache_hits_negative:        AtomicU64,
}

/// One cycle's worth of counters, as posted to the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub scanned_count:         i64,
    pub partial_match_count:   i64,
    pub spam_confirmed_count:  i64,
    pub cached_positive_count: i64,
    pub cached_negative_count: i64,
    pub local_spam_count:      i64,
}

impl StatsSnapshot {
    pub fn is_empty(&self) -> bool {
        self.scanned_count == 0
            && self.partial_match_count == 0
            && self.spam_confirmed_count == 0
            && self.cached_positive_count == 0
            && self.cached_negative_count == 0
            && self.local_spam_count == 0
    }
}

impl Metrics {
    pub fn record_scan(&self) {
        self.scanned.fetch_add(1, Ordering::Relaxed);
        self.scanned_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_local_spam(&self) {
        self.local_spam.fetch_add(1, Ordering::Relaxed);
        self.local_match_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_oracle_spam(&self) {
        self.spam_confirmed.fetch_add(1, Ordering::Relaxed);
        self.oracle_match_complete.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partial_match(&self) {
        self.partial_match.fetch_add(1, Ordering::Relaxed);
        self.oracle_match_partial.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cached_positive(&self) {
        self.cached_positive.fetch_add(1, Ordering::Relaxed);
        self.cache_hits_positive.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cached_negative(&self) {
        self.cached_negative.fetch_add(1, Ordering::Relaxed);
        self.cache_hits_negative.fetch_add(1, Ordering::Relaxed);
    }

    /// Take the current stats and zero them in one sweep. Concurrent
    /// increments land either in this snapshot or the next, never both.
    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        StatsSnapshot {
            scanned_count:         self.scanned.swap(0, Ordering::Relaxed),
            partial_match_count:   self.partial_match.swap(0, Ordering::Relaxed),
            spam_confirmed_count:  self.spam_confirmed.swap(0, Ordering::Relaxed),
            cached_positive_count: self.cached_positive.swap(0, Ordering::Relaxed),
            cached_negative_count: self.cached_negative.swap(0, Ordering::Relaxed),
            local_spam_count:      self.local_spam.swap(0, Ordering::Relaxed),
        }
    }

    /// Add a failed snapshot back so the next cycle re-delivers it.
    pub fn restore(&self, snap: &StatsSnapshot) {
        self.scanned.fetch_add(snap.scanned_count, Ordering::Relaxed);
        self.partial_match.fetch_add(snap.partial_match_count, Ordering::Relaxed);
        self.spam_confirmed.fetch_add(snap.spam_confirmed_count, Ordering::Relaxed);
        self.cached_positive.fetch_add(snap.cached_positive_count, Ordering::Relaxed);
        self.cached_negative.fetch_add(snap.cached_negative_count, Ordering::Relaxed);
        self.local_spam.fetch_add(snap.local_spam_count, Ordering::Relaxed);
    }

    /// Prometheus text exposition of the monotonic families.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(1024);

        out.push_str("# HELP mailuminati_guardian_scanned_total Total number of emails scanned\n");
        out.push_str("# TYPE mailuminati_guardian_scanned_total counter\n");
        out.push_str(&format!(
            "mailuminati_guardian_scanned_total {}\n",
            self.scanned_total.load(Ordering::Relaxed)
        ));

        out.push_str(
            "# HELP mailuminati_guardian_local_match_total Total number of emails matched locally\n",
        );
        out.push_str("# TYPE mailuminati_guardian_local_match_total counter\n");
        out.push_str(&format!(
            "mailuminati_guardian_local_match_total {}\n",
            self.local_match_total.load(Ordering::Relaxed)
        ));

        out.push_str(
            "# HELP mailuminati_guardian_oracle_match_total Total number of emails matched via oracle\n",
        );
        out.push_str("# TYPE mailuminati_guardian_oracle_match_total counter\n");
        out.push_str(&format!(
            "mailuminati_guardian_oracle_match_total{{type=\"complete\"}} {}\n",
            self.oracle_match_complete.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "mailuminati_guardian_oracle_match_total{{type=\"partial\"}} {}\n",
            self.oracle_match_partial.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP mailuminati_guardian_cache_hits_total Total number of cache hits\n");
        out.push_str("# TYPE mailuminati_guardian_cache_hits_total counter\n");
        out.push_str(&format!(
            "mailuminati_guardian_cache_hits_total{{result=\"positive\"}} {}\n",
            self.cache_hits_positive.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "mailuminati_guardian_cache_hits_total{{result=\"negative\"}} {}\n",
            self.cache_hits_negative.load(Ordering::Relaxed)
        ));

        out
    }
}
