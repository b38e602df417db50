// src/lib.rs
//
// mail-guardian: local email-classification sidecar. Messages are decomposed
// into typed fuzzy-hash signatures, matched against LSH band indexes in a
// shared key/value store, and only escalated to the remote oracle when the
// global band index suggests it already knows the content.

pub mod api;
pub mod config;
pub mod fingerprint;
pub mod learner;
pub mod matcher;
pub mod metrics;
pub mod normalize;
pub mod oracle;
pub mod signature;
pub mod store;
pub mod types;
pub mod workers;

use std::sync::Arc;

use config::Tunables;
use metrics::Metrics;
use oracle::Oracle;
use store::IndexStore;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything a request or worker needs, shared behind one Arc. The store
/// and oracle are seams so the whole engine runs against in-memory doubles
/// in tests.
pub struct App<S, O> {
    pub store:    Arc<S>,
    pub oracle:   Arc<O>,
    pub tunables: Tunables,
    pub metrics:  Metrics,
    pub node_id:  String,
}

impl<S: IndexStore, O: Oracle> App<S, O> {
    pub fn new(store: S, oracle: O, tunables: Tunables, node_id: String) -> Arc<Self> {
        Arc::new(Self {
            store: Arc::new(store),
            oracle: Arc::new(oracle),
            tunables,
            metrics: Metrics::default(),
            node_id,
        })
    }
}
