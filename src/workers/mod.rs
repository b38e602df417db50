// src/workers/mod.rs
//
// Long-lived background tasks: the global band index sync and the stats
// flush. Both are spawned once at startup and run on their own timers;
// a failed cycle is logged and retried at the next tick, never escalated.

pub mod stats;
pub mod sync;

use std::sync::Arc;

use crate::oracle::Oracle;
use crate::store::IndexStore;
use crate::App;

/// Spawn every background worker for this node.
pub fn spawn_all<S: IndexStore, O: Oracle>(app: &Arc<App<S, O>>) {
    tokio::spawn(sync::run(Arc::clone(app)));
    tokio::spawn(stats::run(Arc::clone(app)));
}
