// src/workers/sync.rs
//
// Global band index sync. Every minute (and immediately at startup) the
// node offers its cursor to the oracle and applies whatever comes back:
// either a delta of band adds/removes, or a full reset that wipes the
// global prefix and starts the cursor over. A cycle that fails anywhere
// leaves both the index and the cursor untouched.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::oracle::Oracle;
use crate::store::{keys, IndexStore};
use crate::types::{SyncAction, SyncOpAction};
use crate::{App, VERSION};

const SYNC_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run<S: IndexStore, O: Oracle>(app: Arc<App<S, O>>) {
    let mut ticker = tokio::time::interval(SYNC_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(err) = sync_once(&app).await {
            debug!(%err, "sync cycle skipped");
        }
    }
}

pub async fn sync_once<S: IndexStore, O: Oracle>(app: &App<S, O>) -> anyhow::Result<()> {
    let current_seq = app.store.get_i64(keys::SYNC_SEQ).await?.unwrap_or(0);
    let response = app.oracle.sync(&app.node_id, current_seq, VERSION).await?;

    match response.action {
        SyncAction::UpdateDelta => {
            let mut adds = Vec::new();
            let mut dels = Vec::new();
            for op in &response.ops {
                let target = match op.action {
                    SyncOpAction::Add => &mut adds,
                    SyncOpAction::Del => &mut dels,
                    SyncOpAction::Unknown => continue,
                };
                target.extend(op.bands.iter().map(|b| keys::global_band(b)));
            }
            let (added, removed) = (adds.len(), dels.len());
            app.store.set_flags(&adds).await?;
            app.store.del_many(&dels).await?;
            app.store
                .set(keys::SYNC_SEQ, &response.new_seq.to_string())
                .await?;
            if added > 0 || removed > 0 {
                info!(added, removed, new_seq = response.new_seq, "band index delta applied");
            }
        }
        SyncAction::ResetDb => {
            let removed = app.store.delete_prefix(keys::GLOBAL_BAND_PREFIX).await?;
            app.store.set(keys::SYNC_SEQ, "0").await?;
            warn!(removed, "band index reset by oracle");
        }
        SyncAction::Unknown => {
            debug!("sync response with unknown action ignored");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Tunables};
    use crate::oracle::ScriptedOracle;
    use crate::store::MemoryStore;
    use crate::types::{SyncOp, SyncResponse};

    fn test_app() -> Arc<App<MemoryStore, ScriptedOracle>> {
        let cfg = Config::load(None).unwrap();
        App::new(
            MemoryStore::new(),
            ScriptedOracle::default(),
            Tunables::from_config(&cfg),
            "node-test".to_string(),
        )
    }

    #[tokio::test]
    async fn delta_applies_adds_dels_and_cursor() {
        let app = test_app();
        app.store.set("mi_f:9:OLDOLD", "1").await.unwrap();
        *app.oracle.sync_reply.lock().unwrap() = Some(SyncResponse {
            new_seq: 7,
            action:  SyncAction::UpdateDelta,
            ops:     vec![
                SyncOp {
                    action: SyncOpAction::Add,
                    bands:  vec!["1:AABBCC".into(), "2:BBCCDD".into()],
                },
                SyncOp { action: SyncOpAction::Del, bands: vec!["9:OLDOLD".into()] },
            ],
        });

        sync_once(&app).await.unwrap();

        assert_eq!(
            app.store.get("mi_f:1:AABBCC").await.unwrap().as_deref(),
            Some("1")
        );
        assert_eq!(
            app.store.get("mi_f:2:BBCCDD").await.unwrap().as_deref(),
            Some("1")
        );
        assert_eq!(app.store.get("mi_f:9:OLDOLD").await.unwrap(), None);
        assert_eq!(app.store.get_i64(keys::SYNC_SEQ).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn reset_wipes_only_the_global_prefix() {
        let app = test_app();
        app.store.set("mi_f:1:AABBCC", "1").await.unwrap();
        app.store.set("mi_f:2:BBCCDD", "1").await.unwrap();
        app.store.set("lg_f:1:AABBCC", "1").await.unwrap();
        app.store.set(keys::SYNC_SEQ, "42").await.unwrap();
        *app.oracle.sync_reply.lock().unwrap() = Some(SyncResponse {
            new_seq: 0,
            action:  SyncAction::ResetDb,
            ops:     vec![],
        });

        sync_once(&app).await.unwrap();

        assert!(app.store.keys_with_prefix("mi_f:").is_empty());
        assert_eq!(app.store.keys_with_prefix("lg_f:").len(), 1);
        assert_eq!(app.store.get_i64(keys::SYNC_SEQ).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn transport_failure_changes_nothing() {
        let app = test_app();
        app.store.set(keys::SYNC_SEQ, "3").await.unwrap();
        app.store.set("mi_f:1:AABBCC", "1").await.unwrap();
        // sync_reply stays None: unreachable.

        assert!(sync_once(&app).await.is_err());
        assert_eq!(app.store.get_i64(keys::SYNC_SEQ).await.unwrap(), Some(3));
        assert_eq!(app.store.keys_with_prefix("mi_f:").len(), 1);
    }
}
