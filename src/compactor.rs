use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::store::WalStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once enough appends piled up.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&store, threshold).await;
    }
}

/// Returns true when a compaction ran.
pub async fn compact_if_needed(store: &WalStore, threshold: u64) -> bool {
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::store::BookingStore;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn churn(store: &WalStore, n: usize) {
        for _ in 0..n {
            let id = Ulid::new();
            store
                .create_service(Service {
                    id,
                    name: None,
                    session_minutes: 15,
                    active: true,
                })
                .await
                .unwrap();
            store.delete_service(id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn below_threshold_is_left_alone() {
        let store = WalStore::open(test_wal_path("below.wal")).unwrap();
        churn(&store, 2).await;
        assert!(!compact_if_needed(&store, 100).await);
        assert!(store.appends_since_compact().await >= 4);
    }

    #[tokio::test]
    async fn threshold_triggers_compaction() {
        let path = test_wal_path("trigger.wal");
        let store = WalStore::open(path.clone()).unwrap();
        churn(&store, 10).await;
        let before = std::fs::metadata(&path).unwrap().len();

        assert!(compact_if_needed(&store, 10).await);
        assert_eq!(store.appends_since_compact().await, 0);
        assert!(std::fs::metadata(&path).unwrap().len() < before);
    }
}
