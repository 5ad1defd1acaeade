//! Progress observation for clients waiting on a generation.

use crate::config::env_parse;
use crate::models::{ArtifactKind, ArtifactRow, ArtifactStatus};
use crate::store::{Store, StoreError};
use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub artifact_id: Uuid,
    pub status: ArtifactStatus,
    pub progress_stage: String,
    pub error_message: Option<String>,
}

impl Snapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl From<&ArtifactRow> for Snapshot {
    fn from(row: &ArtifactRow) -> Self {
        Self {
            artifact_id: row.id,
            status: row.status,
            progress_stage: row.progress_stage.clone(),
            error_message: row.error_message.clone(),
        }
    }
}

/// Fires at most once.
#[derive(Debug, Clone, Default)]
pub struct TerminalLatch(Arc<AtomicBool>);

impl TerminalLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// True for the first caller only.
    pub fn fire(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    #[cfg(test)]
    pub fn is_fired(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
pub struct ArtifactWatcher {
    store: Arc<dyn Store>,
    poll: Duration,
    max_wait: Duration,
}

impl ArtifactWatcher {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let poll = env_parse("OBSERVER_POLL_MS")
            .filter(|v: &u64| *v > 0)
            .unwrap_or(2_000);
        let max_wait = env_parse("OBSERVER_MAX_SECS")
            .filter(|v: &u64| *v > 0)
            .unwrap_or(900);
        Self::with_timing(
            store,
            Duration::from_millis(poll),
            Duration::from_secs(max_wait),
        )
    }

    pub fn with_timing(store: Arc<dyn Store>, poll: Duration, max_wait: Duration) -> Self {
        Self {
            store,
            poll,
            max_wait,
        }
    }

    pub async fn snapshot(
        &self,
        kind: ArtifactKind,
        id: Uuid,
    ) -> Result<Option<Snapshot>, StoreError> {
        Ok(self
            .store
            .get_artifact(kind, id)
            .await?
            .as_ref()
            .map(Snapshot::from))
    }

    /// Streams a snapshot every time the observable state changes. The
    /// terminal snapshot is sent once and closes the stream; so does the
    /// receiver going away or the wait bound elapsing.
    pub fn watch(&self, kind: ArtifactKind, id: Uuid) -> mpsc::Receiver<Snapshot> {
        let (tx, rx) = mpsc::channel(16);
        let watcher = self.clone();
        tokio::spawn(async move {
            let latch = TerminalLatch::new();
            let deadline = Instant::now() + watcher.max_wait;
            let mut last: Option<Snapshot> = None;
            loop {
                match watcher.snapshot(kind, id).await {
                    Ok(Some(snapshot)) if last.as_ref() != Some(&snapshot) => {
                        if snapshot.is_terminal() {
                            if latch.fire() {
                                let _ = tx.send(snapshot).await;
                            }
                            break;
                        }
                        if tx.send(snapshot.clone()).await.is_err() {
                            break;
                        }
                        last = Some(snapshot);
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        debug!(target = "adstudio.observer", artifact_id = %id, "artifact_gone");
                        break;
                    }
                    Err(err) => {
                        warn!(
                            target = "adstudio.observer",
                            artifact_id = %id,
                            error = %err,
                            "snapshot_failed"
                        );
                    }
                }
                if Instant::now() >= deadline {
                    info!(target = "adstudio.observer", artifact_id = %id, "watch_timed_out");
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(watcher.poll) => {}
                    _ = tx.closed() => break,
                }
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn row(status: ArtifactStatus, stage: &str) -> ArtifactRow {
        ArtifactRow {
            id: Uuid::nil(),
            user_id: "user_1".into(),
            product_image_id: Uuid::nil(),
            product_info_id: Uuid::nil(),
            status,
            progress_stage: stage.into(),
            selected_ad_copy: None,
            output_url: None,
            error_message: None,
            is_public: false,
            credits_charged: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn latch_fires_once() {
        let latch = TerminalLatch::new();
        let clone = latch.clone();
        assert!(latch.fire());
        assert!(!clone.fire());
        assert!(latch.is_fired());
    }

    #[tokio::test]
    async fn watch_reports_changes_and_one_terminal_snapshot() {
        let store = MemoryStore::new();
        store
            .insert_artifact(ArtifactKind::Video, &row(ArtifactStatus::Processing, "image_refinement"))
            .await
            .unwrap();
        let watcher = ArtifactWatcher::with_timing(
            Arc::new(store.clone()),
            Duration::from_millis(10),
            Duration::from_secs(5),
        );
        let mut rx = watcher.watch(ArtifactKind::Video, Uuid::nil());

        let first = rx.recv().await.expect("initial");
        assert_eq!(first.progress_stage, "image_refinement");

        store
            .overwrite_artifact(ArtifactKind::Video, row(ArtifactStatus::Processing, "merging"))
            .await;
        let second = rx.recv().await.expect("advance");
        assert_eq!(second.progress_stage, "merging");

        store
            .overwrite_artifact(ArtifactKind::Video, row(ArtifactStatus::Completed, "completed"))
            .await;
        let last = rx.recv().await.expect("terminal");
        assert!(last.is_terminal());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn watch_gives_up_after_the_bound() {
        let store = MemoryStore::new();
        store
            .insert_artifact(ArtifactKind::Image, &row(ArtifactStatus::Processing, "image_generation"))
            .await
            .unwrap();
        let watcher = ArtifactWatcher::with_timing(
            Arc::new(store),
            Duration::from_millis(5),
            Duration::from_millis(30),
        );
        let mut rx = watcher.watch(ArtifactKind::Image, Uuid::nil());
        assert!(rx.recv().await.is_some());
        let closed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("closes in time");
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn missing_artifact_closes_immediately() {
        let watcher = ArtifactWatcher::with_timing(
            Arc::new(MemoryStore::new()),
            Duration::from_millis(5),
            Duration::from_secs(1),
        );
        let mut rx = watcher.watch(ArtifactKind::Video, Uuid::new_v4());
        assert!(rx.recv().await.is_none());
    }
}
