use crate::error::ActionError;
use crate::models::{LedgerEntry, Page, Paginated, User};
use crate::storage::{Storage, StorageError};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ClosureReport {
    pub user_id: String,
    /// Objects removed from storage; absent when cleanup was skipped or failed.
    pub storage_objects_removed: Option<usize>,
}

#[derive(Clone)]
pub struct Accounts {
    store: Arc<dyn Store>,
    storage: Storage,
}

impl Accounts {
    pub fn new(store: Arc<dyn Store>, storage: Storage) -> Self {
        Self { store, storage }
    }

    /// Creates the user row on first login. Existing rows are returned as-is.
    pub async fn sync(&self, user_id: &str, request: SyncRequest) -> Result<User, ActionError> {
        let op = "account_sync";
        if user_id.trim().is_empty() {
            return Err(ActionError::unauthenticated(op));
        }
        let email = request
            .email
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty());
        self.store
            .insert_user_if_absent(&User::new(user_id, email))
            .await
            .map_err(ActionError::store(op))
    }

    pub async fn profile(&self, user_id: &str) -> Result<User, ActionError> {
        let op = "account_profile";
        self.store
            .get_user(user_id)
            .await
            .map_err(ActionError::store(op))?
            .ok_or_else(|| ActionError::unauthenticated(op))
    }

    pub async fn ledger(
        &self,
        user_id: &str,
        page: Page,
    ) -> Result<Paginated<LedgerEntry>, ActionError> {
        let op = "account_ledger";
        let user = self.profile(user_id).await?;
        let (entries, total) = self
            .store
            .list_ledger_entries(&user.id, page)
            .await
            .map_err(ActionError::store(op))?;
        Ok(Paginated::new(entries, total, page))
    }

    /// Deletes the account and everything it owns. Storage cleanup is best
    /// effort; the rows are removed regardless.
    pub async fn close(&self, user_id: &str) -> Result<ClosureReport, ActionError> {
        let op = "account_close";
        let user = self.profile(user_id).await?;
        let storage_objects_removed = match self.storage.remove_user_objects(&user.id).await {
            Ok(count) => Some(count),
            Err(StorageError::NotConfigured) => None,
            Err(err) => {
                warn!(
                    target = "adstudio.storage",
                    user_id = %user.id,
                    error = %err,
                    "account_storage_cleanup_failed"
                );
                None
            }
        };
        self.store
            .delete_user(&user.id)
            .await
            .map_err(ActionError::store(op))?;
        info!(target = "adstudio.api", user_id = %user.id, "account_closed");
        Ok(ClosureReport {
            user_id: user.id,
            storage_objects_removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActionErrorKind;
    use crate::ledger::{Ledger, SpendPolicy};
    use crate::models::{ArtifactKind, Role};
    use crate::store::{ArtifactFilter, MemoryStore};

    fn accounts() -> (Accounts, MemoryStore) {
        let store = MemoryStore::new();
        (
            Accounts::new(Arc::new(store.clone()), Storage::disabled()),
            store,
        )
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let (accounts, store) = accounts();
        let first = accounts
            .sync("user_1", SyncRequest { email: Some(" a@b.kr ".into()) })
            .await
            .unwrap();
        assert_eq!(first.credit_balance, 0);
        assert_eq!(first.role, Role::User);
        assert_eq!(first.email.as_deref(), Some("a@b.kr"));

        store.set_balance("user_1", 500).await;
        let again = accounts.sync("user_1", SyncRequest::default()).await.unwrap();
        assert_eq!(again.credit_balance, 500);
        assert_eq!(again.email.as_deref(), Some("a@b.kr"));
    }

    #[tokio::test]
    async fn unknown_user_is_unauthenticated() {
        let (accounts, _) = accounts();
        let err = accounts.profile("nobody").await.expect_err("missing");
        assert_eq!(err.kind(), ActionErrorKind::Unauthenticated);
    }

    #[tokio::test]
    async fn ledger_history_is_paginated() {
        let (accounts, store) = accounts();
        accounts.sync("user_1", SyncRequest::default()).await.unwrap();
        store.set_balance("user_1", 100).await;
        let ledger = Ledger::new(Arc::new(store.clone()));
        for _ in 0..3 {
            ledger
                .deduct("user_1", 10, SpendPolicy::MeteredUser, None, "test")
                .await
                .unwrap();
        }
        let page = accounts.ledger("user_1", Page::new(1, 2)).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
    }

    #[tokio::test]
    async fn closing_removes_the_user_and_their_rows() {
        let (accounts, store) = accounts();
        accounts.sync("user_1", SyncRequest::default()).await.unwrap();
        store.set_balance("user_1", 100).await;
        Ledger::new(Arc::new(store.clone()))
            .deduct("user_1", 10, SpendPolicy::MeteredUser, None, "test")
            .await
            .unwrap();

        let report = accounts.close("user_1").await.unwrap();
        assert_eq!(report.storage_objects_removed, None);
        assert!(store.get_user("user_1").await.unwrap().is_none());
        let (entries, _) = store
            .list_ledger_entries("user_1", Page::default())
            .await
            .unwrap();
        assert!(entries.is_empty());
        let (rows, _) = store
            .list_artifacts(ArtifactKind::Video, &ArtifactFilter::owned_by("user_1"), Page::default())
            .await
            .unwrap();
        assert!(rows.is_empty());
    }
}
