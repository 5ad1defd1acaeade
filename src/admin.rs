//! Admin console. Every operation re-reads the caller's role from the store.

use crate::error::ActionError;
use crate::ledger::Ledger;
use crate::models::{
    AdCopy, ArtifactKind, ArtifactRow, LedgerEntry, Page, Paginated, ProductImage, User,
};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct GrantRequest {
    pub user_id: String,
    pub amount: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GrantResult {
    pub user_id: String,
    pub amount: i64,
    pub balance_after: i64,
}

/// Full diagnostic payload for one artifact.
#[derive(Debug, Serialize)]
pub struct ArtifactDiagnostic {
    pub kind: ArtifactKind,
    pub artifact: ArtifactRow,
    pub product_image: Option<ProductImage>,
    pub ad_copies: Vec<AdCopy>,
    pub ledger_entries: Vec<LedgerEntry>,
}

#[derive(Clone)]
pub struct Admin {
    store: Arc<dyn Store>,
    ledger: Ledger,
}

impl Admin {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            ledger: Ledger::new(store.clone()),
            store,
        }
    }

    async fn require_admin(&self, user_id: &str, op: &'static str) -> Result<User, ActionError> {
        let user = self
            .store
            .get_user(user_id)
            .await
            .map_err(ActionError::store(op))?
            .ok_or_else(|| ActionError::unauthenticated(op))?;
        if !user.is_admin() {
            return Err(ActionError::forbidden(op, format!("{user_id} is not an admin")));
        }
        Ok(user)
    }

    pub async fn list_users(
        &self,
        admin_id: &str,
        page: Page,
    ) -> Result<Paginated<User>, ActionError> {
        let op = "admin_list_users";
        self.require_admin(admin_id, op).await?;
        let (users, total) = self
            .store
            .list_users(page)
            .await
            .map_err(ActionError::store(op))?;
        Ok(Paginated::new(users, total, page))
    }

    pub async fn grant(
        &self,
        admin_id: &str,
        request: GrantRequest,
    ) -> Result<GrantResult, ActionError> {
        let op = "admin_grant";
        let admin = self.require_admin(admin_id, op).await?;
        let reason = request
            .reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "관리자 지급".to_string());
        let balance_after = self
            .ledger
            .grant(&admin.id, &request.user_id, request.amount, &reason)
            .await
            .map_err(ActionError::ledger(op))?;
        Ok(GrantResult {
            user_id: request.user_id,
            amount: request.amount,
            balance_after,
        })
    }

    pub async fn artifact_diagnostic(
        &self,
        admin_id: &str,
        kind: ArtifactKind,
        id: Uuid,
    ) -> Result<ArtifactDiagnostic, ActionError> {
        let op = "admin_artifact";
        self.require_admin(admin_id, op).await?;
        let artifact = self
            .store
            .get_artifact(kind, id)
            .await
            .map_err(ActionError::store(op))?
            .ok_or_else(|| ActionError::not_found(op, format!("{kind:?} {id}")))?;
        let product_image = self
            .store
            .get_product_image(artifact.product_image_id)
            .await
            .map_err(ActionError::store(op))?;
        let ad_copies = self
            .store
            .list_ad_copies(kind, id)
            .await
            .map_err(ActionError::store(op))?;
        let ledger_entries = self
            .store
            .ledger_entries_for_artifact(id)
            .await
            .map_err(ActionError::store(op))?;
        Ok(ArtifactDiagnostic {
            kind,
            artifact,
            product_image,
            ad_copies,
            ledger_entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActionErrorKind;
    use crate::models::{LedgerKind, Role};
    use crate::store::MemoryStore;
    use crate::testing::seed_user;

    async fn admin() -> (Admin, MemoryStore) {
        let store = MemoryStore::new();
        seed_user(&store, "admin_1", 0, Role::Admin).await;
        seed_user(&store, "user_1", 0, Role::User).await;
        (Admin::new(Arc::new(store.clone())), store)
    }

    #[tokio::test]
    async fn non_admins_are_forbidden() {
        let (admin, _) = admin().await;
        let err = admin
            .list_users("user_1", Page::default())
            .await
            .expect_err("user");
        assert_eq!(err.kind(), ActionErrorKind::Forbidden);
        let err = admin
            .list_users("ghost", Page::default())
            .await
            .expect_err("ghost");
        assert_eq!(err.kind(), ActionErrorKind::Unauthenticated);
    }

    #[tokio::test]
    async fn grant_credits_and_logs() {
        let (admin, store) = admin().await;
        let result = admin
            .grant(
                "admin_1",
                GrantRequest {
                    user_id: "user_1".into(),
                    amount: 300,
                    reason: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(result.balance_after, 300);
        let (entries, _) = store
            .list_ledger_entries("user_1", Page::default())
            .await
            .unwrap();
        assert_eq!(entries[0].kind, LedgerKind::AdminGrant);
        assert_eq!(entries[0].description, "관리자 지급");

        let err = admin
            .grant(
                "admin_1",
                GrantRequest {
                    user_id: "user_1".into(),
                    amount: -5,
                    reason: None,
                },
            )
            .await
            .expect_err("negative");
        assert_eq!(err.kind(), ActionErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn role_is_rechecked_on_every_call() {
        let (admin, store) = admin().await;
        assert_eq!(admin.list_users("admin_1", Page::default()).await.unwrap().total, 2);
        store.set_role("admin_1", Role::User).await;
        let err = admin
            .list_users("admin_1", Page::default())
            .await
            .expect_err("demoted");
        assert_eq!(err.kind(), ActionErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn diagnostic_of_unknown_artifact_is_not_found() {
        let (admin, _) = admin().await;
        let err = admin
            .artifact_diagnostic("admin_1", ArtifactKind::Image, Uuid::new_v4())
            .await
            .expect_err("missing");
        assert_eq!(err.kind(), ActionErrorKind::NotFound);
    }
}
