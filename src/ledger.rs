//! Credit balance and its append-only log.
//!
//! Balance changes are single conditional writes in the store; the log entry
//! that follows is bookkeeping and is allowed to fail without undoing the
//! balance change.

use crate::models::{LedgerEntry, LedgerKind, Role, User};
use crate::store::{Store, StoreError};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

/// Whether spending is metered for a caller. Admins are unmetered: no balance
/// check, no debit, no log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendPolicy {
    MeteredUser,
    UnmeteredAdmin,
}

impl From<Role> for SpendPolicy {
    fn from(role: Role) -> Self {
        match role {
            Role::Admin => SpendPolicy::UnmeteredAdmin,
            Role::User => SpendPolicy::MeteredUser,
        }
    }
}

impl SpendPolicy {
    pub fn covers(&self, user: &User, amount: i64) -> bool {
        match self {
            SpendPolicy::UnmeteredAdmin => true,
            SpendPolicy::MeteredUser => user.credit_balance >= amount,
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientFunds { balance: i64, required: i64 },
    #[error("user `{0}` not found")]
    UnknownUser(String),
    #[error("caller is not an admin")]
    NotAdmin,
    #[error("amount must be positive")]
    InvalidAmount,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Debit {
    /// Credits actually taken; zero for unmetered callers.
    pub charged: i64,
    pub balance_after: Option<i64>,
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Store>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn deduct(
        &self,
        user_id: &str,
        amount: i64,
        policy: SpendPolicy,
        related_artifact_id: Option<Uuid>,
        description: &str,
    ) -> Result<Debit, LedgerError> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount);
        }
        if policy == SpendPolicy::UnmeteredAdmin || amount == 0 {
            return Ok(Debit {
                charged: 0,
                balance_after: None,
            });
        }

        let Some(balance_after) = self.store.debit_balance(user_id, amount).await? else {
            return match self.store.get_user(user_id).await? {
                Some(user) => Err(LedgerError::InsufficientFunds {
                    balance: user.credit_balance,
                    required: amount,
                }),
                None => Err(LedgerError::UnknownUser(user_id.to_string())),
            };
        };

        self.append(
            user_id,
            LedgerKind::Usage,
            -amount,
            balance_after,
            related_artifact_id,
            description,
        )
        .await;
        Ok(Debit {
            charged: amount,
            balance_after: Some(balance_after),
        })
    }

    /// Admin-issued credit. The acting user's role is re-read from the store.
    pub async fn grant(
        &self,
        acting_admin_id: &str,
        user_id: &str,
        amount: i64,
        reason: &str,
    ) -> Result<i64, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let actor = self
            .store
            .get_user(acting_admin_id)
            .await?
            .ok_or_else(|| LedgerError::UnknownUser(acting_admin_id.to_string()))?;
        if !actor.is_admin() {
            return Err(LedgerError::NotAdmin);
        }
        let balance = self
            .credit(user_id, amount, LedgerKind::AdminGrant, None, reason)
            .await?;
        info!(
            target = "adstudio.ledger",
            admin_id = %acting_admin_id,
            user_id = %user_id,
            amount,
            "credits_granted"
        );
        Ok(balance)
    }

    pub async fn refund(
        &self,
        user_id: &str,
        amount: i64,
        related_artifact_id: Option<Uuid>,
        description: &str,
    ) -> Result<i64, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        self.credit(
            user_id,
            amount,
            LedgerKind::Refund,
            related_artifact_id,
            description,
        )
        .await
    }

    pub async fn purchase(
        &self,
        user_id: &str,
        amount: i64,
        order_id: &str,
    ) -> Result<i64, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        self.credit(
            user_id,
            amount,
            LedgerKind::Purchase,
            None,
            &format!("크레딧 구매 ({order_id})"),
        )
        .await
    }

    /// Takes back credits from a cancelled purchase. Fails when they were
    /// already spent.
    pub async fn revoke_purchase(
        &self,
        user_id: &str,
        amount: i64,
        order_id: &str,
    ) -> Result<i64, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let Some(balance_after) = self.store.debit_balance(user_id, amount).await? else {
            let balance = self
                .store
                .get_user(user_id)
                .await?
                .map(|user| user.credit_balance)
                .ok_or_else(|| LedgerError::UnknownUser(user_id.to_string()))?;
            return Err(LedgerError::InsufficientFunds {
                balance,
                required: amount,
            });
        };
        self.append(
            user_id,
            LedgerKind::Refund,
            -amount,
            balance_after,
            None,
            &format!("결제 취소 ({order_id})"),
        )
        .await;
        Ok(balance_after)
    }

    async fn credit(
        &self,
        user_id: &str,
        amount: i64,
        kind: LedgerKind,
        related_artifact_id: Option<Uuid>,
        description: &str,
    ) -> Result<i64, LedgerError> {
        let balance_after = self
            .store
            .credit_balance(user_id, amount)
            .await?
            .ok_or_else(|| LedgerError::UnknownUser(user_id.to_string()))?;
        self.append(
            user_id,
            kind,
            amount,
            balance_after,
            related_artifact_id,
            description,
        )
        .await;
        Ok(balance_after)
    }

    async fn append(
        &self,
        user_id: &str,
        kind: LedgerKind,
        amount: i64,
        balance_after: i64,
        related_artifact_id: Option<Uuid>,
        description: &str,
    ) {
        crate::metrics::ledger_movement(kind.as_str(), amount);
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            kind,
            amount,
            balance_after,
            related_artifact_id,
            description: description.to_string(),
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.insert_ledger_entry(&entry).await {
            error!(
                target = "adstudio.ledger",
                user_id = %user_id,
                kind = kind.as_str(),
                amount,
                balance_after,
                error = %err,
                "ledger_entry_lost"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Page;
    use crate::store::MemoryStore;
    use crate::testing::seed_user;

    async fn ledger_with(balance: i64, role: Role) -> (Ledger, MemoryStore) {
        let store = MemoryStore::new();
        seed_user(&store, "user_1", balance, role).await;
        (Ledger::new(Arc::new(store.clone())), store)
    }

    async fn entries(store: &MemoryStore) -> Vec<LedgerEntry> {
        store
            .list_ledger_entries("user_1", Page::default())
            .await
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn metered_deduct_logs_one_usage_entry() {
        let (ledger, store) = ledger_with(100, Role::User).await;
        let artifact = Uuid::new_v4();
        let debit = ledger
            .deduct("user_1", 40, SpendPolicy::MeteredUser, Some(artifact), "video")
            .await
            .expect("deduct");
        assert_eq!(debit.charged, 40);
        assert_eq!(debit.balance_after, Some(60));

        let log = entries(&store).await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, LedgerKind::Usage);
        assert_eq!(log[0].amount, -40);
        assert_eq!(log[0].balance_after, 60);
        assert_eq!(log[0].related_artifact_id, Some(artifact));
    }

    #[tokio::test]
    async fn insufficient_balance_writes_nothing() {
        let (ledger, store) = ledger_with(50, Role::User).await;
        let err = ledger
            .deduct("user_1", 100, SpendPolicy::MeteredUser, None, "video")
            .await
            .expect_err("short");
        assert!(matches!(
            err,
            LedgerError::InsufficientFunds {
                balance: 50,
                required: 100
            }
        ));
        assert_eq!(store.get_user("user_1").await.unwrap().unwrap().credit_balance, 50);
        assert!(entries(&store).await.is_empty());
    }

    #[tokio::test]
    async fn unmetered_admin_is_never_charged() {
        let (ledger, store) = ledger_with(0, Role::Admin).await;
        let debit = ledger
            .deduct("user_1", 100, SpendPolicy::from(Role::Admin), None, "video")
            .await
            .expect("admin");
        assert_eq!(debit.charged, 0);
        assert_eq!(store.get_user("user_1").await.unwrap().unwrap().credit_balance, 0);
        assert!(entries(&store).await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_deducts_never_overdraw() {
        let (ledger, store) = ledger_with(100, Role::User).await;
        let mut handles = Vec::new();
        for _ in 0..10 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .deduct("user_1", 20, SpendPolicy::MeteredUser, None, "race")
                    .await
                    .is_ok()
            }));
        }
        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                succeeded += 1;
            }
        }
        assert_eq!(succeeded, 5);
        assert_eq!(store.get_user("user_1").await.unwrap().unwrap().credit_balance, 0);
        let mut snapshots: Vec<i64> = entries(&store).await.iter().map(|e| e.balance_after).collect();
        snapshots.sort();
        assert_eq!(snapshots, vec![0, 20, 40, 60, 80]);
    }

    #[tokio::test]
    async fn lost_log_entry_keeps_balance_change() {
        let (ledger, store) = ledger_with(100, Role::User).await;
        store.reject_ledger_writes(true);
        ledger
            .deduct("user_1", 30, SpendPolicy::MeteredUser, None, "video")
            .await
            .expect("balance change still succeeds");
        store.reject_ledger_writes(false);
        assert_eq!(store.get_user("user_1").await.unwrap().unwrap().credit_balance, 70);
        assert!(entries(&store).await.is_empty());
    }

    #[tokio::test]
    async fn grant_requires_admin_and_positive_amount() {
        let (ledger, store) = ledger_with(0, Role::User).await;
        seed_user(&store, "admin_1", 0, Role::Admin).await;

        assert!(matches!(
            ledger.grant("user_1", "user_1", 10, "self").await,
            Err(LedgerError::NotAdmin)
        ));
        assert!(matches!(
            ledger.grant("admin_1", "user_1", 0, "zero").await,
            Err(LedgerError::InvalidAmount)
        ));
        let balance = ledger
            .grant("admin_1", "user_1", 500, "launch promo")
            .await
            .expect("grant");
        assert_eq!(balance, 500);
        let log = entries(&store).await;
        assert_eq!(log[0].kind, LedgerKind::AdminGrant);
        assert_eq!(log[0].description, "launch promo");
    }

    #[tokio::test]
    async fn revoke_purchase_fails_once_credits_are_spent() {
        let (ledger, _store) = ledger_with(0, Role::User).await;
        ledger.purchase("user_1", 1_000, "ORD-1").await.unwrap();
        ledger
            .deduct("user_1", 900, SpendPolicy::MeteredUser, None, "video")
            .await
            .unwrap();
        assert!(matches!(
            ledger.revoke_purchase("user_1", 1_000, "ORD-1").await,
            Err(LedgerError::InsufficientFunds { balance: 100, .. })
        ));
    }
}
