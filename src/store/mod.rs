//! Persistence seam. The service never talks to a database directly; it goes
//! through [`Store`], backed either by the hosted Postgres REST API or by an
//! in-process map for tests and local runs.

pub mod memory;
pub mod supabase;

pub use memory::MemoryStore;
pub use supabase::SupabaseStore;

use crate::models::{
    AdCopy, ArtifactKind, ArtifactRow, ArtifactStatus, LedgerEntry, Page, Payment, PaymentStatus,
    PricingTier, ProductImage, ProductInfo, User,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_with::skip_serializing_none;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Compare-and-set precondition for artifact updates. An update whose guard
/// does not match the current row writes nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactGuard {
    pub statuses: Vec<ArtifactStatus>,
    pub stage: Option<String>,
    pub credits_charged: Option<i64>,
}

impl ArtifactGuard {
    pub fn at(status: ArtifactStatus, stage: &str) -> Self {
        Self {
            statuses: vec![status],
            stage: Some(stage.to_string()),
            credits_charged: None,
        }
    }

    pub fn charged(amount: i64) -> Self {
        Self {
            credits_charged: Some(amount),
            ..Self::default()
        }
    }

    pub fn matches(&self, row: &ArtifactRow) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&row.status))
            && self
                .stage
                .as_deref()
                .is_none_or(|stage| stage == row.progress_stage)
            && self
                .credits_charged
                .is_none_or(|charged| charged == row.credits_charged)
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ArtifactPatch {
    pub status: Option<ArtifactStatus>,
    pub progress_stage: Option<String>,
    pub selected_ad_copy: Option<Option<String>>,
    pub output_url: Option<Option<String>>,
    pub error_message: Option<Option<String>>,
    pub is_public: Option<bool>,
    pub credits_charged: Option<i64>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
}

impl ArtifactPatch {
    #[cfg(test)]
    pub fn state(status: ArtifactStatus, stage: &str) -> Self {
        Self {
            status: Some(status),
            progress_stage: Some(stage.to_string()),
            ..Self::default()
        }
    }

    pub fn with_error(mut self, message: Option<&str>) -> Self {
        self.error_message = Some(message.map(str::to_string));
        self
    }

    pub fn apply(&self, row: &mut ArtifactRow) {
        if let Some(status) = self.status {
            row.status = status;
        }
        if let Some(stage) = &self.progress_stage {
            row.progress_stage = stage.clone();
        }
        if let Some(copy) = &self.selected_ad_copy {
            row.selected_ad_copy = copy.clone();
        }
        if let Some(url) = &self.output_url {
            row.output_url = url.clone();
        }
        if let Some(message) = &self.error_message {
            row.error_message = message.clone();
        }
        if let Some(public) = self.is_public {
            row.is_public = public;
        }
        if let Some(charged) = self.credits_charged {
            row.credits_charged = charged;
        }
        if let Some(at) = self.completed_at {
            row.completed_at = at;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArtifactFilter {
    pub user_id: Option<String>,
    pub status: Option<ArtifactStatus>,
    pub public_only: bool,
}

impl ArtifactFilter {
    pub fn owned_by(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, row: &ArtifactRow) -> bool {
        self.user_id.as_deref().is_none_or(|id| id == row.user_id)
            && self.status.is_none_or(|status| status == row.status)
            && (!self.public_only || row.is_public)
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize)]
pub struct PaymentPatch {
    pub status: Option<PaymentStatus>,
    pub payment_key: Option<String>,
    pub method: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

impl PaymentPatch {
    pub fn status(status: PaymentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn apply(&self, payment: &mut Payment) {
        if let Some(status) = self.status {
            payment.status = status;
        }
        if let Some(key) = &self.payment_key {
            payment.payment_key = Some(key.clone());
        }
        if let Some(method) = &self.method {
            payment.method = Some(method.clone());
        }
        if let Some(at) = self.approved_at {
            payment.approved_at = Some(at);
        }
        if let Some(reason) = &self.cancel_reason {
            payment.cancel_reason = Some(reason.clone());
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_user(&self, id: &str) -> StoreResult<Option<User>>;

    /// Inserts the user unless a row with the same id exists; returns the stored row.
    async fn insert_user_if_absent(&self, user: &User) -> StoreResult<User>;

    async fn list_users(&self, page: Page) -> StoreResult<(Vec<User>, u64)>;

    /// Atomically subtracts `amount` when the balance covers it. Returns the
    /// new balance, or `None` when the balance is short or the user is missing.
    async fn debit_balance(&self, user_id: &str, amount: i64) -> StoreResult<Option<i64>>;

    /// Atomically adds `amount`. Returns the new balance, `None` for a missing user.
    async fn credit_balance(&self, user_id: &str, amount: i64) -> StoreResult<Option<i64>>;

    /// Removes the user and everything owned by them.
    async fn delete_user(&self, user_id: &str) -> StoreResult<()>;

    async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> StoreResult<()>;

    async fn list_ledger_entries(
        &self,
        user_id: &str,
        page: Page,
    ) -> StoreResult<(Vec<LedgerEntry>, u64)>;

    async fn ledger_entries_for_artifact(&self, artifact_id: Uuid)
    -> StoreResult<Vec<LedgerEntry>>;

    async fn insert_product(&self, info: &ProductInfo, image: &ProductImage) -> StoreResult<()>;

    async fn get_product_image(&self, id: Uuid) -> StoreResult<Option<ProductImage>>;

    async fn insert_artifact(&self, kind: ArtifactKind, row: &ArtifactRow) -> StoreResult<()>;

    async fn get_artifact(&self, kind: ArtifactKind, id: Uuid) -> StoreResult<Option<ArtifactRow>>;

    async fn list_artifacts(
        &self,
        kind: ArtifactKind,
        filter: &ArtifactFilter,
        page: Page,
    ) -> StoreResult<(Vec<ArtifactRow>, u64)>;

    /// Applies `patch` only when `guard` matches; returns the updated row.
    async fn update_artifact(
        &self,
        kind: ArtifactKind,
        id: Uuid,
        guard: &ArtifactGuard,
        patch: &ArtifactPatch,
    ) -> StoreResult<Option<ArtifactRow>>;

    async fn delete_ad_copies(&self, kind: ArtifactKind, artifact_id: Uuid) -> StoreResult<u64>;

    async fn insert_ad_copies(&self, kind: ArtifactKind, copies: &[AdCopy]) -> StoreResult<()>;

    async fn list_ad_copies(&self, kind: ArtifactKind, artifact_id: Uuid)
    -> StoreResult<Vec<AdCopy>>;

    /// Flags exactly one candidate as selected and clears the rest.
    async fn mark_ad_copy_selected(
        &self,
        kind: ArtifactKind,
        artifact_id: Uuid,
        copy_id: Uuid,
    ) -> StoreResult<Option<AdCopy>>;

    /// Clears the selection flag on every candidate of the artifact.
    async fn clear_ad_copy_selection(&self, kind: ArtifactKind, artifact_id: Uuid)
    -> StoreResult<()>;

    async fn list_pricing_tiers(&self) -> StoreResult<Vec<PricingTier>>;

    async fn get_pricing_tier(&self, id: &str) -> StoreResult<Option<PricingTier>>;

    async fn insert_payment(&self, payment: &Payment) -> StoreResult<()>;

    async fn get_payment(&self, order_id: &str) -> StoreResult<Option<Payment>>;

    async fn list_payments(&self, user_id: &str, page: Page) -> StoreResult<(Vec<Payment>, u64)>;

    /// Applies `patch` only while the payment is still in `expected`.
    async fn update_payment(
        &self,
        order_id: &str,
        expected: PaymentStatus,
        patch: &PaymentPatch,
    ) -> StoreResult<Option<Payment>>;
}
