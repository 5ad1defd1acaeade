use super::{
    ArtifactFilter, ArtifactGuard, ArtifactPatch, PaymentPatch, Store, StoreError, StoreResult,
};
use crate::models::{
    AdCopy, ArtifactKind, ArtifactRow, LedgerEntry, Page, Payment, PaymentStatus, PricingTier,
    ProductImage, ProductInfo, User,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::Mutex;
use uuid::Uuid;

const DEFAULT_PRICING_TIERS: [(&str, &str, i64, i64); 3] = [
    ("starter", "Starter", 9_900, 1_000),
    ("growth", "Growth", 29_000, 3_200),
    ("pro", "Pro", 89_000, 10_500),
];

#[derive(Default)]
struct Tables {
    users: HashMap<String, User>,
    ledger: Vec<LedgerEntry>,
    products: HashMap<Uuid, ProductInfo>,
    images: HashMap<Uuid, ProductImage>,
    artifacts: HashMap<(ArtifactKind, Uuid), ArtifactRow>,
    copies: HashMap<ArtifactKind, Vec<AdCopy>>,
    tiers: Vec<PricingTier>,
    payments: HashMap<String, Payment>,
}

/// In-process store. A single lock around all tables makes each call atomic,
/// which is what the hosted backend guarantees per request.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    reject_ledger_writes: Arc<AtomicBool>,
    refuse_debits: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn with_default_tiers() -> Self {
        let tiers = DEFAULT_PRICING_TIERS
            .iter()
            .map(|(id, name, price, credits)| PricingTier {
                id: id.to_string(),
                name: name.to_string(),
                price: *price,
                credits: *credits,
                is_active: true,
            })
            .collect();
        Self {
            tables: Arc::new(Mutex::new(Tables {
                tiers,
                ..Tables::default()
            })),
            reject_ledger_writes: Arc::default(),
            refuse_debits: Arc::default(),
        }
    }
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every ledger insert fail, leaving balance updates intact.
    pub fn reject_ledger_writes(&self, reject: bool) {
        self.reject_ledger_writes.store(reject, Ordering::SeqCst);
    }

    /// Makes every debit come back short, as if a concurrent request had
    /// spent the balance first.
    pub fn refuse_debits(&self, refuse: bool) {
        self.refuse_debits.store(refuse, Ordering::SeqCst);
    }

    pub async fn set_role(&self, user_id: &str, role: crate::models::Role) {
        if let Some(user) = self.tables.lock().await.users.get_mut(user_id) {
            user.role = role;
        }
    }

    pub async fn set_balance(&self, user_id: &str, balance: i64) {
        if let Some(user) = self.tables.lock().await.users.get_mut(user_id) {
            user.credit_balance = balance;
        }
    }

    /// Writes a row as the external workflow would, bypassing every guard.
    pub async fn overwrite_artifact(&self, kind: ArtifactKind, row: ArtifactRow) {
        self.tables.lock().await.artifacts.insert((kind, row.id), row);
    }
}

fn paginate<T: Clone>(items: Vec<T>, page: Page) -> (Vec<T>, u64) {
    let total = items.len() as u64;
    let slice = items
        .into_iter()
        .skip(page.offset())
        .take(page.limit())
        .collect();
    (slice, total)
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_user(&self, id: &str) -> StoreResult<Option<User>> {
        Ok(self.tables.lock().await.users.get(id).cloned())
    }

    async fn insert_user_if_absent(&self, user: &User) -> StoreResult<User> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .users
            .entry(user.id.clone())
            .or_insert_with(|| user.clone())
            .clone())
    }

    async fn list_users(&self, page: Page) -> StoreResult<(Vec<User>, u64)> {
        let tables = self.tables.lock().await;
        let mut users: Vec<User> = tables.users.values().cloned().collect();
        users.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(paginate(users, page))
    }

    async fn debit_balance(&self, user_id: &str, amount: i64) -> StoreResult<Option<i64>> {
        let mut tables = self.tables.lock().await;
        let Some(user) = tables.users.get_mut(user_id) else {
            return Ok(None);
        };
        if user.credit_balance < amount || self.refuse_debits.load(Ordering::SeqCst) {
            return Ok(None);
        }
        user.credit_balance -= amount;
        Ok(Some(user.credit_balance))
    }

    async fn credit_balance(&self, user_id: &str, amount: i64) -> StoreResult<Option<i64>> {
        let mut tables = self.tables.lock().await;
        Ok(tables.users.get_mut(user_id).map(|user| {
            user.credit_balance += amount;
            user.credit_balance
        }))
    }

    async fn delete_user(&self, user_id: &str) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        tables.users.remove(user_id);
        tables.ledger.retain(|entry| entry.user_id != user_id);
        tables.products.retain(|_, info| info.user_id != user_id);
        tables.images.retain(|_, image| image.user_id != user_id);
        tables.payments.retain(|_, payment| payment.user_id != user_id);
        let owned: Vec<(ArtifactKind, Uuid)> = tables
            .artifacts
            .iter()
            .filter(|(_, row)| row.user_id == user_id)
            .map(|(key, _)| *key)
            .collect();
        for (kind, id) in owned {
            tables.artifacts.remove(&(kind, id));
            if let Some(copies) = tables.copies.get_mut(&kind) {
                copies.retain(|copy| copy.artifact_id != id);
            }
        }
        Ok(())
    }

    async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> StoreResult<()> {
        if self.reject_ledger_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Request("ledger insert rejected".into()));
        }
        self.tables.lock().await.ledger.push(entry.clone());
        Ok(())
    }

    async fn list_ledger_entries(
        &self,
        user_id: &str,
        page: Page,
    ) -> StoreResult<(Vec<LedgerEntry>, u64)> {
        let tables = self.tables.lock().await;
        let entries: Vec<LedgerEntry> = tables
            .ledger
            .iter()
            .rev()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect();
        Ok(paginate(entries, page))
    }

    async fn ledger_entries_for_artifact(
        &self,
        artifact_id: Uuid,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .ledger
            .iter()
            .filter(|entry| entry.related_artifact_id == Some(artifact_id))
            .cloned()
            .collect())
    }

    async fn insert_product(&self, info: &ProductInfo, image: &ProductImage) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        tables.products.insert(info.id, info.clone());
        tables.images.insert(image.id, image.clone());
        Ok(())
    }

    async fn get_product_image(&self, id: Uuid) -> StoreResult<Option<ProductImage>> {
        Ok(self.tables.lock().await.images.get(&id).cloned())
    }

    async fn insert_artifact(&self, kind: ArtifactKind, row: &ArtifactRow) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if tables.artifacts.contains_key(&(kind, row.id)) {
            return Err(StoreError::Conflict(format!("artifact {} exists", row.id)));
        }
        tables.artifacts.insert((kind, row.id), row.clone());
        Ok(())
    }

    async fn get_artifact(&self, kind: ArtifactKind, id: Uuid) -> StoreResult<Option<ArtifactRow>> {
        Ok(self.tables.lock().await.artifacts.get(&(kind, id)).cloned())
    }

    async fn list_artifacts(
        &self,
        kind: ArtifactKind,
        filter: &ArtifactFilter,
        page: Page,
    ) -> StoreResult<(Vec<ArtifactRow>, u64)> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<ArtifactRow> = tables
            .artifacts
            .iter()
            .filter(|((row_kind, _), row)| *row_kind == kind && filter.matches(row))
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(rows, page))
    }

    async fn update_artifact(
        &self,
        kind: ArtifactKind,
        id: Uuid,
        guard: &ArtifactGuard,
        patch: &ArtifactPatch,
    ) -> StoreResult<Option<ArtifactRow>> {
        let mut tables = self.tables.lock().await;
        let Some(row) = tables.artifacts.get_mut(&(kind, id)) else {
            return Ok(None);
        };
        if !guard.matches(row) {
            return Ok(None);
        }
        patch.apply(row);
        Ok(Some(row.clone()))
    }

    async fn delete_ad_copies(&self, kind: ArtifactKind, artifact_id: Uuid) -> StoreResult<u64> {
        let mut tables = self.tables.lock().await;
        let copies = tables.copies.entry(kind).or_default();
        let before = copies.len();
        copies.retain(|copy| copy.artifact_id != artifact_id);
        Ok((before - copies.len()) as u64)
    }

    async fn insert_ad_copies(&self, kind: ArtifactKind, copies: &[AdCopy]) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        tables
            .copies
            .entry(kind)
            .or_default()
            .extend(copies.iter().cloned());
        Ok(())
    }

    async fn list_ad_copies(
        &self,
        kind: ArtifactKind,
        artifact_id: Uuid,
    ) -> StoreResult<Vec<AdCopy>> {
        let tables = self.tables.lock().await;
        let mut copies: Vec<AdCopy> = tables
            .copies
            .get(&kind)
            .map(|copies| {
                copies
                    .iter()
                    .filter(|copy| copy.artifact_id == artifact_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        copies.sort_by_key(|copy| copy.copy_index);
        Ok(copies)
    }

    async fn mark_ad_copy_selected(
        &self,
        kind: ArtifactKind,
        artifact_id: Uuid,
        copy_id: Uuid,
    ) -> StoreResult<Option<AdCopy>> {
        let mut tables = self.tables.lock().await;
        let copies = tables.copies.entry(kind).or_default();
        if !copies
            .iter()
            .any(|copy| copy.artifact_id == artifact_id && copy.id == copy_id)
        {
            return Ok(None);
        }
        let mut selected = None;
        for copy in copies
            .iter_mut()
            .filter(|copy| copy.artifact_id == artifact_id)
        {
            copy.is_selected = copy.id == copy_id;
            if copy.is_selected {
                selected = Some(copy.clone());
            }
        }
        Ok(selected)
    }

    async fn clear_ad_copy_selection(
        &self,
        kind: ArtifactKind,
        artifact_id: Uuid,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(copies) = tables.copies.get_mut(&kind) {
            for copy in copies
                .iter_mut()
                .filter(|copy| copy.artifact_id == artifact_id)
            {
                copy.is_selected = false;
            }
        }
        Ok(())
    }

    async fn list_pricing_tiers(&self) -> StoreResult<Vec<PricingTier>> {
        let tables = self.tables.lock().await;
        let mut tiers: Vec<PricingTier> = tables
            .tiers
            .iter()
            .filter(|tier| tier.is_active)
            .cloned()
            .collect();
        tiers.sort_by_key(|tier| tier.price);
        Ok(tiers)
    }

    async fn get_pricing_tier(&self, id: &str) -> StoreResult<Option<PricingTier>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .tiers
            .iter()
            .find(|tier| tier.id == id && tier.is_active)
            .cloned())
    }

    async fn insert_payment(&self, payment: &Payment) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if tables.payments.contains_key(&payment.order_id) {
            return Err(StoreError::Conflict(format!(
                "order {} exists",
                payment.order_id
            )));
        }
        tables
            .payments
            .insert(payment.order_id.clone(), payment.clone());
        Ok(())
    }

    async fn get_payment(&self, order_id: &str) -> StoreResult<Option<Payment>> {
        Ok(self.tables.lock().await.payments.get(order_id).cloned())
    }

    async fn list_payments(&self, user_id: &str, page: Page) -> StoreResult<(Vec<Payment>, u64)> {
        let tables = self.tables.lock().await;
        let mut payments: Vec<Payment> = tables
            .payments
            .values()
            .filter(|payment| payment.user_id == user_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(payments, page))
    }

    async fn update_payment(
        &self,
        order_id: &str,
        expected: PaymentStatus,
        patch: &PaymentPatch,
    ) -> StoreResult<Option<Payment>> {
        let mut tables = self.tables.lock().await;
        let Some(payment) = tables.payments.get_mut(order_id) else {
            return Ok(None);
        };
        if payment.status != expected {
            return Ok(None);
        }
        patch.apply(payment);
        Ok(Some(payment.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ArtifactStatus;
    use chrono::Utc;

    #[tokio::test]
    async fn debit_refuses_to_overdraw() {
        let store = MemoryStore::new();
        store
            .insert_user_if_absent(&User::new("user_1", None))
            .await
            .unwrap();
        store.set_balance("user_1", 50).await;

        assert_eq!(store.debit_balance("user_1", 100).await.unwrap(), None);
        assert_eq!(store.debit_balance("user_1", 50).await.unwrap(), Some(0));
        assert_eq!(store.debit_balance("ghost", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn insert_user_keeps_existing_row() {
        let store = MemoryStore::new();
        store
            .insert_user_if_absent(&User::new("user_1", None))
            .await
            .unwrap();
        store.set_balance("user_1", 70).await;
        let again = store
            .insert_user_if_absent(&User::new("user_1", Some("a@b.c".into())))
            .await
            .unwrap();
        assert_eq!(again.credit_balance, 70);
        assert_eq!(again.email, None);
    }

    #[tokio::test]
    async fn mark_selected_flips_exactly_one() {
        let store = MemoryStore::new();
        let artifact_id = Uuid::new_v4();
        let copies: Vec<AdCopy> = (0..5)
            .map(|idx| AdCopy {
                id: Uuid::new_v4(),
                artifact_id,
                copy_index: idx,
                copy_text: format!("copy {idx}"),
                is_selected: false,
                created_at: Utc::now(),
            })
            .collect();
        store
            .insert_ad_copies(ArtifactKind::Video, &copies)
            .await
            .unwrap();

        store
            .mark_ad_copy_selected(ArtifactKind::Video, artifact_id, copies[1].id)
            .await
            .unwrap()
            .expect("selected");
        store
            .mark_ad_copy_selected(ArtifactKind::Video, artifact_id, copies[3].id)
            .await
            .unwrap()
            .expect("selected");
        let stored = store
            .list_ad_copies(ArtifactKind::Video, artifact_id)
            .await
            .unwrap();
        let selected: Vec<i32> = stored
            .iter()
            .filter(|c| c.is_selected)
            .map(|c| c.copy_index)
            .collect();
        assert_eq!(selected, vec![3]);

        let missing = store
            .mark_ad_copy_selected(ArtifactKind::Image, artifact_id, copies[0].id)
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn guarded_update_writes_nothing_on_mismatch() {
        let store = MemoryStore::new();
        let row = ArtifactRow {
            id: Uuid::new_v4(),
            user_id: "user_1".into(),
            product_image_id: Uuid::new_v4(),
            product_info_id: Uuid::new_v4(),
            status: ArtifactStatus::Pending,
            progress_stage: "init".into(),
            selected_ad_copy: None,
            output_url: None,
            error_message: None,
            is_public: false,
            credits_charged: 0,
            created_at: Utc::now(),
            completed_at: None,
        };
        store
            .insert_artifact(ArtifactKind::Image, &row)
            .await
            .unwrap();

        let patch = ArtifactPatch::state(ArtifactStatus::Processing, "ad_copy_generation");
        let missed = store
            .update_artifact(
                ArtifactKind::Image,
                row.id,
                &ArtifactGuard::at(ArtifactStatus::Pending, "ad_copy_selection"),
                &patch,
            )
            .await
            .unwrap();
        assert!(missed.is_none());
        let current = store
            .get_artifact(ArtifactKind::Image, row.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current, row);

        let applied = store
            .update_artifact(
                ArtifactKind::Image,
                row.id,
                &ArtifactGuard::at(ArtifactStatus::Pending, "init"),
                &patch,
            )
            .await
            .unwrap()
            .expect("applied");
        assert_eq!(applied.progress_stage, "ad_copy_generation");
    }

    #[tokio::test]
    async fn default_tiers_sorted_by_price() {
        let store = MemoryStore::with_default_tiers();
        let tiers = store.list_pricing_tiers().await.unwrap();
        assert_eq!(tiers.len(), 3);
        assert!(tiers.windows(2).all(|w| w[0].price <= w[1].price));
        assert!(store.get_pricing_tier("growth").await.unwrap().is_some());
        assert!(store.get_pricing_tier("nope").await.unwrap().is_none());
    }
}
