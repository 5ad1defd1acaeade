use super::{
    ArtifactFilter, ArtifactGuard, ArtifactPatch, PaymentPatch, Store, StoreError, StoreResult,
};
use crate::http::build_client;
use crate::models::{
    AdCopy, ArtifactKind, ArtifactRow, LedgerEntry, Page, Payment, PaymentStatus, PricingTier,
    ProductImage, ProductInfo, User,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use urlencoding::encode;
use uuid::Uuid;

/// Store backed by the hosted Postgres REST interface, using the service
/// role key (row-level security is bypassed; ownership is checked by callers).
#[derive(Debug, Clone)]
pub struct SupabaseStore {
    base_url: String,
    service_key: String,
    http: Client,
}

impl SupabaseStore {
    pub fn new(base_url: &str, service_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
            http: build_client(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .ok()?;
        Some(Self::new(&base_url, &service_key))
    }

    fn table_url(&self, table: &str, query: &str) -> String {
        if query.is_empty() {
            format!("{}/rest/v1/{table}", self.base_url)
        } else {
            format!("{}/rest/v1/{table}?{query}", self.base_url)
        }
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn send(&self, request: RequestBuilder) -> StoreResult<Response> {
        let response = self
            .authed(request)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        let status = response.status();
        if status.as_u16() == 409 {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Conflict(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Request(format!("HTTP {status}: {body}")));
        }
        Ok(response)
    }

    async fn fetch<T: DeserializeOwned>(&self, url: String) -> StoreResult<Vec<T>> {
        let response = self.send(self.http.get(url)).await?;
        decode(response).await
    }

    async fn fetch_one<T: DeserializeOwned>(&self, url: String) -> StoreResult<Option<T>> {
        let mut rows: Vec<T> = self.fetch(url).await?;
        Ok(rows.pop())
    }

    async fn fetch_page<T: DeserializeOwned>(
        &self,
        url: String,
        page: Page,
    ) -> StoreResult<(Vec<T>, u64)> {
        let url = format!("{url}&limit={}&offset={}", page.limit(), page.offset());
        let response = self
            .send(self.http.get(url).header("Prefer", "count=exact"))
            .await?;
        let total = response
            .headers()
            .get("Content-Range")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_total);
        let rows: Vec<T> = decode(response).await?;
        let total = total.unwrap_or(rows.len() as u64);
        Ok((rows, total))
    }

    async fn insert(&self, table: &str, body: &Value, prefer: &str) -> StoreResult<Response> {
        self.send(
            self.http
                .post(self.table_url(table, ""))
                .header("Prefer", prefer)
                .json(body),
        )
        .await
    }

    async fn patch_returning<T: DeserializeOwned>(
        &self,
        url: String,
        body: &Value,
    ) -> StoreResult<Option<T>> {
        let response = self
            .send(
                self.http
                    .patch(url)
                    .header("Prefer", "return=representation")
                    .json(body),
            )
            .await?;
        let mut rows: Vec<T> = decode(response).await?;
        Ok(rows.pop())
    }

    async fn rpc_balance(&self, function: &str, user_id: &str, amount: i64) -> StoreResult<Option<i64>> {
        let url = format!("{}/rest/v1/rpc/{function}", self.base_url);
        let response = self
            .send(self.http.post(url).json(&json!({
                "p_user_id": user_id,
                "p_amount": amount,
            })))
            .await?;
        let value: Value = response
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))?;
        Ok(value.as_i64())
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> StoreResult<Vec<T>> {
    response
        .json()
        .await
        .map_err(|err| StoreError::Deserialize(err.to_string()))
}

/// Parses the total out of a `Content-Range` header such as `0-19/57` or `*/0`.
fn parse_total(range: &str) -> Option<u64> {
    range.rsplit_once('/')?.1.trim().parse().ok()
}

/// Artifact rows carry a kind-specific output column on the wire.
fn artifact_body(kind: ArtifactKind, value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            if let Some(url) = map.remove("output_url") {
                map.insert(kind.output_column().to_string(), url);
            }
            Value::Object(map)
        }
        other => other,
    }
}

fn guard_query(guard: &ArtifactGuard) -> String {
    let mut query = String::new();
    if !guard.statuses.is_empty() {
        let statuses: Vec<&str> = guard.statuses.iter().map(|s| s.as_str()).collect();
        query.push_str(&format!("&status=in.({})", statuses.join(",")));
    }
    if let Some(stage) = &guard.stage {
        query.push_str(&format!("&progress_stage=eq.{}", encode(stage)));
    }
    if let Some(charged) = guard.credits_charged {
        query.push_str(&format!("&credits_charged=eq.{charged}"));
    }
    query
}

fn filter_query(filter: &ArtifactFilter) -> String {
    let mut query = String::from("select=*&order=created_at.desc");
    if let Some(user_id) = &filter.user_id {
        query.push_str(&format!("&user_id=eq.{}", encode(user_id)));
    }
    if let Some(status) = filter.status {
        query.push_str(&format!("&status=eq.{}", status.as_str()));
    }
    if filter.public_only {
        query.push_str("&is_public=is.true");
    }
    query
}

fn to_value<T: serde::Serialize>(value: &T) -> StoreResult<Value> {
    serde_json::to_value(value).map_err(|err| StoreError::Deserialize(err.to_string()))
}

#[async_trait]
impl Store for SupabaseStore {
    async fn get_user(&self, id: &str) -> StoreResult<Option<User>> {
        self.fetch_one(self.table_url("users", &format!("id=eq.{}&select=*&limit=1", encode(id))))
            .await
    }

    async fn insert_user_if_absent(&self, user: &User) -> StoreResult<User> {
        self.insert(
            "users",
            &to_value(user)?,
            "resolution=ignore-duplicates,return=minimal",
        )
        .await?;
        self.get_user(&user.id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("user {} vanished after insert", user.id)))
    }

    async fn list_users(&self, page: Page) -> StoreResult<(Vec<User>, u64)> {
        self.fetch_page(
            self.table_url("users", "select=*&order=created_at.desc"),
            page,
        )
        .await
    }

    async fn debit_balance(&self, user_id: &str, amount: i64) -> StoreResult<Option<i64>> {
        self.rpc_balance("debit_credits", user_id, amount).await
    }

    async fn credit_balance(&self, user_id: &str, amount: i64) -> StoreResult<Option<i64>> {
        self.rpc_balance("credit_credits", user_id, amount).await
    }

    async fn delete_user(&self, user_id: &str) -> StoreResult<()> {
        self.send(
            self.http
                .delete(self.table_url("users", &format!("id=eq.{}", encode(user_id)))),
        )
        .await?;
        Ok(())
    }

    async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> StoreResult<()> {
        self.insert("credit_transactions", &to_value(entry)?, "return=minimal")
            .await?;
        Ok(())
    }

    async fn list_ledger_entries(
        &self,
        user_id: &str,
        page: Page,
    ) -> StoreResult<(Vec<LedgerEntry>, u64)> {
        self.fetch_page(
            self.table_url(
                "credit_transactions",
                &format!("user_id=eq.{}&select=*&order=created_at.desc", encode(user_id)),
            ),
            page,
        )
        .await
    }

    async fn ledger_entries_for_artifact(
        &self,
        artifact_id: Uuid,
    ) -> StoreResult<Vec<LedgerEntry>> {
        self.fetch(self.table_url(
            "credit_transactions",
            &format!("related_artifact_id=eq.{artifact_id}&select=*&order=created_at.asc"),
        ))
        .await
    }

    async fn insert_product(&self, info: &ProductInfo, image: &ProductImage) -> StoreResult<()> {
        self.insert("product_infos", &to_value(info)?, "return=minimal")
            .await?;
        self.insert("product_images", &to_value(image)?, "return=minimal")
            .await?;
        Ok(())
    }

    async fn get_product_image(&self, id: Uuid) -> StoreResult<Option<ProductImage>> {
        self.fetch_one(self.table_url("product_images", &format!("id=eq.{id}&select=*&limit=1")))
            .await
    }

    async fn insert_artifact(&self, kind: ArtifactKind, row: &ArtifactRow) -> StoreResult<()> {
        self.insert(kind.table(), &artifact_body(kind, to_value(row)?), "return=minimal")
            .await?;
        Ok(())
    }

    async fn get_artifact(&self, kind: ArtifactKind, id: Uuid) -> StoreResult<Option<ArtifactRow>> {
        self.fetch_one(self.table_url(kind.table(), &format!("id=eq.{id}&select=*&limit=1")))
            .await
    }

    async fn list_artifacts(
        &self,
        kind: ArtifactKind,
        filter: &ArtifactFilter,
        page: Page,
    ) -> StoreResult<(Vec<ArtifactRow>, u64)> {
        self.fetch_page(self.table_url(kind.table(), &filter_query(filter)), page)
            .await
    }

    async fn update_artifact(
        &self,
        kind: ArtifactKind,
        id: Uuid,
        guard: &ArtifactGuard,
        patch: &ArtifactPatch,
    ) -> StoreResult<Option<ArtifactRow>> {
        let url = self.table_url(kind.table(), &format!("id=eq.{id}{}", guard_query(guard)));
        self.patch_returning(url, &artifact_body(kind, to_value(patch)?))
            .await
    }

    async fn delete_ad_copies(&self, kind: ArtifactKind, artifact_id: Uuid) -> StoreResult<u64> {
        let response = self
            .send(
                self.http
                    .delete(self.table_url(
                        kind.copies_table(),
                        &format!("artifact_id=eq.{artifact_id}"),
                    ))
                    .header("Prefer", "return=representation"),
            )
            .await?;
        let removed: Vec<Value> = decode(response).await?;
        Ok(removed.len() as u64)
    }

    async fn insert_ad_copies(&self, kind: ArtifactKind, copies: &[AdCopy]) -> StoreResult<()> {
        self.insert(kind.copies_table(), &to_value(&copies)?, "return=minimal")
            .await?;
        Ok(())
    }

    async fn list_ad_copies(
        &self,
        kind: ArtifactKind,
        artifact_id: Uuid,
    ) -> StoreResult<Vec<AdCopy>> {
        self.fetch(self.table_url(
            kind.copies_table(),
            &format!("artifact_id=eq.{artifact_id}&select=*&order=copy_index.asc"),
        ))
        .await
    }

    async fn mark_ad_copy_selected(
        &self,
        kind: ArtifactKind,
        artifact_id: Uuid,
        copy_id: Uuid,
    ) -> StoreResult<Option<AdCopy>> {
        let clear = self.table_url(
            kind.copies_table(),
            &format!("artifact_id=eq.{artifact_id}&id=neq.{copy_id}&is_selected=is.true"),
        );
        self.send(self.http.patch(clear).json(&json!({ "is_selected": false })))
            .await?;
        let select = self.table_url(
            kind.copies_table(),
            &format!("artifact_id=eq.{artifact_id}&id=eq.{copy_id}"),
        );
        self.patch_returning(select, &json!({ "is_selected": true }))
            .await
    }

    async fn clear_ad_copy_selection(
        &self,
        kind: ArtifactKind,
        artifact_id: Uuid,
    ) -> StoreResult<()> {
        let url = self.table_url(
            kind.copies_table(),
            &format!("artifact_id=eq.{artifact_id}&is_selected=is.true"),
        );
        self.send(self.http.patch(url).json(&json!({ "is_selected": false })))
            .await?;
        Ok(())
    }

    async fn list_pricing_tiers(&self) -> StoreResult<Vec<PricingTier>> {
        self.fetch(self.table_url(
            "pricing_tiers",
            "is_active=is.true&select=*&order=price.asc",
        ))
        .await
    }

    async fn get_pricing_tier(&self, id: &str) -> StoreResult<Option<PricingTier>> {
        self.fetch_one(self.table_url(
            "pricing_tiers",
            &format!("id=eq.{}&is_active=is.true&select=*&limit=1", encode(id)),
        ))
        .await
    }

    async fn insert_payment(&self, payment: &Payment) -> StoreResult<()> {
        self.insert("payments", &to_value(payment)?, "return=minimal")
            .await?;
        Ok(())
    }

    async fn get_payment(&self, order_id: &str) -> StoreResult<Option<Payment>> {
        self.fetch_one(self.table_url(
            "payments",
            &format!("order_id=eq.{}&select=*&limit=1", encode(order_id)),
        ))
        .await
    }

    async fn list_payments(&self, user_id: &str, page: Page) -> StoreResult<(Vec<Payment>, u64)> {
        self.fetch_page(
            self.table_url(
                "payments",
                &format!("user_id=eq.{}&select=*&order=created_at.desc", encode(user_id)),
            ),
            page,
        )
        .await
    }

    async fn update_payment(
        &self,
        order_id: &str,
        expected: PaymentStatus,
        patch: &PaymentPatch,
    ) -> StoreResult<Option<Payment>> {
        let url = self.table_url(
            "payments",
            &format!(
                "order_id=eq.{}&status=eq.{}",
                encode(order_id),
                expected.as_str()
            ),
        );
        self.patch_returning(url, &to_value(patch)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ArtifactStatus;

    #[test]
    fn parses_content_range_totals() {
        assert_eq!(parse_total("0-19/57"), Some(57));
        assert_eq!(parse_total("*/0"), Some(0));
        assert_eq!(parse_total("0-19/*"), None);
    }

    #[test]
    fn artifact_body_renames_output_column() {
        let body = artifact_body(
            ArtifactKind::Image,
            json!({ "output_url": "https://cdn/x.png", "status": "completed" }),
        );
        assert_eq!(body["image_url"], json!("https://cdn/x.png"));
        assert!(body.get("output_url").is_none());
    }

    #[test]
    fn guard_query_encodes_all_conditions() {
        let guard = ArtifactGuard {
            statuses: vec![ArtifactStatus::Pending, ArtifactStatus::Failed],
            stage: Some("ad_copy_selection".into()),
            credits_charged: Some(100),
        };
        assert_eq!(
            guard_query(&guard),
            "&status=in.(pending,failed)&progress_stage=eq.ad_copy_selection&credits_charged=eq.100"
        );
        assert_eq!(guard_query(&ArtifactGuard::default()), "");
    }

    #[test]
    fn filter_query_scopes_public_gallery() {
        let filter = ArtifactFilter {
            user_id: None,
            status: Some(ArtifactStatus::Completed),
            public_only: true,
        };
        assert_eq!(
            filter_query(&filter),
            "select=*&order=created_at.desc&status=eq.completed&is_public=is.true"
        );
    }
}
