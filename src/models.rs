use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type UserId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub email: Option<String>,
    pub credit_balance: i64,
    #[serde(default)]
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: impl Into<UserId>, email: Option<String>) -> Self {
        Self {
            id: id.into(),
            email,
            credit_balance: 0,
            role: Role::User,
            created_at: Utc::now(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    Purchase,
    Usage,
    Refund,
    AdminGrant,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Purchase => "purchase",
            LedgerKind::Usage => "usage",
            LedgerKind::Refund => "refund",
            LedgerKind::AdminGrant => "admin_grant",
        }
    }
}

/// Immutable ledger line. `balance_after` is the balance returned by the
/// write that produced this entry, not a recomputation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: LedgerKind,
    pub amount: i64,
    pub balance_after: i64,
    #[serde(default)]
    pub related_artifact_id: Option<Uuid>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Video,
    Image,
}

impl ArtifactKind {
    pub fn table(&self) -> &'static str {
        match self {
            ArtifactKind::Video => "video_generations",
            ArtifactKind::Image => "image_generations",
        }
    }

    pub fn copies_table(&self) -> &'static str {
        match self {
            ArtifactKind::Video => "ad_copies",
            ArtifactKind::Image => "ad_image_copies",
        }
    }

    pub fn output_column(&self) -> &'static str {
        match self {
            ArtifactKind::Video => "video_url",
            ArtifactKind::Image => "image_url",
        }
    }

    pub fn route(&self) -> &'static str {
        match self {
            ArtifactKind::Video => "videos",
            ArtifactKind::Image => "images",
        }
    }

    pub fn from_route(segment: &str) -> Option<Self> {
        match segment.trim().to_lowercase().as_str() {
            "videos" | "video" => Some(ArtifactKind::Video),
            "images" | "image" => Some(ArtifactKind::Image),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Pending => "pending",
            ArtifactStatus::Processing => "processing",
            ArtifactStatus::Completed => "completed",
            ArtifactStatus::Failed => "failed",
            ArtifactStatus::Cancelled => "cancelled",
        }
    }

    /// States after which an observer stops watching.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ArtifactStatus::Completed | ArtifactStatus::Failed | ArtifactStatus::Cancelled
        )
    }
}

/// Persisted shape of a generation request. Video and image tables share it;
/// the output column is `video_url` or `image_url` depending on the table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRow {
    pub id: Uuid,
    pub user_id: UserId,
    pub product_image_id: Uuid,
    pub product_info_id: Uuid,
    pub status: ArtifactStatus,
    pub progress_stage: String,
    #[serde(default)]
    pub selected_ad_copy: Option<String>,
    #[serde(default, alias = "video_url", alias = "image_url")]
    pub output_url: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub credits_charged: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdCopy {
    pub id: Uuid,
    pub artifact_id: Uuid,
    pub copy_index: i32,
    pub copy_text: String,
    #[serde(default)]
    pub is_selected: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductInfo {
    pub id: Uuid,
    pub user_id: UserId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductImage {
    pub id: Uuid,
    pub user_id: UserId,
    pub storage_path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PricingTier {
    pub id: String,
    pub name: String,
    pub price: i64,
    pub credits: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Done,
    Canceled,
    Aborted,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Done => "done",
            PaymentStatus::Canceled => "canceled",
            PaymentStatus::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub order_id: String,
    pub user_id: UserId,
    pub pricing_tier_id: String,
    pub amount: i64,
    pub status: PaymentStatus,
    pub credits_granted: i64,
    #[serde(default)]
    pub payment_key: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Page {
    #[serde(default = "Page::default_page")]
    pub page: u32,
    #[serde(default = "Page::default_per_page")]
    pub per_page: u32,
}

impl Page {
    const MAX_PER_PAGE: u32 = 100;

    fn default_page() -> u32 {
        1
    }

    fn default_per_page() -> u32 {
        20
    }

    pub fn new(page: u32, per_page: u32) -> Self {
        Self { page, per_page }
    }

    pub fn limit(&self) -> usize {
        self.per_page.clamp(1, Self::MAX_PER_PAGE) as usize
    }

    pub fn offset(&self) -> usize {
        (self.page.max(1) as usize - 1) * self.limit()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(Self::default_page(), Self::default_per_page())
    }
}

#[derive(Debug, Serialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

impl<T> Paginated<T> {
    pub fn new(items: Vec<T>, total: u64, page: Page) -> Self {
        Self {
            items,
            total,
            page: page.page.max(1),
            per_page: page.limit() as u32,
        }
    }
}

/// Failure envelope. Every action reports failures this way; no error codes
/// are exposed, only a short localized message.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub success: bool,
    pub error: String,
    #[serde(
        rename = "insufficientCredits",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub insufficient_credits: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
            insufficient_credits: false,
            detail: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ActionResponse<T> {
    pub success: bool,
    #[serde(flatten)]
    pub data: T,
}

impl<T> ActionResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}
