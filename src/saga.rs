//! Generation saga: the user-facing actions that move an artifact through its
//! stages, spend credits and call the workflow engine.
//!
//! Every action checks its preconditions in a fixed order (caller, artifact,
//! ownership, stage, funds) before writing anything. Stage changes are guarded
//! updates, so an action that loses a race to another request writes nothing
//! and reports `InvalidStage`. Steps that cannot be undone by a transaction are
//! undone by explicit compensation: stage restore and refund.

use crate::config::{CreditCosts, RefundPolicy};
use crate::dispatch::{DispatchError, DispatchRequest, Dispatcher};
use crate::error::{ActionError, ActionErrorKind};
use crate::ledger::{Ledger, SpendPolicy};
use crate::models::{
    AdCopy, ArtifactKind, ArtifactRow, ArtifactStatus, Page, Paginated, ProductImage,
    ProductInfo, User,
};
use crate::stage::{Action, Artifact, Stage};
use crate::storage::{Storage, in_user_namespace};
use crate::store::{ArtifactFilter, ArtifactGuard, ArtifactPatch, Store, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{marker::PhantomData, sync::Arc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const AD_COPY_FAILED: &str = "광고 문구 생성에 실패했습니다. 다시 시도해주세요.";
const VIDEO_FAILED: &str = "영상 생성 요청에 실패했습니다. 다시 시도해주세요.";
const IMAGE_FAILED: &str = "이미지 생성 요청에 실패했습니다. 다시 시도해주세요.";
const CANCELLED: &str = "사용자가 생성을 취소했습니다.";
const NOT_CANCELLABLE: &str = "이미 완료되었거나 종료된 작업은 취소할 수 없습니다.";
const MAX_CUSTOM_COPY_CHARS: usize = 500;
const MAX_PRODUCT_NAME_CHARS: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct NewArtifact {
    pub product_name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Storage path of the uploaded photo, `<user_id>/...`.
    pub image_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Candidate(Uuid),
    Custom(String),
}

/// Request body for selection: exactly one of the two fields.
#[derive(Debug, Clone, Deserialize)]
pub struct SelectRequest {
    #[serde(default)]
    pub ad_copy_id: Option<Uuid>,
    #[serde(default)]
    pub custom_text: Option<String>,
}

impl SelectRequest {
    pub fn into_selection(self) -> Result<Selection, ActionError> {
        match (self.ad_copy_id, self.custom_text) {
            (Some(id), None) => Ok(Selection::Candidate(id)),
            (None, Some(text)) => Ok(Selection::Custom(text)),
            _ => Err(ActionError::invalid_input(
                "select_ad_copy",
                "exactly one of ad_copy_id or custom_text is required",
            )
            .with_message("광고 문구를 하나 선택하거나 직접 입력해주세요.")),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AdCopyBatch<S: Stage> {
    pub artifact: Artifact<S>,
    pub ad_copies: Vec<AdCopy>,
}

#[derive(Debug, Serialize)]
pub struct GenerationStarted<S: Stage> {
    pub artifact: Artifact<S>,
    pub credits_charged: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance_after: Option<i64>,
}

/// Progress report posted back by the workflow engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompletionReport {
    Processing {
        progress_stage: String,
    },
    Completed {
        output_url: String,
    },
    Failed {
        #[serde(default)]
        error_message: Option<String>,
    },
}

#[derive(Debug, Serialize)]
pub struct CallbackOutcome {
    pub applied: bool,
    pub artifact_id: Uuid,
    pub status: ArtifactStatus,
    pub progress_stage: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DownloadLink {
    pub url: String,
    pub expires_in: u64,
}

#[derive(Debug, Serialize)]
pub struct GalleryItem {
    pub id: Uuid,
    pub output_url: Option<String>,
    pub selected_ad_copy: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Collaborators shared by both artifact kinds.
#[derive(Clone)]
pub struct SagaContext {
    pub store: Arc<dyn Store>,
    pub ledger: Ledger,
    pub dispatcher: Dispatcher,
    pub storage: Storage,
    pub costs: CreditCosts,
    pub refund_policy: RefundPolicy,
}

impl SagaContext {
    pub fn new(store: Arc<dyn Store>, dispatcher: Dispatcher, storage: Storage) -> Self {
        Self {
            ledger: Ledger::new(store.clone()),
            store,
            dispatcher,
            storage,
            costs: CreditCosts::default(),
            refund_policy: RefundPolicy::default(),
        }
    }

    pub fn with_costs(mut self, costs: CreditCosts) -> Self {
        self.costs = costs;
        self
    }

    pub fn with_refund_policy(mut self, policy: RefundPolicy) -> Self {
        self.refund_policy = policy;
        self
    }
}

pub struct Orchestrator<S: Stage> {
    ctx: SagaContext,
    _stage: PhantomData<S>,
}

impl<S: Stage> Orchestrator<S> {
    pub fn new(ctx: SagaContext) -> Self {
        Self {
            ctx,
            _stage: PhantomData,
        }
    }

    fn store(&self) -> &dyn Store {
        self.ctx.store.as_ref()
    }

    fn cost(&self) -> i64 {
        match S::KIND {
            ArtifactKind::Video => self.ctx.costs.video,
            ArtifactKind::Image => self.ctx.costs.image,
        }
    }

    fn generation_failed() -> &'static str {
        match S::KIND {
            ArtifactKind::Video => VIDEO_FAILED,
            ArtifactKind::Image => IMAGE_FAILED,
        }
    }

    fn usage_description() -> &'static str {
        match S::KIND {
            ArtifactKind::Video => "영상 광고 생성",
            ArtifactKind::Image => "이미지 광고 생성",
        }
    }

    async fn caller(&self, user_id: &str, op: &'static str) -> Result<User, ActionError> {
        if user_id.trim().is_empty() {
            return Err(ActionError::unauthenticated(op));
        }
        self.store()
            .get_user(user_id)
            .await
            .map_err(ActionError::store(op))?
            .ok_or_else(|| ActionError::unauthenticated(op))
    }

    async fn load(&self, id: Uuid, op: &'static str) -> Result<Artifact<S>, ActionError> {
        let row = self
            .store()
            .get_artifact(S::KIND, id)
            .await
            .map_err(ActionError::store(op))?
            .ok_or_else(|| ActionError::not_found(op, format!("{:?} {id}", S::KIND)))?;
        Artifact::try_from(row).map_err(ActionError::store(op))
    }

    async fn load_owned(
        &self,
        user_id: &str,
        id: Uuid,
        op: &'static str,
    ) -> Result<(User, Artifact<S>), ActionError> {
        let user = self.caller(user_id, op).await?;
        let artifact = self.load(id, op).await?;
        if !artifact.is_owned_by(&user.id) {
            return Err(ActionError::forbidden(
                op,
                format!("{id} is owned by another user"),
            ));
        }
        Ok((user, artifact))
    }

    /// Applies `action` through the transition table as one guarded update.
    async fn step(
        &self,
        artifact: &Artifact<S>,
        action: Action<S>,
        mut patch: ArtifactPatch,
        op: &'static str,
    ) -> Result<Artifact<S>, ActionError> {
        let (status, stage) = artifact.next(action).map_err(ActionError::stage(op))?;
        patch.status = Some(status);
        patch.progress_stage = Some(stage.as_str().to_string());
        let guard = ArtifactGuard::at(artifact.status, artifact.progress_stage.as_str());
        let row = self
            .store()
            .update_artifact(S::KIND, artifact.id, &guard, &patch)
            .await
            .map_err(ActionError::store(op))?
            .ok_or_else(|| {
                ActionError::invalid_stage(op, format!("{} changed concurrently", artifact.id))
            })?;
        debug!(
            target = "adstudio.saga",
            artifact_id = %artifact.id,
            action = action.name(),
            from = artifact.progress_stage.as_str(),
            to = stage.as_str(),
            status = status.as_str(),
            "stage_transition"
        );
        Artifact::try_from(row).map_err(ActionError::store(op))
    }

    /// Best-effort compensation step; the caller reports the original failure.
    async fn compensate(
        &self,
        artifact: &Artifact<S>,
        action: Action<S>,
        message: Option<&str>,
        op: &'static str,
    ) {
        let patch = ArtifactPatch::default().with_error(message);
        if let Err(err) = self.step(artifact, action, patch, op).await {
            error!(
                target = "adstudio.saga",
                artifact_id = %artifact.id,
                action = action.name(),
                error = %err,
                "compensation_failed"
            );
        }
    }

    /// Flags `copy_id` as the chosen candidate, or clears every flag when the
    /// user wrote their own text.
    async fn flag_selection(
        &self,
        artifact_id: Uuid,
        copy_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        match copy_id {
            Some(copy_id) => self
                .store()
                .mark_ad_copy_selected(S::KIND, artifact_id, copy_id)
                .await
                .map(|_| ()),
            None => self.store().clear_ad_copy_selection(S::KIND, artifact_id).await,
        }
    }

    /// Returns an artifact to `ad_copy_selection` with no candidate flagged.
    async fn restore_selection(
        &self,
        artifact: &Artifact<S>,
        status: ArtifactStatus,
        message: Option<&str>,
        op: &'static str,
    ) {
        if let Err(err) = self
            .store()
            .clear_ad_copy_selection(S::KIND, artifact.id)
            .await
        {
            error!(
                target = "adstudio.saga",
                artifact_id = %artifact.id,
                error = %err,
                "selection_clear_failed"
            );
        }
        self.compensate(artifact, Action::RestoreSelection(status), message, op)
            .await;
    }

    fn request(artifact: &Artifact<S>, selected: Option<String>) -> DispatchRequest {
        DispatchRequest {
            artifact_id: artifact.id,
            product_image_id: artifact.product_image_id,
            product_info_id: artifact.product_info_id,
            selected_ad_copy: selected,
        }
    }

    pub async fn create_artifact(
        &self,
        user_id: &str,
        input: NewArtifact,
    ) -> Result<Artifact<S>, ActionError> {
        let op = "create_artifact";
        let user = self.caller(user_id, op).await?;
        let name = input.product_name.trim();
        if name.is_empty() || name.chars().count() > MAX_PRODUCT_NAME_CHARS {
            return Err(ActionError::invalid_input(op, "product name length")
                .with_message("제품명을 1자 이상 100자 이하로 입력해주세요."));
        }
        let image_path = input.image_path.trim().trim_start_matches('/');
        if !in_user_namespace(&user.id, image_path) {
            return Err(ActionError::forbidden(
                op,
                format!("image path `{image_path}` outside user namespace"),
            ));
        }

        let now = Utc::now();
        let info = ProductInfo {
            id: Uuid::new_v4(),
            user_id: user.id.clone(),
            name: name.to_string(),
            description: input
                .description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
            created_at: now,
        };
        let image = ProductImage {
            id: Uuid::new_v4(),
            user_id: user.id.clone(),
            storage_path: image_path.to_string(),
            created_at: now,
        };
        self.store()
            .insert_product(&info, &image)
            .await
            .map_err(ActionError::store(op))?;

        let row = ArtifactRow {
            id: Uuid::new_v4(),
            user_id: user.id.clone(),
            product_image_id: image.id,
            product_info_id: info.id,
            status: ArtifactStatus::Pending,
            progress_stage: S::INIT.as_str().to_string(),
            selected_ad_copy: None,
            output_url: None,
            error_message: None,
            is_public: false,
            credits_charged: 0,
            created_at: now,
            completed_at: None,
        };
        self.store()
            .insert_artifact(S::KIND, &row)
            .await
            .map_err(ActionError::store(op))?;
        info!(
            target = "adstudio.saga",
            user_id = %user.id,
            artifact_id = %row.id,
            kind = S::KIND.route(),
            "artifact_created"
        );
        Artifact::try_from(row).map_err(ActionError::store(op))
    }

    pub async fn generate_ad_copies(
        &self,
        user_id: &str,
        id: Uuid,
    ) -> Result<AdCopyBatch<S>, ActionError> {
        let op = "generate_ad_copies";
        let (_, artifact) = self.load_owned(user_id, id, op).await?;
        let artifact = self
            .step(
                &artifact,
                Action::GenerateAdCopies,
                ArtifactPatch::default().with_error(None),
                op,
            )
            .await?;
        self.produce_candidates(artifact, Action::Fail, op).await
    }

    pub async fn regenerate_ad_copies(
        &self,
        user_id: &str,
        id: Uuid,
    ) -> Result<AdCopyBatch<S>, ActionError> {
        let op = "regenerate_ad_copies";
        let (_, artifact) = self.load_owned(user_id, id, op).await?;
        let artifact = self
            .step(
                &artifact,
                Action::RegenerateAdCopies,
                ArtifactPatch {
                    selected_ad_copy: Some(None),
                    ..ArtifactPatch::default()
                }
                .with_error(None),
                op,
            )
            .await?;
        self.produce_candidates(
            artifact,
            Action::RestoreSelection(ArtifactStatus::Failed),
            op,
        )
        .await
    }

    /// Replaces the artifact's candidates with a fresh batch from the engine.
    /// `on_failure` is the compensation applied when the engine call fails.
    async fn produce_candidates(
        &self,
        artifact: Artifact<S>,
        on_failure: Action<S>,
        op: &'static str,
    ) -> Result<AdCopyBatch<S>, ActionError> {
        let removed = self
            .store()
            .delete_ad_copies(S::KIND, artifact.id)
            .await
            .map_err(ActionError::store(op))?;
        if removed > 0 {
            debug!(
                target = "adstudio.saga",
                artifact_id = %artifact.id,
                removed,
                "prior_ad_copies_removed"
            );
        }

        let texts = match self
            .ctx
            .dispatcher
            .generate_ad_copies(S::KIND, &Self::request(&artifact, None))
            .await
        {
            Ok(texts) => texts,
            Err(err) => {
                self.compensate(&artifact, on_failure, Some(AD_COPY_FAILED), op)
                    .await;
                return Err(dispatch_failure(op, &err, AD_COPY_FAILED));
            }
        };

        let now = Utc::now();
        let copies: Vec<AdCopy> = texts
            .into_iter()
            .enumerate()
            .map(|(idx, text)| AdCopy {
                id: Uuid::new_v4(),
                artifact_id: artifact.id,
                copy_index: idx as i32 + 1,
                copy_text: text,
                is_selected: false,
                created_at: now,
            })
            .collect();
        if let Err(err) = self.store().insert_ad_copies(S::KIND, &copies).await {
            self.compensate(&artifact, on_failure, Some(AD_COPY_FAILED), op)
                .await;
            return Err(ActionError::persistence(op, err.to_string()));
        }

        let artifact = self
            .step(&artifact, Action::AdCopiesReady, ArtifactPatch::default(), op)
            .await?;
        info!(
            target = "adstudio.saga",
            artifact_id = %artifact.id,
            count = copies.len(),
            "ad_copies_ready"
        );
        Ok(AdCopyBatch {
            artifact,
            ad_copies: copies,
        })
    }

    pub async fn select_ad_copy_and_generate(
        &self,
        user_id: &str,
        id: Uuid,
        selection: Selection,
    ) -> Result<GenerationStarted<S>, ActionError> {
        let op = "select_ad_copy";
        let (user, artifact) = self.load_owned(user_id, id, op).await?;
        artifact
            .next(Action::SelectAdCopy)
            .map_err(ActionError::stage(op))?;
        let policy = SpendPolicy::from(user.role);
        let cost = self.cost();
        if !policy.covers(&user, cost) {
            return Err(ActionError::insufficient_funds(
                op,
                user.credit_balance,
                cost,
            ));
        }

        let (copy_id, text) = match selection {
            Selection::Candidate(copy_id) => {
                let copy = self
                    .store()
                    .list_ad_copies(S::KIND, artifact.id)
                    .await
                    .map_err(ActionError::store(op))?
                    .into_iter()
                    .find(|copy| copy.id == copy_id)
                    .ok_or_else(|| ActionError::not_found(op, format!("ad copy {copy_id}")))?;
                (Some(copy.id), copy.copy_text)
            }
            Selection::Custom(text) => {
                let text = text.trim().to_string();
                if text.is_empty() || text.chars().count() > MAX_CUSTOM_COPY_CHARS {
                    return Err(ActionError::invalid_input(op, "custom copy length")
                        .with_message("광고 문구를 1자 이상 500자 이하로 입력해주세요."));
                }
                (None, text)
            }
        };

        let mut artifact = self
            .step(
                &artifact,
                Action::SelectAdCopy,
                ArtifactPatch {
                    selected_ad_copy: Some(Some(text.clone())),
                    ..ArtifactPatch::default()
                }
                .with_error(None),
                op,
            )
            .await?;

        if let Err(err) = self.flag_selection(artifact.id, copy_id).await {
            self.restore_selection(&artifact, ArtifactStatus::Pending, None, op)
                .await;
            return Err(ActionError::store(op)(err));
        }

        let debit = match self
            .ctx
            .ledger
            .deduct(
                &user.id,
                cost,
                policy,
                Some(artifact.id),
                Self::usage_description(),
            )
            .await
        {
            Ok(debit) => debit,
            Err(err) => {
                // Funds were spent by a concurrent request after the precheck.
                self.restore_selection(&artifact, ArtifactStatus::Pending, None, op)
                    .await;
                return Err(ActionError::ledger(op)(err));
            }
        };
        if debit.charged > 0 {
            artifact.credits_charged = self.record_charge(&artifact, debit.charged).await;
        }

        if let Err(err) = self
            .ctx
            .dispatcher
            .start_generation(S::KIND, &Self::request(&artifact, Some(text)))
            .await
        {
            let message = Self::generation_failed();
            self.restore_selection(&artifact, ArtifactStatus::Failed, Some(message), op)
                .await;
            self.settle_failed_charge(&user.id, artifact.id, message)
                .await;
            return Err(dispatch_failure(op, &err, message));
        }

        info!(
            target = "adstudio.saga",
            user_id = %user.id,
            artifact_id = %artifact.id,
            charged = debit.charged,
            "generation_started"
        );
        Ok(GenerationStarted {
            artifact,
            credits_charged: debit.charged,
            balance_after: debit.balance_after,
        })
    }

    /// Adds `amount` to the artifact's outstanding charge so a later refund
    /// knows what to return.
    async fn record_charge(&self, artifact: &Artifact<S>, amount: i64) -> i64 {
        let total = artifact.credits_charged + amount;
        let patch = ArtifactPatch {
            credits_charged: Some(total),
            ..ArtifactPatch::default()
        };
        match self
            .store()
            .update_artifact(
                S::KIND,
                artifact.id,
                &ArtifactGuard::charged(artifact.credits_charged),
                &patch,
            )
            .await
        {
            Ok(Some(_)) => total,
            Ok(None) => {
                error!(
                    target = "adstudio.saga",
                    artifact_id = %artifact.id,
                    amount,
                    "charge_not_recorded"
                );
                artifact.credits_charged
            }
            Err(err) => {
                error!(
                    target = "adstudio.saga",
                    artifact_id = %artifact.id,
                    amount,
                    error = %err,
                    "charge_not_recorded"
                );
                artifact.credits_charged
            }
        }
    }

    /// Applies the configured refund policy to a generation that will not
    /// produce output.
    async fn settle_failed_charge(&self, user_id: &str, id: Uuid, reason: &str) -> Option<i64> {
        match self.ctx.refund_policy {
            RefundPolicy::RefundOnFailure => self.refund_charge(user_id, id, reason).await,
            RefundPolicy::RetainDebit => {
                warn!(
                    target = "adstudio.saga",
                    user_id = %user_id,
                    artifact_id = %id,
                    "debit_retained_after_failure"
                );
                None
            }
        }
    }

    /// Returns the artifact's outstanding charge at most once: the charge is
    /// zeroed by a guarded update before the ledger credit is issued.
    async fn refund_charge(&self, user_id: &str, id: Uuid, reason: &str) -> Option<i64> {
        let row = match self.store().get_artifact(S::KIND, id).await {
            Ok(Some(row)) => row,
            Ok(None) => return None,
            Err(err) => {
                error!(target = "adstudio.saga", artifact_id = %id, error = %err, "refund_lookup_failed");
                return None;
            }
        };
        let charged = row.credits_charged;
        if charged <= 0 {
            return None;
        }
        let patch = ArtifactPatch {
            credits_charged: Some(0),
            ..ArtifactPatch::default()
        };
        match self
            .store()
            .update_artifact(S::KIND, id, &ArtifactGuard::charged(charged), &patch)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => return None,
            Err(err) => {
                error!(target = "adstudio.saga", artifact_id = %id, error = %err, "refund_claim_failed");
                return None;
            }
        }
        match self.ctx.ledger.refund(user_id, charged, Some(id), reason).await {
            Ok(balance) => {
                info!(
                    target = "adstudio.saga",
                    user_id = %user_id,
                    artifact_id = %id,
                    amount = charged,
                    balance_after = balance,
                    "charge_refunded"
                );
                Some(balance)
            }
            Err(err) => {
                error!(
                    target = "adstudio.saga",
                    user_id = %user_id,
                    artifact_id = %id,
                    amount = charged,
                    error = %err,
                    "refund_failed"
                );
                None
            }
        }
    }

    /// Marks the artifact cancelled. The engine is not told to stop, and the
    /// charge is kept.
    pub async fn cancel(&self, user_id: &str, id: Uuid) -> Result<Artifact<S>, ActionError> {
        let op = "cancel";
        let (_, artifact) = self.load_owned(user_id, id, op).await?;
        let artifact = self
            .step(
                &artifact,
                Action::Cancel,
                ArtifactPatch::default().with_error(Some(CANCELLED)),
                op,
            )
            .await
            .map_err(|err| match err.kind() {
                ActionErrorKind::InvalidStage => err.with_message(NOT_CANCELLABLE),
                _ => err,
            })?;
        info!(
            target = "adstudio.saga",
            user_id = %user_id,
            artifact_id = %id,
            "generation_cancelled"
        );
        Ok(artifact)
    }

    /// Applies a verified progress report from the workflow engine. Repeated
    /// reports and reports for cancelled artifacts are acknowledged without
    /// effect.
    pub async fn complete_from_callback(
        &self,
        id: Uuid,
        report: CompletionReport,
    ) -> Result<CallbackOutcome, ActionError> {
        let op = "completion_callback";
        let artifact = self.load(id, op).await?;
        if artifact.status == ArtifactStatus::Cancelled {
            info!(
                target = "adstudio.saga",
                artifact_id = %id,
                "late_report_ignored"
            );
            return Ok(outcome(&artifact, false));
        }

        let updated = match report {
            CompletionReport::Processing { progress_stage } => {
                let target = S::parse(&progress_stage).ok_or_else(|| {
                    ActionError::invalid_input(op, format!("unknown stage `{progress_stage}`"))
                })?;
                if artifact.status == ArtifactStatus::Processing
                    && target == artifact.progress_stage
                {
                    return Ok(outcome(&artifact, false));
                }
                self.step(&artifact, Action::Advance(target), ArtifactPatch::default(), op)
                    .await?
            }
            CompletionReport::Completed { output_url } => {
                let output_url = output_url.trim().to_string();
                if output_url.is_empty() {
                    return Err(ActionError::invalid_input(op, "empty output_url"));
                }
                if artifact.status == ArtifactStatus::Completed
                    && artifact.output_url.as_deref() == Some(output_url.as_str())
                {
                    return Ok(outcome(&artifact, false));
                }
                let patch = ArtifactPatch {
                    output_url: Some(Some(output_url)),
                    completed_at: Some(Some(Utc::now())),
                    ..ArtifactPatch::default()
                }
                .with_error(None);
                self.step(&artifact, Action::Complete, patch, op).await?
            }
            CompletionReport::Failed { error_message } => {
                if artifact.status == ArtifactStatus::Failed {
                    return Ok(outcome(&artifact, false));
                }
                let message = error_message
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| Self::generation_failed().to_string());
                let updated = self
                    .step(
                        &artifact,
                        Action::Fail,
                        ArtifactPatch::default().with_error(Some(&message)),
                        op,
                    )
                    .await?;
                self.settle_failed_charge(&artifact.user_id, id, &message)
                    .await;
                updated
            }
        };
        info!(
            target = "adstudio.saga",
            artifact_id = %id,
            status = updated.status.as_str(),
            stage = updated.progress_stage.as_str(),
            "callback_applied"
        );
        Ok(outcome(&updated, true))
    }

    pub async fn get(&self, user_id: &str, id: Uuid) -> Result<Artifact<S>, ActionError> {
        let (_, artifact) = self.load_owned(user_id, id, "get_artifact").await?;
        Ok(artifact)
    }

    pub async fn list(
        &self,
        user_id: &str,
        status: Option<ArtifactStatus>,
        page: Page,
    ) -> Result<Paginated<Artifact<S>>, ActionError> {
        let op = "list_artifacts";
        let user = self.caller(user_id, op).await?;
        let filter = ArtifactFilter {
            status,
            ..ArtifactFilter::owned_by(&user.id)
        };
        let (rows, total) = self
            .store()
            .list_artifacts(S::KIND, &filter, page)
            .await
            .map_err(ActionError::store(op))?;
        let items = rows
            .into_iter()
            .map(Artifact::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(ActionError::store(op))?;
        Ok(Paginated::new(items, total, page))
    }

    pub async fn list_ad_copies(&self, user_id: &str, id: Uuid) -> Result<Vec<AdCopy>, ActionError> {
        let op = "list_ad_copies";
        self.load_owned(user_id, id, op).await?;
        self.store()
            .list_ad_copies(S::KIND, id)
            .await
            .map_err(ActionError::store(op))
    }

    /// Publishes or hides a completed artifact in the gallery.
    pub async fn set_visibility(
        &self,
        user_id: &str,
        id: Uuid,
        is_public: bool,
    ) -> Result<Artifact<S>, ActionError> {
        let op = "set_visibility";
        let (_, artifact) = self.load_owned(user_id, id, op).await?;
        if artifact.status != ArtifactStatus::Completed {
            return Err(ActionError::invalid_stage(op, "only completed artifacts can be shared")
                .with_message("완료된 결과물만 공개할 수 있습니다."));
        }
        let guard = ArtifactGuard {
            statuses: vec![ArtifactStatus::Completed],
            ..ArtifactGuard::default()
        };
        let patch = ArtifactPatch {
            is_public: Some(is_public),
            ..ArtifactPatch::default()
        };
        let row = self
            .store()
            .update_artifact(S::KIND, id, &guard, &patch)
            .await
            .map_err(ActionError::store(op))?
            .ok_or_else(|| ActionError::invalid_stage(op, "artifact changed concurrently"))?;
        Artifact::try_from(row).map_err(ActionError::store(op))
    }

    pub async fn download_url(&self, user_id: &str, id: Uuid) -> Result<DownloadLink, ActionError> {
        let op = "download_url";
        let (_, artifact) = self.load_owned(user_id, id, op).await?;
        let output = match (artifact.status, artifact.output_url.as_deref()) {
            (ArtifactStatus::Completed, Some(output)) => output,
            _ => {
                return Err(ActionError::invalid_stage(op, "no completed output")
                    .with_message("아직 다운로드할 결과물이 없습니다."));
            }
        };
        let url = self
            .ctx
            .storage
            .download_url(output)
            .await
            .map_err(|err| ActionError::from_storage(op, err))?;
        Ok(DownloadLink {
            url,
            expires_in: self.ctx.storage.signed_url_ttl().as_secs(),
        })
    }

    /// Public, completed artifacts of every user.
    pub async fn gallery(&self, page: Page) -> Result<Paginated<GalleryItem>, ActionError> {
        let op = "gallery";
        let filter = ArtifactFilter {
            status: Some(ArtifactStatus::Completed),
            public_only: true,
            ..ArtifactFilter::default()
        };
        let (rows, total) = self
            .store()
            .list_artifacts(S::KIND, &filter, page)
            .await
            .map_err(ActionError::store(op))?;
        let items = rows
            .into_iter()
            .map(|row| GalleryItem {
                id: row.id,
                output_url: row.output_url,
                selected_ad_copy: row.selected_ad_copy,
                created_at: row.created_at,
            })
            .collect();
        Ok(Paginated::new(items, total, page))
    }
}

fn outcome<S: Stage>(artifact: &Artifact<S>, applied: bool) -> CallbackOutcome {
    CallbackOutcome {
        applied,
        artifact_id: artifact.id,
        status: artifact.status,
        progress_stage: artifact.progress_stage.as_str(),
    }
}

fn dispatch_failure(op: &'static str, err: &DispatchError, message: &'static str) -> ActionError {
    let err = ActionError::from_dispatch(op, err);
    match err.kind() {
        ActionErrorKind::Dispatch => err.with_message(message),
        _ => err,
    }
}
