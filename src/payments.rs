//! Credit purchases through an external card gateway.
//!
//! An order is recorded `pending` before the client is redirected to the
//! gateway's widget. The gateway then sends the client back with a payment key,
//! and `confirm` finalizes the charge server-side before any credits move.

use crate::config::{PAYMENT_API_ROOT, env_string};
use crate::error::ActionError;
use crate::http::build_client;
use crate::ledger::{Ledger, LedgerError};
use crate::models::{Page, Paginated, Payment, PaymentStatus, PricingTier, User};
use crate::store::{PaymentPatch, Store};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use rand::{Rng, distr::Alphanumeric};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum PaymentGatewayError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("gateway rejected ({status}) {code}: {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },
    #[error("invalid response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Confirmation {
    pub status: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(rename = "approvedAt", default)]
    pub approved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct GatewayFailure {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone)]
pub struct PaymentGateway {
    root: String,
    secret_key: Option<String>,
    http: Client,
}

impl PaymentGateway {
    pub fn new(root: &str, secret_key: Option<String>) -> Self {
        Self {
            root: root.trim_end_matches('/').to_string(),
            secret_key,
            http: build_client(),
        }
    }

    pub fn from_env() -> Self {
        let gateway = Self::new(&PAYMENT_API_ROOT, env_string("PAYMENT_SECRET_KEY"));
        if gateway.is_offline() {
            warn!(
                target = "adstudio.payments",
                "PAYMENT_SECRET_KEY not set; payments are approved offline"
            );
        }
        gateway
    }

    /// Without a secret key every confirmation is approved locally.
    pub fn is_offline(&self) -> bool {
        self.secret_key.is_none()
    }

    fn authorization(&self) -> Option<String> {
        self.secret_key
            .as_ref()
            .map(|key| format!("Basic {}", STANDARD.encode(format!("{key}:"))))
    }

    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, PaymentGatewayError> {
        let mut request = self.http.post(format!("{}{path}", self.root)).json(&body);
        if let Some(auth) = self.authorization() {
            request = request.header("Authorization", auth);
        }
        let response = request
            .send()
            .await
            .map_err(|err| PaymentGatewayError::Request(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let raw = response.text().await.unwrap_or_default();
        let failure: GatewayFailure = serde_json::from_str(&raw).unwrap_or(GatewayFailure {
            code: "UNKNOWN".into(),
            message: raw,
        });
        Err(PaymentGatewayError::Rejected {
            status: status.as_u16(),
            code: failure.code,
            message: failure.message,
        })
    }

    pub async fn confirm(
        &self,
        payment_key: &str,
        order_id: &str,
        amount: i64,
    ) -> Result<Confirmation, PaymentGatewayError> {
        if self.is_offline() {
            return Ok(Confirmation {
                status: "DONE".into(),
                method: Some("offline".into()),
                approved_at: Some(Utc::now()),
            });
        }
        let response = self
            .post(
                "/v1/payments/confirm",
                json!({ "paymentKey": payment_key, "orderId": order_id, "amount": amount }),
            )
            .await?;
        response
            .json()
            .await
            .map_err(|err| PaymentGatewayError::Decode(err.to_string()))
    }

    pub async fn cancel(&self, payment_key: &str, reason: &str) -> Result<(), PaymentGatewayError> {
        if self.is_offline() {
            return Ok(());
        }
        self.post(
            &format!("/v1/payments/{}/cancel", urlencoding::encode(payment_key)),
            json!({ "cancelReason": reason }),
        )
        .await?;
        Ok(())
    }
}

/// `ORD-<yyyymmddHHMMSS>-<8 random alphanumerics>`.
pub fn new_order_id(now: DateTime<Utc>) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("ORD-{}-{}", now.format("%Y%m%d%H%M%S"), suffix.to_uppercase())
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmRequest {
    #[serde(alias = "paymentKey")]
    pub payment_key: String,
    #[serde(alias = "orderId")]
    pub order_id: String,
    pub amount: i64,
}

#[derive(Debug, Serialize)]
pub struct ConfirmedPayment {
    pub payment: Payment,
    pub balance_after: i64,
}

#[derive(Clone)]
pub struct Payments {
    store: Arc<dyn Store>,
    ledger: Ledger,
    gateway: PaymentGateway,
}

impl Payments {
    pub fn new(store: Arc<dyn Store>, gateway: PaymentGateway) -> Self {
        Self {
            ledger: Ledger::new(store.clone()),
            store,
            gateway,
        }
    }

    async fn caller(&self, user_id: &str, op: &'static str) -> Result<User, ActionError> {
        self.store
            .get_user(user_id)
            .await
            .map_err(ActionError::store(op))?
            .ok_or_else(|| ActionError::unauthenticated(op))
    }

    async fn owned_payment(
        &self,
        user: &User,
        order_id: &str,
        op: &'static str,
    ) -> Result<Payment, ActionError> {
        let payment = self
            .store
            .get_payment(order_id)
            .await
            .map_err(ActionError::store(op))?
            .ok_or_else(|| ActionError::not_found(op, format!("order {order_id}")))?;
        if payment.user_id != user.id {
            return Err(ActionError::forbidden(op, format!("order {order_id}")));
        }
        Ok(payment)
    }

    async fn transition(
        &self,
        order_id: &str,
        expected: PaymentStatus,
        patch: PaymentPatch,
        op: &'static str,
    ) -> Result<Payment, ActionError> {
        self.store
            .update_payment(order_id, expected, &patch)
            .await
            .map_err(ActionError::store(op))?
            .ok_or_else(|| {
                ActionError::invalid_stage(op, format!("order {order_id} is no longer {expected:?}"))
                    .with_message("이미 처리된 결제입니다.")
            })
    }

    pub async fn pricing_tiers(&self) -> Result<Vec<PricingTier>, ActionError> {
        let tiers = self
            .store
            .list_pricing_tiers()
            .await
            .map_err(ActionError::store("pricing_tiers"))?;
        Ok(tiers.into_iter().filter(|tier| tier.is_active).collect())
    }

    pub async fn create_order(&self, user_id: &str, tier_id: &str) -> Result<Payment, ActionError> {
        let op = "create_order";
        let user = self.caller(user_id, op).await?;
        let tier = self
            .store
            .get_pricing_tier(tier_id)
            .await
            .map_err(ActionError::store(op))?
            .filter(|tier| tier.is_active)
            .ok_or_else(|| ActionError::not_found(op, format!("pricing tier {tier_id}")))?;
        let now = Utc::now();
        let payment = Payment {
            order_id: new_order_id(now),
            user_id: user.id.clone(),
            pricing_tier_id: tier.id.clone(),
            amount: tier.price,
            status: PaymentStatus::Pending,
            credits_granted: tier.credits,
            payment_key: None,
            method: None,
            approved_at: None,
            cancel_reason: None,
            created_at: now,
        };
        self.store
            .insert_payment(&payment)
            .await
            .map_err(ActionError::store(op))?;
        info!(
            target = "adstudio.payments",
            user_id = %user.id,
            order_id = %payment.order_id,
            tier = %tier.id,
            amount = payment.amount,
            "order_created"
        );
        Ok(payment)
    }

    pub async fn confirm(
        &self,
        user_id: &str,
        request: ConfirmRequest,
    ) -> Result<ConfirmedPayment, ActionError> {
        let op = "confirm_payment";
        let user = self.caller(user_id, op).await?;
        let payment = self.owned_payment(&user, &request.order_id, op).await?;
        if payment.status != PaymentStatus::Pending {
            return Err(ActionError::invalid_stage(op, format!("{:?}", payment.status))
                .with_message("이미 처리된 결제입니다."));
        }

        let aborted = || PaymentPatch {
            payment_key: Some(request.payment_key.clone()),
            ..PaymentPatch::status(PaymentStatus::Aborted)
        };
        if request.amount != payment.amount {
            warn!(
                target = "adstudio.payments",
                order_id = %payment.order_id,
                expected = payment.amount,
                presented = request.amount,
                "amount_mismatch"
            );
            self.transition(&payment.order_id, PaymentStatus::Pending, aborted(), op)
                .await?;
            return Err(ActionError::invalid_input(op, "amount mismatch")
                .with_message("결제 금액이 일치하지 않습니다."));
        }

        let confirmation = match self
            .gateway
            .confirm(&request.payment_key, &payment.order_id, payment.amount)
            .await
        {
            Ok(confirmation) => confirmation,
            Err(err) => {
                warn!(
                    target = "adstudio.payments",
                    order_id = %payment.order_id,
                    error = %err,
                    "gateway_confirm_failed"
                );
                self.transition(&payment.order_id, PaymentStatus::Pending, aborted(), op)
                    .await?;
                return Err(ActionError::gateway(op, err.to_string()));
            }
        };

        let done = self
            .transition(
                &payment.order_id,
                PaymentStatus::Pending,
                PaymentPatch {
                    payment_key: Some(request.payment_key.clone()),
                    method: confirmation.method.clone(),
                    approved_at: Some(confirmation.approved_at.unwrap_or_else(Utc::now)),
                    ..PaymentPatch::status(PaymentStatus::Done)
                },
                op,
            )
            .await?;
        let balance_after = self
            .ledger
            .purchase(&user.id, done.credits_granted, &done.order_id)
            .await
            .map_err(|err| {
                error!(
                    target = "adstudio.payments",
                    order_id = %done.order_id,
                    user_id = %user.id,
                    credits = done.credits_granted,
                    error = %err,
                    "purchase_credit_failed"
                );
                ActionError::ledger(op)(err)
            })?;
        info!(
            target = "adstudio.payments",
            order_id = %done.order_id,
            user_id = %user.id,
            credits = done.credits_granted,
            balance_after,
            "payment_confirmed"
        );
        Ok(ConfirmedPayment {
            payment: done,
            balance_after,
        })
    }

    /// Cancels an order. A pending order is simply closed. A confirmed one is
    /// claimed with a guarded `Done -> Canceled` update before its credits are
    /// taken back and the gateway refunds it, so a racing cancel writes nothing.
    /// Any later failure puts the order back to `Done`.
    pub async fn cancel(
        &self,
        user_id: &str,
        order_id: &str,
        reason: &str,
    ) -> Result<Payment, ActionError> {
        let op = "cancel_payment";
        let user = self.caller(user_id, op).await?;
        let payment = self.owned_payment(&user, order_id, op).await?;
        let reason = match reason.trim() {
            "" => "고객 요청",
            reason => reason,
        };
        let with_reason = PaymentPatch {
            cancel_reason: Some(reason.to_string()),
            ..PaymentPatch::default()
        };

        match payment.status {
            PaymentStatus::Pending => {
                let closed = PaymentPatch {
                    status: Some(PaymentStatus::Canceled),
                    ..with_reason
                };
                self.transition(order_id, PaymentStatus::Pending, closed, op)
                    .await
            }
            PaymentStatus::Done => {
                let payment_key = payment.payment_key.clone().ok_or_else(|| {
                    ActionError::persistence(op, format!("order {order_id} has no payment key"))
                })?;
                let claimed = self
                    .transition(
                        order_id,
                        PaymentStatus::Done,
                        PaymentPatch::status(PaymentStatus::Canceled),
                        op,
                    )
                    .await?;
                if let Err(err) = self
                    .ledger
                    .revoke_purchase(&user.id, payment.credits_granted, order_id)
                    .await
                {
                    self.reopen(order_id).await;
                    return Err(match err {
                        LedgerError::InsufficientFunds { balance, required } => {
                            ActionError::invalid_stage(
                                op,
                                format!("balance {balance}, required {required}"),
                            )
                            .with_message("이미 사용한 크레딧이 있어 결제를 취소할 수 없습니다.")
                        }
                        other => ActionError::ledger(op)(other),
                    });
                }
                if let Err(err) = self.gateway.cancel(&payment_key, reason).await {
                    warn!(
                        target = "adstudio.payments",
                        order_id = %order_id,
                        error = %err,
                        "gateway_cancel_failed"
                    );
                    if let Err(restore) = self
                        .ledger
                        .refund(&user.id, payment.credits_granted, None, "결제 취소 실패 복구")
                        .await
                    {
                        error!(
                            target = "adstudio.payments",
                            order_id = %order_id,
                            error = %restore,
                            "credit_restore_failed"
                        );
                    }
                    self.reopen(order_id).await;
                    return Err(ActionError::gateway(op, err.to_string()));
                }
                let canceled = match self
                    .store
                    .update_payment(order_id, PaymentStatus::Canceled, &with_reason)
                    .await
                {
                    Ok(Some(row)) => row,
                    Ok(None) => claimed,
                    Err(err) => {
                        warn!(
                            target = "adstudio.payments",
                            order_id = %order_id,
                            error = %err,
                            "cancel_reason_not_recorded"
                        );
                        claimed
                    }
                };
                info!(
                    target = "adstudio.payments",
                    order_id = %order_id,
                    user_id = %user.id,
                    credits = payment.credits_granted,
                    "payment_canceled"
                );
                Ok(canceled)
            }
            status => Err(ActionError::invalid_stage(op, format!("{status:?}"))
                .with_message("취소할 수 없는 결제입니다.")),
        }
    }

    /// Puts a claimed cancellation back to `Done`.
    async fn reopen(&self, order_id: &str) {
        match self
            .store
            .update_payment(
                order_id,
                PaymentStatus::Canceled,
                &PaymentPatch::status(PaymentStatus::Done),
            )
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => error!(
                target = "adstudio.payments",
                order_id = %order_id,
                "payment_reopen_lost"
            ),
            Err(err) => error!(
                target = "adstudio.payments",
                order_id = %order_id,
                error = %err,
                "payment_reopen_failed"
            ),
        }
    }

    pub async fn history(
        &self,
        user_id: &str,
        page: Page,
    ) -> Result<Paginated<Payment>, ActionError> {
        let op = "payment_history";
        let user = self.caller(user_id, op).await?;
        let (items, total) = self
            .store
            .list_payments(&user.id, page)
            .await
            .map_err(ActionError::store(op))?;
        Ok(Paginated::new(items, total, page))
    }
}
