use crate::dispatch::DispatchError;
use crate::ledger::LedgerError;
use crate::stage::TransitionError;
use crate::storage::StorageError;
use crate::store::StoreError;
use std::borrow::Cow;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionErrorKind {
    Unauthenticated,
    NotFound,
    Forbidden,
    InvalidStage,
    InsufficientFunds,
    Dispatch,
    Persistence,
    InvalidInput,
    Gateway,
    Unavailable,
}

/// Failure of a user-facing action. Carries the operation it came from, a
/// short localized message for the caller and an internal detail for logs
/// and admin diagnostics.
#[derive(Debug, Error)]
#[error("{operation} failed ({kind:?}): {detail}")]
pub struct ActionError {
    operation: &'static str,
    kind: ActionErrorKind,
    message: Cow<'static, str>,
    detail: String,
    shortfall: Option<(i64, i64)>,
}

impl ActionError {
    fn new(operation: &'static str, kind: ActionErrorKind, detail: impl Into<String>) -> Self {
        Self {
            operation,
            kind,
            message: Cow::Borrowed(default_message(kind)),
            detail: detail.into(),
            shortfall: None,
        }
    }

    pub fn unauthenticated(operation: &'static str) -> Self {
        Self::new(operation, ActionErrorKind::Unauthenticated, "no session")
    }

    pub fn not_found(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::new(operation, ActionErrorKind::NotFound, detail)
    }

    pub fn forbidden(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::new(operation, ActionErrorKind::Forbidden, detail)
    }

    pub fn invalid_stage(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::new(operation, ActionErrorKind::InvalidStage, detail)
    }

    pub fn insufficient_funds(operation: &'static str, balance: i64, required: i64) -> Self {
        let mut err = Self::new(
            operation,
            ActionErrorKind::InsufficientFunds,
            format!("balance {balance}, required {required}"),
        );
        err.shortfall = Some((balance, required));
        err
    }

    pub fn dispatch(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::new(operation, ActionErrorKind::Dispatch, detail)
    }

    pub fn persistence(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::new(operation, ActionErrorKind::Persistence, detail)
    }

    pub fn invalid_input(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::new(operation, ActionErrorKind::InvalidInput, detail)
    }

    pub fn gateway(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::new(operation, ActionErrorKind::Gateway, detail)
    }

    pub fn unavailable(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::new(operation, ActionErrorKind::Unavailable, detail)
    }

    /// Replaces the default localized message.
    pub fn with_message(mut self, message: &'static str) -> Self {
        self.message = Cow::Borrowed(message);
        self
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn kind(&self) -> ActionErrorKind {
        self.kind
    }

    pub fn user_message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// `(balance, required)` for insufficient-funds failures.
    pub fn shortfall(&self) -> Option<(i64, i64)> {
        self.shortfall
    }

    pub fn store(operation: &'static str) -> impl Fn(StoreError) -> Self {
        move |err| Self::persistence(operation, err.to_string())
    }

    pub fn ledger(operation: &'static str) -> impl Fn(LedgerError) -> Self {
        move |err| match err {
            LedgerError::InsufficientFunds { balance, required } => {
                Self::insufficient_funds(operation, balance, required)
            }
            LedgerError::UnknownUser(id) => Self::not_found(operation, format!("user {id}")),
            LedgerError::NotAdmin => Self::forbidden(operation, "admin role required"),
            LedgerError::InvalidAmount => Self::invalid_input(operation, "amount must be positive")
                .with_message("금액은 0보다 커야 합니다."),
            LedgerError::Store(err) => Self::persistence(operation, err.to_string()),
        }
    }

    pub fn stage(operation: &'static str) -> impl Fn(TransitionError) -> Self {
        move |err| Self::invalid_stage(operation, err.to_string())
    }

    pub fn from_dispatch(operation: &'static str, err: &DispatchError) -> Self {
        match err {
            DispatchError::NotConfigured(flow) => {
                Self::unavailable(operation, format!("webhook for {flow} not configured"))
            }
            other => Self::dispatch(operation, other.to_string()),
        }
    }

    pub fn from_storage(operation: &'static str, err: StorageError) -> Self {
        match err {
            StorageError::NotConfigured => Self::unavailable(operation, err.to_string()),
            StorageError::OutsideNamespace(_) => Self::forbidden(operation, err.to_string()),
            other => Self::persistence(operation, other.to_string()),
        }
    }
}

fn default_message(kind: ActionErrorKind) -> &'static str {
    match kind {
        ActionErrorKind::Unauthenticated => "로그인이 필요합니다.",
        ActionErrorKind::NotFound => "요청한 항목을 찾을 수 없습니다.",
        ActionErrorKind::Forbidden => "접근 권한이 없습니다.",
        ActionErrorKind::InvalidStage => "현재 단계에서는 요청을 처리할 수 없습니다.",
        ActionErrorKind::InsufficientFunds => "크레딧이 부족합니다.",
        ActionErrorKind::Dispatch => "생성 요청에 실패했습니다. 잠시 후 다시 시도해주세요.",
        ActionErrorKind::Persistence => "요청을 처리하는 중 오류가 발생했습니다.",
        ActionErrorKind::InvalidInput => "입력값이 올바르지 않습니다.",
        ActionErrorKind::Gateway => "결제 처리 중 오류가 발생했습니다.",
        ActionErrorKind::Unavailable => "서비스를 일시적으로 사용할 수 없습니다.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_shortfall_is_preserved() {
        let err = ActionError::ledger("select_ad_copy")(LedgerError::InsufficientFunds {
            balance: 50,
            required: 100,
        });
        assert_eq!(err.kind(), ActionErrorKind::InsufficientFunds);
        assert_eq!(err.shortfall(), Some((50, 100)));
        assert_eq!(err.user_message(), "크레딧이 부족합니다.");
    }

    #[test]
    fn message_override_keeps_kind() {
        let err = ActionError::invalid_stage("cancel", "completed").with_message("취소할 수 없습니다.");
        assert_eq!(err.kind(), ActionErrorKind::InvalidStage);
        assert_eq!(err.user_message(), "취소할 수 없습니다.");
        assert_eq!(err.operation(), "cancel");
        assert_eq!(err.to_string(), "cancel failed (InvalidStage): completed");
    }

    #[test]
    fn unconfigured_webhook_is_unavailable_not_dispatch() {
        let err = ActionError::from_dispatch("generate", &DispatchError::NotConfigured("video_generation"));
        assert_eq!(err.kind(), ActionErrorKind::Unavailable);
    }
}
