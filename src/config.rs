use once_cell::sync::Lazy;
use std::{env, str::FromStr};

pub static PAYMENT_API_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("PAYMENT_API_ROOT")
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| "https://api.tosspayments.com".to_string())
});

pub static STORAGE_BUCKET: Lazy<String> =
    Lazy::new(|| env::var("STORAGE_BUCKET").unwrap_or_else(|_| "product-images".to_string()));

pub fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

pub fn parse_env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Cost of each paid generation, in credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditCosts {
    pub video: i64,
    pub image: i64,
}

impl CreditCosts {
    pub fn from_env() -> Self {
        Self {
            video: env_parse("VIDEO_CREDIT_COST")
                .filter(|v: &i64| *v >= 0)
                .unwrap_or(100),
            image: env_parse("IMAGE_CREDIT_COST")
                .filter(|v: &i64| *v >= 0)
                .unwrap_or(30),
        }
    }
}

impl Default for CreditCosts {
    fn default() -> Self {
        Self {
            video: 100,
            image: 30,
        }
    }
}

/// What happens to a debit when the generation it paid for never starts or
/// is reported failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefundPolicy {
    #[default]
    RefundOnFailure,
    RetainDebit,
}

impl RefundPolicy {
    pub fn from_env() -> Self {
        if parse_env_bool("REFUND_ON_DISPATCH_FAILURE", true) {
            RefundPolicy::RefundOnFailure
        } else {
            RefundPolicy::RetainDebit
        }
    }
}
