//! Billing webhook handling and tier lookup.
//!
//! The payment provider posts signed events; the two that matter write the
//! caller's [`Subscription`] record, which [`crate::plans::resolve_tier`]
//! later reads at ingestion time.
//!
//! Signature header: `Billing-Signature: t=<unix>,v1=<hex>` where
//! `v1 = hmac_sha256(secret, "{t}.{raw_body}")`.
//!
//! | Event | Effect |
//! |-------|--------|
//! | `checkout.session.completed` | upsert the user's subscription (`metadata.userId`) |
//! | `invoice.payment_succeeded` | refresh price and period end by subscription id |
//! | anything else | ignored |

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::models::Subscription;
use crate::plans::{resolve_tier, PlanTier};
use crate::store::SubscriptionRepository;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Billing-Signature";

/// Maximum age of a signed event.
fn signature_tolerance() -> Duration {
    Duration::minutes(5)
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("billing webhook is not configured")]
    NotConfigured,
    #[error("missing or malformed signature header")]
    MalformedSignature,
    #[error("signature does not match payload")]
    InvalidSignature,
    #[error("signature timestamp outside tolerance")]
    StaleSignature,
    #[error("invalid event payload: {0}")]
    BadPayload(String),
    #[error("event is missing {0}")]
    MissingField(&'static str),
    #[error("storage failure: {0}")]
    Storage(#[source] anyhow::Error),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::NotConfigured => ErrorKind::NotFound,
            BillingError::Storage(_) => ErrorKind::Storage,
            _ => ErrorKind::BadRequest,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BillingOutcome {
    Updated(Subscription),
    Ignored,
}

#[derive(Debug, Deserialize)]
struct BillingEvent {
    #[serde(rename = "type")]
    kind: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: EventObject,
}

#[derive(Debug, Default, Deserialize)]
struct EventObject {
    #[serde(default)]
    metadata: HashMap<String, String>,
    subscription: Option<String>,
    customer: Option<String>,
    price_id: Option<String>,
    /// Unix seconds.
    current_period_end: Option<i64>,
}

impl EventObject {
    fn period_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.current_period_end
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or(now)
    }
}

pub struct BillingService {
    subscriptions: Arc<dyn SubscriptionRepository>,
    secret: Option<String>,
}

impl BillingService {
    pub fn new(subscriptions: Arc<dyn SubscriptionRepository>, secret: Option<String>) -> Self {
        Self {
            subscriptions,
            secret,
        }
    }

    /// Current tier for a user.
    pub async fn tier_for(&self, user_id: &str, now: DateTime<Utc>) -> anyhow::Result<PlanTier> {
        let sub = self.subscriptions.find_by_user(user_id).await?;
        Ok(resolve_tier(sub.as_ref(), now))
    }

    /// Verify and apply one webhook delivery.
    pub async fn handle(
        &self,
        body: &[u8],
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<BillingOutcome, BillingError> {
        let secret = self.secret.as_deref().ok_or(BillingError::NotConfigured)?;
        verify_signature(secret, body, signature.ok_or(BillingError::MalformedSignature)?, now)?;

        let event: BillingEvent =
            serde_json::from_slice(body).map_err(|e| BillingError::BadPayload(e.to_string()))?;
        let object = event.data.object;

        match event.kind.as_str() {
            "checkout.session.completed" => {
                let Some(user_id) = object.metadata.get("userId").cloned() else {
                    tracing::info!("checkout without userId metadata, ignoring");
                    return Ok(BillingOutcome::Ignored);
                };
                let subscription_id = object
                    .subscription
                    .clone()
                    .ok_or(BillingError::MissingField("subscription"))?;
                let sub = Subscription {
                    user_id,
                    subscription_id,
                    customer_id: object.customer.clone(),
                    price_id: object.price_id.clone(),
                    current_period_end: Some(object.period_end(now)),
                };
                self.subscriptions
                    .upsert(&sub)
                    .await
                    .map_err(BillingError::Storage)?;
                tracing::info!(user_id = %sub.user_id, "subscription recorded");
                Ok(BillingOutcome::Updated(sub))
            }
            "invoice.payment_succeeded" => {
                let subscription_id = object
                    .subscription
                    .as_deref()
                    .ok_or(BillingError::MissingField("subscription"))?;
                let Some(mut sub) = self
                    .subscriptions
                    .find_by_subscription_id(subscription_id)
                    .await
                    .map_err(BillingError::Storage)?
                else {
                    tracing::warn!(subscription_id, "invoice for unknown subscription, ignoring");
                    return Ok(BillingOutcome::Ignored);
                };
                sub.price_id = object.price_id.clone();
                sub.current_period_end = Some(object.period_end(now));
                self.subscriptions
                    .upsert(&sub)
                    .await
                    .map_err(BillingError::Storage)?;
                tracing::info!(user_id = %sub.user_id, "subscription renewed");
                Ok(BillingOutcome::Updated(sub))
            }
            other => {
                tracing::debug!(event = other, "unhandled billing event");
                Ok(BillingOutcome::Ignored)
            }
        }
    }
}

fn payload_mac(secret: &str, timestamp: i64, body: &[u8]) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac
}

/// Build a signature header value for `body` signed at `timestamp`.
pub fn sign_payload(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let sig = payload_mac(secret, timestamp, body).finalize().into_bytes();
    format!("t={},v1={}", timestamp, hex::encode(sig))
}

fn verify_signature(
    secret: &str,
    body: &[u8],
    header: &str,
    now: DateTime<Utc>,
) -> Result<(), BillingError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(BillingError::MalformedSignature)?;
    if signatures.is_empty() {
        return Err(BillingError::MalformedSignature);
    }

    let signed_at = DateTime::from_timestamp(timestamp, 0).ok_or(BillingError::MalformedSignature)?;
    if (now - signed_at).abs() > signature_tolerance() {
        return Err(BillingError::StaleSignature);
    }

    for candidate in signatures {
        let Ok(bytes) = hex::decode(candidate) else {
            continue;
        };
        if payload_mac(secret, timestamp, body)
            .verify_slice(&bytes)
            .is_ok()
        {
            return Ok(());
        }
    }
    Err(BillingError::InvalidSignature)
}
