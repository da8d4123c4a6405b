//! Subscription tiers and the limits they grant.
//!
//! Everything here is pure: the tier is resolved from a [`Subscription`]
//! record and a clock value, and limits are looked up in a [`PlanTable`]
//! built from configuration.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::models::Subscription;

/// Grace period after `current_period_end` during which a subscription
/// still counts as active.
fn renewal_grace() -> Duration {
    Duration::days(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Pro,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Pro => "pro",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "free" => Some(PlanTier::Free),
            "pro" => Some(PlanTier::Pro),
            _ => None,
        }
    }

    pub fn limits<'a>(&self, table: &'a PlanTable) -> &'a PlanLimits {
        match self {
            PlanTier::Free => &table.free,
            PlanTier::Pro => &table.pro,
        }
    }
}

/// Quota and size ceilings for one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    /// Maximum number of documents an owner may keep.
    pub quota: usize,
    /// Maximum number of extracted pages per document.
    pub pages_per_pdf: usize,
    #[serde(default)]
    pub max_file_bytes: Option<u64>,
}

impl PlanLimits {
    pub fn free() -> Self {
        Self {
            quota: 10,
            pages_per_pdf: 5,
            max_file_bytes: Some(4 * 1024 * 1024),
        }
    }

    pub fn pro() -> Self {
        Self {
            quota: 50,
            pages_per_pdf: 25,
            max_file_bytes: Some(16 * 1024 * 1024),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanTable {
    pub free: PlanLimits,
    pub pro: PlanLimits,
}

impl Default for PlanTable {
    fn default() -> Self {
        Self {
            free: PlanLimits::free(),
            pro: PlanLimits::pro(),
        }
    }
}

/// Resolve the tier a user is on right now.
///
/// A user is on `Pro` when they have a price attached and the current
/// billing period (plus one day of grace) has not yet ended.
pub fn resolve_tier(subscription: Option<&Subscription>, now: DateTime<Utc>) -> PlanTier {
    let Some(sub) = subscription else {
        return PlanTier::Free;
    };
    match (&sub.price_id, sub.current_period_end) {
        (Some(_), Some(end)) if end + renewal_grace() > now => PlanTier::Pro,
        _ => PlanTier::Free,
    }
}

pub fn check_pages(page_count: usize, limits: &PlanLimits) -> Result<(), IngestError> {
    if page_count > limits.pages_per_pdf {
        return Err(IngestError::PagesExceeded {
            pages: page_count,
            limit: limits.pages_per_pdf,
        });
    }
    Ok(())
}

pub fn check_document_quota(existing: usize, limits: &PlanLimits) -> Result<(), IngestError> {
    if existing >= limits.quota {
        return Err(IngestError::DocumentQuotaExceeded {
            existing,
            limit: limits.quota,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(price: Option<&str>, end: Option<DateTime<Utc>>) -> Subscription {
        Subscription {
            user_id: "u1".into(),
            subscription_id: "sub_1".into(),
            customer_id: Some("cus_1".into()),
            price_id: price.map(str::to_string),
            current_period_end: end,
        }
    }

    #[test]
    fn no_subscription_is_free() {
        assert_eq!(resolve_tier(None, Utc::now()), PlanTier::Free);
    }

    #[test]
    fn active_subscription_is_pro() {
        let now = Utc::now();
        let s = sub(Some("price_pro"), Some(now + Duration::days(10)));
        assert_eq!(resolve_tier(Some(&s), now), PlanTier::Pro);
    }

    #[test]
    fn grace_day_keeps_pro() {
        let now = Utc::now();
        let s = sub(Some("price_pro"), Some(now - Duration::hours(12)));
        assert_eq!(resolve_tier(Some(&s), now), PlanTier::Pro);

        let expired = sub(Some("price_pro"), Some(now - Duration::days(2)));
        assert_eq!(resolve_tier(Some(&expired), now), PlanTier::Free);
    }

    #[test]
    fn missing_price_is_free() {
        let now = Utc::now();
        let s = sub(None, Some(now + Duration::days(10)));
        assert_eq!(resolve_tier(Some(&s), now), PlanTier::Free);
    }

    #[test]
    fn page_limit_is_inclusive() {
        let free = PlanLimits::free();
        assert!(check_pages(5, &free).is_ok());
        assert!(matches!(
            check_pages(6, &free),
            Err(IngestError::PagesExceeded { pages: 6, limit: 5 })
        ));
    }

    #[test]
    fn document_quota_blocks_at_limit() {
        let free = PlanLimits::free();
        assert!(check_document_quota(9, &free).is_ok());
        assert!(check_document_quota(10, &free).is_err());
    }

    #[test]
    fn tiers_look_up_their_limits() {
        let table = PlanTable::default();
        assert_eq!(PlanTier::Free.limits(&table).pages_per_pdf, 5);
        assert_eq!(PlanTier::Pro.limits(&table).pages_per_pdf, 25);
        assert_eq!(PlanTier::parse("PRO"), Some(PlanTier::Pro));
    }
}
