use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::models::user::SubscriptionTier;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPlan {
    pub id: i32,
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub price: f64,
    pub interval: PlanInterval,
    pub features: serde_json::Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq)]
#[sqlx(type_name = "plan_interval", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanInterval {
    Month,
    Year,
}

/// Plan fields embedded in subscription responses.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub name: String,
    pub display_name: String,
    pub price: f64,
    pub interval: PlanInterval,
}

impl From<&SubscriptionPlan> for PlanSummary {
    fn from(p: &SubscriptionPlan) -> Self {
        Self {
            name: p.name.clone(),
            display_name: p.display_name.clone(),
            price: p.price,
            interval: p.interval,
        }
    }
}

/// Per-tier capability ceilings, rendered alongside plans for comparison.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct FeatureLimit {
    pub id: i32,
    pub subscription_tier: SubscriptionTier,
    pub max_journal_entries: Option<i32>,
    pub max_goals: Option<i32>,
    pub ai_responses_per_day: Option<i32>,
    pub insights: bool,
    pub custom_prompts: bool,
    pub weekly_digest: bool,
    pub data_export: bool,
    pub community: bool,
}

impl SubscriptionPlan {
    /// Tier used when comparing a plan against feature limits. Plan names
    /// containing "pro" map to the pro tier, everything else to free.
    pub fn comparison_tier(&self) -> SubscriptionTier {
        if self.name.contains("pro") {
            SubscriptionTier::Pro
        } else {
            SubscriptionTier::Free
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn plan(name: &str) -> SubscriptionPlan {
        SubscriptionPlan {
            id: 1,
            name: name.into(),
            display_name: "Test".into(),
            description: None,
            price: 9.99,
            interval: PlanInterval::Month,
            features: serde_json::json!([]),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_comparison_tier_pro_variants() {
        assert_eq!(plan("pro").comparison_tier(), SubscriptionTier::Pro);
        assert_eq!(plan("pro_yearly").comparison_tier(), SubscriptionTier::Pro);
    }

    #[test]
    fn test_comparison_tier_free_fallback() {
        assert_eq!(plan("basic").comparison_tier(), SubscriptionTier::Free);
    }
}
