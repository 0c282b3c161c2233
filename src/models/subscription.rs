use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::models::user::SubscriptionStatus;

/// A user's paid entitlement period. One row per successful capture; rows are
/// mutated on cancellation but never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: i32,
    pub user_id: i32,
    pub plan_id: i32,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// NULL for one-shot captures; reserved for PayPal recurring subscriptions.
    pub paypal_subscription_id: Option<String>,
    pub cancel_at_period_end: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: i32,
    pub user_id: i32,
    pub subscription_id: Option<i32>,
    pub amount: f64,
    pub currency: String,
    pub payment_method: String,
    /// External capture id from the payment provider.
    pub payment_id: String,
    pub status: PaymentStatus,
    pub payment_date: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Completed,
    Pending,
    Failed,
    Refunded,
}

/// Order -> plan/user mapping written when a checkout order is created.
/// Capture resolves the plan from here instead of trusting the planName
/// echoed back through the browser redirect.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutOrder {
    pub id: i32,
    pub order_id: String,
    pub user_id: i32,
    pub plan_id: i32,
    pub status: CheckoutOrderStatus,
    pub subscription_id: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq)]
#[sqlx(type_name = "checkout_order_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CheckoutOrderStatus {
    Created,
    Captured,
    Cancelled,
}
