use axum::{extract::State, Extension, Json};
use chrono::{DateTime, Months, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::auth::middleware::AuthUser;
use crate::error::{AppError, AppResult};
use crate::models::plan::{FeatureLimit, PlanInterval, PlanSummary, SubscriptionPlan};
use crate::models::subscription::{
    CheckoutOrder, CheckoutOrderStatus, Payment, PaymentStatus, Subscription,
};
use crate::models::user::SubscriptionStatus;
use crate::services::paypal::{extract_capture, find_approve_link, read_setting, PayPalLink};
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanWithLimits {
    #[serde(flatten)]
    pub plan: SubscriptionPlan,
    pub feature_limits: Option<FeatureLimit>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, message = "planName is required"))]
    pub plan_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    pub order_id: String,
    pub status: String,
    pub links: Vec<PayPalLink>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CaptureOrderRequest {
    #[validate(length(min = 1, message = "orderId is required"))]
    pub order_id: String,
    #[validate(length(min = 1, message = "planName is required"))]
    pub plan_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureOrderResponse {
    pub subscription_id: i32,
    pub status: SubscriptionStatus,
    pub payment_status: PaymentStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub subscription_id: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub subscription_id: i32,
    pub status: SubscriptionStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionWithPlan {
    pub subscription: Subscription,
    pub plan: PlanSummary,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentSubscriptionResponse {
    pub active: bool,
    pub subscription: Option<SubscriptionWithPlan>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub subscription: Subscription,
    pub plan: PlanSummary,
    pub payments: Vec<Payment>,
}

/// Active plans with the feature-limit row for their tier, for the plan
/// comparison table.
pub async fn get_plans(State(state): State<AppState>) -> AppResult<Json<Vec<PlanWithLimits>>> {
    let plans = sqlx::query_as::<_, SubscriptionPlan>(
        "SELECT * FROM subscription_plans WHERE is_active = true ORDER BY price ASC",
    )
    .fetch_all(&state.db)
    .await?;

    let limits = sqlx::query_as::<_, FeatureLimit>("SELECT * FROM feature_limits")
        .fetch_all(&state.db)
        .await?;

    let result = plans
        .into_iter()
        .map(|plan| {
            let tier = plan.comparison_tier();
            let feature_limits = limits
                .iter()
                .find(|l| l.subscription_tier == tier)
                .cloned();
            PlanWithLimits {
                plan,
                feature_limits,
            }
        })
        .collect();

    Ok(Json(result))
}

pub async fn create_order(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(body): Json<CreateOrderRequest>,
) -> AppResult<Json<CreateOrderResponse>> {
    body.validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let plan = sqlx::query_as::<_, SubscriptionPlan>(
        "SELECT * FROM subscription_plans WHERE name = $1 AND is_active = true",
    )
    .bind(&body.plan_name)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| {
        AppError::NotFound(format!("Subscription plan '{}' not found", body.plan_name))
    })?;

    // Checkout return page: configured callback URL, or the frontend
    // subscription page. PayPal appends the order id as `token`.
    let callback_base = read_setting(&state.db, crate::services::paypal::SETTING_CALLBACK_URL)
        .await?
        .unwrap_or_else(|| state.config.default_callback_url());

    let return_url = with_query(&callback_base, "planName", &plan.name)?;
    let cancel_url = with_query(&callback_base, "cancelled", "true")?;

    let request_body = build_order_request(&plan, auth_user.id, &return_url, &cancel_url);

    let order = state
        .paypal
        .request(&state.db, Method::POST, "/v2/checkout/orders", Some(&request_body))
        .await?;

    let order_id = order["id"]
        .as_str()
        .ok_or_else(|| AppError::PayPal("order response missing id".into()))?
        .to_string();
    let status = order["status"].as_str().unwrap_or("CREATED").to_string();
    let links: Vec<PayPalLink> =
        serde_json::from_value(order.get("links").cloned().unwrap_or_default())
            .unwrap_or_default();

    if find_approve_link(&links).is_none() {
        tracing::warn!(order_id = %order_id, "No approval link in PayPal order response");
    }

    // Persist the order -> plan mapping so capture does not have to trust the
    // planName echoed back from the redirect. Also the audit trail for
    // checkouts that are never captured.
    sqlx::query(
        "INSERT INTO paypal_orders (order_id, user_id, plan_id) VALUES ($1, $2, $3)",
    )
    .bind(&order_id)
    .bind(auth_user.id)
    .bind(plan.id)
    .execute(&state.db)
    .await?;

    tracing::info!(
        order_id = %order_id,
        user_id = auth_user.id,
        plan = %plan.name,
        "PayPal order created"
    );

    Ok(Json(CreateOrderResponse {
        order_id,
        status,
        links,
    }))
}

pub async fn capture_order(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(body): Json<CaptureOrderRequest>,
) -> AppResult<Json<CaptureOrderResponse>> {
    body.validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let order = sqlx::query_as::<_, CheckoutOrder>(
        "SELECT * FROM paypal_orders WHERE order_id = $1 AND user_id = $2",
    )
    .bind(&body.order_id)
    .bind(auth_user.id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| AppError::NotFound("Order not found".into()))?;

    // Retried capture of an already-finalized order returns the original
    // result instead of double-writing.
    if order.status == CheckoutOrderStatus::Captured {
        let result = existing_capture_result(&state, &order).await?;
        return Ok(Json(result));
    }

    let plan = sqlx::query_as::<_, SubscriptionPlan>(
        "SELECT * FROM subscription_plans WHERE id = $1",
    )
    .bind(order.plan_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| {
        AppError::NotFound(format!("Subscription plan '{}' not found", body.plan_name))
    })?;

    // The plan is resolved from the stored order; a mismatched client-echoed
    // planName means a stale or tampered redirect.
    if plan.name != body.plan_name {
        return Err(AppError::Conflict(format!(
            "Plan '{}' does not match this order",
            body.plan_name
        )));
    }

    let capture = state
        .paypal
        .request(
            &state.db,
            Method::POST,
            &format!("/v2/checkout/orders/{}/capture", order.order_id),
            Some(&serde_json::json!({})),
        )
        .await?;

    // Shape validation happens before any database write.
    let details = extract_capture(&capture)?;

    let start_date = Utc::now();
    let end_date = subscription_end_date(start_date, plan.interval)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("end date out of range")))?;

    // Subscription + payment + entitlement updates land atomically. The order
    // row is re-checked under lock so concurrent captures of the same order
    // cannot both insert.
    let mut tx = state.db.begin().await?;

    let locked = sqlx::query_as::<_, CheckoutOrder>(
        "SELECT * FROM paypal_orders WHERE id = $1 FOR UPDATE",
    )
    .bind(order.id)
    .fetch_one(&mut *tx)
    .await?;

    if locked.status == CheckoutOrderStatus::Captured {
        tx.commit().await?;
        let result = existing_capture_result(&state, &locked).await?;
        return Ok(Json(result));
    }

    let subscription = sqlx::query_as::<_, Subscription>(
        r#"
        INSERT INTO subscriptions (user_id, plan_id, status, start_date, end_date)
        VALUES ($1, $2, 'active', $3, $4)
        RETURNING *
        "#,
    )
    .bind(auth_user.id)
    .bind(plan.id)
    .bind(start_date)
    .bind(end_date)
    .fetch_one(&mut *tx)
    .await?;

    let payment = sqlx::query_as::<_, Payment>(
        r#"
        INSERT INTO payments
            (user_id, subscription_id, amount, currency, payment_method, payment_id, status, payment_date, metadata)
        VALUES ($1, $2, $3, 'USD', 'paypal', $4, 'completed', $5, $6)
        RETURNING *
        "#,
    )
    .bind(auth_user.id)
    .bind(subscription.id)
    .bind(details.amount)
    .bind(&details.capture_id)
    .bind(start_date)
    .bind(&details.metadata)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE users SET
            subscription_tier = 'pro',
            subscription_status = 'active',
            subscription_expires_at = $2,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(auth_user.id)
    .bind(end_date)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE paypal_orders SET status = 'captured', subscription_id = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(order.id)
    .bind(subscription.id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(
        order_id = %order.order_id,
        user_id = auth_user.id,
        subscription_id = subscription.id,
        capture_id = %details.capture_id,
        amount = details.amount,
        "PayPal order captured, subscription activated"
    );

    Ok(Json(CaptureOrderResponse {
        subscription_id: subscription.id,
        status: subscription.status,
        payment_status: payment.status,
        start_date: subscription.start_date,
        end_date: subscription.end_date,
    }))
}

/// Result for a capture that already went through, looked up from the rows the
/// original capture created.
async fn existing_capture_result(
    state: &AppState,
    order: &CheckoutOrder,
) -> AppResult<CaptureOrderResponse> {
    let subscription_id = order
        .subscription_id
        .ok_or_else(|| AppError::Conflict("Order already captured".into()))?;

    let subscription = sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions WHERE id = $1",
    )
    .bind(subscription_id)
    .fetch_one(&state.db)
    .await?;

    let payment_status = sqlx::query_scalar::<_, PaymentStatus>(
        "SELECT status FROM payments WHERE subscription_id = $1 ORDER BY created_at ASC LIMIT 1",
    )
    .bind(subscription_id)
    .fetch_optional(&state.db)
    .await?
    .unwrap_or(PaymentStatus::Completed);

    Ok(CaptureOrderResponse {
        subscription_id: subscription.id,
        status: subscription.status,
        payment_status,
        start_date: subscription.start_date,
        end_date: subscription.end_date,
    })
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(body): Json<CancelRequest>,
) -> AppResult<Json<CancelResponse>> {
    let subscription = sqlx::query_as::<_, Subscription>(
        r#"
        UPDATE subscriptions SET
            status = 'cancelled',
            cancelled_at = NOW(),
            cancel_at_period_end = true,
            updated_at = NOW()
        WHERE id = $1 AND user_id = $2
        RETURNING *
        "#,
    )
    .bind(body.subscription_id)
    .bind(auth_user.id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| AppError::NotFound("Subscription not found".into()))?;

    // Entitlements are left untouched; access runs to the end of the paid
    // period.
    tracing::info!(
        subscription_id = subscription.id,
        user_id = auth_user.id,
        "Subscription cancelled"
    );

    Ok(Json(CancelResponse {
        subscription_id: subscription.id,
        status: subscription.status,
    }))
}

pub async fn get_current(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> AppResult<Json<CurrentSubscriptionResponse>> {
    let subscription = sqlx::query_as::<_, Subscription>(
        r#"
        SELECT * FROM subscriptions
        WHERE user_id = $1 AND status = 'active'
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(auth_user.id)
    .fetch_optional(&state.db)
    .await?;

    let Some(subscription) = subscription else {
        return Ok(Json(CurrentSubscriptionResponse {
            active: false,
            subscription: None,
        }));
    };

    let plan = sqlx::query_as::<_, PlanSummary>(
        "SELECT name, display_name, price, interval FROM subscription_plans WHERE id = $1",
    )
    .bind(subscription.plan_id)
    .fetch_one(&state.db)
    .await?;

    Ok(Json(CurrentSubscriptionResponse {
        active: true,
        subscription: Some(SubscriptionWithPlan { subscription, plan }),
    }))
}

pub async fn get_history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> AppResult<Json<Vec<HistoryEntry>>> {
    let subscriptions = sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions WHERE user_id = $1 ORDER BY created_at DESC",
    )
    .bind(auth_user.id)
    .fetch_all(&state.db)
    .await?;

    if subscriptions.is_empty() {
        return Ok(Json(Vec::new()));
    }

    let plan_ids: Vec<i32> = subscriptions.iter().map(|s| s.plan_id).collect();
    let plans = sqlx::query_as::<_, SubscriptionPlan>(
        "SELECT * FROM subscription_plans WHERE id = ANY($1)",
    )
    .bind(&plan_ids)
    .fetch_all(&state.db)
    .await?;

    let payments = sqlx::query_as::<_, Payment>(
        "SELECT * FROM payments WHERE user_id = $1 ORDER BY payment_date DESC",
    )
    .bind(auth_user.id)
    .fetch_all(&state.db)
    .await?;

    // Each subscription joins its own plan row; histories spanning several
    // plans stay correct.
    let mut entries = Vec::with_capacity(subscriptions.len());
    for subscription in subscriptions {
        let plan = plans
            .iter()
            .find(|p| p.id == subscription.plan_id)
            .map(PlanSummary::from)
            .ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!(
                    "plan {} missing for subscription {}",
                    subscription.plan_id,
                    subscription.id
                ))
            })?;

        let sub_payments = payments
            .iter()
            .filter(|p| p.subscription_id == Some(subscription.id))
            .cloned()
            .collect();

        entries.push(HistoryEntry {
            subscription,
            plan,
            payments: sub_payments,
        });
    }

    Ok(Json(entries))
}

/// Append one query parameter to the configured callback base.
fn with_query(base: &str, key: &str, value: &str) -> AppResult<String> {
    let url = reqwest::Url::parse_with_params(base, &[(key, value)])
        .map_err(|e| AppError::Internal(anyhow::anyhow!("invalid callback URL: {}", e)))?;
    Ok(url.to_string())
}

fn build_order_request(
    plan: &SubscriptionPlan,
    user_id: i32,
    return_url: &str,
    cancel_url: &str,
) -> serde_json::Value {
    serde_json::json!({
        "intent": "CAPTURE",
        "purchase_units": [{
            "reference_id": format!("plan_{}_user_{}", plan.id, user_id),
            "description": plan
                .description
                .clone()
                .unwrap_or_else(|| format!("{} Subscription", plan.display_name)),
            "amount": {
                "currency_code": "USD",
                "value": format!("{:.2}", plan.price),
            }
        }],
        "application_context": {
            "brand_name": "Hope Log",
            "landing_page": "NO_PREFERENCE",
            "user_action": "PAY_NOW",
            "return_url": return_url,
            "cancel_url": cancel_url,
        }
    })
}

/// One billing period from the start date: one calendar month or one calendar
/// year, with chrono's month-end clamping (Jan 31 + 1 month = Feb 28/29).
fn subscription_end_date(start: DateTime<Utc>, interval: PlanInterval) -> Option<DateTime<Utc>> {
    let months = match interval {
        PlanInterval::Month => 1,
        PlanInterval::Year => 12,
    };
    start.checked_add_months(Months::new(months))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_end_date_month_interval() {
        let end = subscription_end_date(utc(2025, 3, 15), PlanInterval::Month).unwrap();
        assert_eq!(end, utc(2025, 4, 15));
    }

    #[test]
    fn test_end_date_month_clamps_at_month_end() {
        let end = subscription_end_date(utc(2025, 1, 31), PlanInterval::Month).unwrap();
        assert_eq!(end, utc(2025, 2, 28));

        let leap = subscription_end_date(utc(2024, 1, 31), PlanInterval::Month).unwrap();
        assert_eq!(leap, utc(2024, 2, 29));
    }

    #[test]
    fn test_end_date_year_interval() {
        let end = subscription_end_date(utc(2025, 6, 1), PlanInterval::Year).unwrap();
        assert_eq!(end, utc(2026, 6, 1));

        // Feb 29 rolls to Feb 28 in a non-leap year.
        let leap = subscription_end_date(utc(2024, 2, 29), PlanInterval::Year).unwrap();
        assert_eq!(leap, utc(2025, 2, 28));
    }

    fn test_plan() -> SubscriptionPlan {
        SubscriptionPlan {
            id: 7,
            name: "pro".into(),
            display_name: "Hope Log Pro".into(),
            description: Some("Monthly Pro subscription".into()),
            price: 9.99,
            interval: PlanInterval::Month,
            features: serde_json::json!([]),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_build_order_request() {
        let body = build_order_request(
            &test_plan(),
            42,
            "https://app.example.com/subscription?planName=pro",
            "https://app.example.com/subscription?cancelled=true",
        );

        assert_eq!(body["intent"], "CAPTURE");
        let unit = &body["purchase_units"][0];
        assert_eq!(unit["reference_id"], "plan_7_user_42");
        assert_eq!(unit["amount"]["currency_code"], "USD");
        assert_eq!(unit["amount"]["value"], "9.99");
        assert_eq!(body["application_context"]["user_action"], "PAY_NOW");
        assert!(body["application_context"]["return_url"]
            .as_str()
            .unwrap()
            .contains("planName=pro"));
    }

    #[test]
    fn test_order_amount_always_two_decimals() {
        let mut plan = test_plan();
        plan.price = 10.0;
        let body = build_order_request(&plan, 1, "https://x.test/a", "https://x.test/b");
        assert_eq!(body["purchase_units"][0]["amount"]["value"], "10.00");
    }

    #[test]
    fn test_with_query_appends_parameter() {
        let url = with_query("https://app.example.com/subscription", "planName", "pro").unwrap();
        assert_eq!(url, "https://app.example.com/subscription?planName=pro");

        // Appends to an existing query string rather than replacing it.
        let url = with_query(&url, "cancelled", "true").unwrap();
        assert!(url.contains("planName=pro") && url.contains("cancelled=true"));
    }
}
