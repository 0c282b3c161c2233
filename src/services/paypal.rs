//! PayPal REST integration: credential lookup, OAuth token caching, and the
//! authenticated request adapter used by the subscription handlers.
//!
//! Credentials live in the `system_settings` table (admin-managed), not in
//! process config, and are re-read on every call. The access token is cached
//! on the client instance until shortly before expiry.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::error::{AppError, AppResult};

const SANDBOX_API_BASE: &str = "https://api-m.sandbox.paypal.com";
const LIVE_API_BASE: &str = "https://api-m.paypal.com";

/// Refresh the token this long before PayPal's reported expiry.
const TOKEN_EXPIRY_BUFFER_SECS: i64 = 300;

pub const SETTING_CLIENT_ID: &str = "paypal_client_id";
pub const SETTING_CLIENT_SECRET: &str = "paypal_client_secret";
pub const SETTING_MODE: &str = "paypal_mode";
pub const SETTING_CALLBACK_URL: &str = "paypal_callback_url";

#[derive(Debug, Clone)]
pub struct PayPalCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub mode: String,
}

impl PayPalCredentials {
    /// Read client id/secret/mode from system settings. Missing or empty
    /// credentials are a configuration error, reported as such instead of
    /// surfacing later as an opaque PayPal auth failure.
    pub async fn load(db: &PgPool) -> AppResult<Self> {
        let client_id = read_setting(db, SETTING_CLIENT_ID).await?;
        let client_secret = read_setting(db, SETTING_CLIENT_SECRET).await?;
        let mode = read_setting(db, SETTING_MODE)
            .await?
            .unwrap_or_else(|| "sandbox".into());

        match (client_id, client_secret) {
            (Some(client_id), Some(client_secret)) => Ok(Self {
                client_id,
                client_secret,
                mode,
            }),
            _ => Err(AppError::NotConfigured(
                "PayPal client ID or secret not configured".into(),
            )),
        }
    }

    pub fn api_base(&self) -> &'static str {
        api_base(&self.mode)
    }
}

/// Sandbox host for `sandbox`, live host for anything else.
pub fn api_base(mode: &str) -> &'static str {
    if mode == "sandbox" {
        SANDBOX_API_BASE
    } else {
        LIVE_API_BASE
    }
}

pub async fn read_setting(db: &PgPool, key: &str) -> AppResult<Option<String>> {
    let value =
        sqlx::query_scalar::<_, String>("SELECT value FROM system_settings WHERE key = $1")
            .bind(key)
            .fetch_optional(db)
            .await?;
    Ok(value.filter(|v| !v.is_empty()))
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedToken {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// HATEOAS link from PayPal order responses. The `approve` rel is the URL the
/// browser must visit next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayPalLink {
    pub rel: String,
    pub href: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

pub fn find_approve_link(links: &[PayPalLink]) -> Option<&PayPalLink> {
    links.iter().find(|l| l.rel == "approve")
}

#[derive(Clone)]
pub struct PayPalClient {
    http: reqwest::Client,
    token: Arc<RwLock<Option<CachedToken>>>,
}

impl PayPalClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            http,
            token: Arc::new(RwLock::new(None)),
        }
    }

    /// Drop the cached token. Called when credentials change so a sandbox/live
    /// switch takes effect without a restart.
    pub async fn invalidate_token(&self) {
        *self.token.write().await = None;
    }

    /// Return the cached access token while valid, otherwise run the OAuth
    /// client-credentials grant and cache the result. Concurrent refreshes
    /// both produce a valid token; last write wins.
    pub async fn access_token(&self, db: &PgPool) -> AppResult<String> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref() {
                if token.is_valid(Utc::now()) {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let creds = PayPalCredentials::load(db).await?;
        tracing::debug!(mode = %creds.mode, "Requesting new PayPal access token");

        let auth = BASE64.encode(format!("{}:{}", creds.client_id, creds.client_secret));

        let response = self
            .http
            .post(format!("{}/v1/oauth2/token", creds.api_base()))
            .header("Authorization", format!("Basic {}", auth))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| AppError::PayPal(format!("token request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "PayPal token request rejected");
            return Err(AppError::PayPal(format!(
                "failed to get access token ({})",
                status
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AppError::PayPal(format!("invalid token response: {}", e)))?;

        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| AppError::PayPal("no access token returned".into()))?
            .to_string();
        let expires_in = body["expires_in"].as_i64().unwrap_or(3600);

        let expires_at =
            Utc::now() + Duration::seconds(expires_in - TOKEN_EXPIRY_BUFFER_SECS);
        *self.token.write().await = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at,
        });

        Ok(access_token)
    }

    /// Issue an authenticated request against the PayPal REST API and return
    /// the decoded JSON body. Non-2xx responses are logged with status and
    /// body, then surfaced as a wrapped PayPal error.
    pub async fn request(
        &self,
        db: &PgPool,
        method: Method,
        endpoint: &str,
        body: Option<&serde_json::Value>,
    ) -> AppResult<serde_json::Value> {
        let creds = PayPalCredentials::load(db).await?;
        let token = self.access_token(db).await?;

        let url = format!("{}{}", creds.api_base(), endpoint);
        let mut request = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(token)
            .header("Prefer", "return=representation");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::PayPal(format!("{} {} failed: {}", method, endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                status = %status,
                body = %body,
                endpoint = endpoint,
                "PayPal API error response"
            );
            return Err(AppError::PayPal(format!(
                "{} {} returned {}",
                method, endpoint, status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::PayPal(format!("invalid JSON from {}: {}", endpoint, e)))
    }
}

impl Default for PayPalClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct CaptureDetails {
    pub capture_id: String,
    pub amount: f64,
    /// Raw provider detail stored on the payment row. Extraction never
    /// aborts a capture; missing fields degrade to null.
    pub metadata: serde_json::Value,
}

/// Validate the shape of an order-capture response and pull out the fields we
/// persist. Requires `purchase_units[0].payments.captures[0]` with a usable
/// `amount.value`; anything less fails here, before any database write.
pub fn extract_capture(capture: &serde_json::Value) -> AppResult<CaptureDetails> {
    let details = capture
        .get("purchase_units")
        .and_then(|u| u.get(0))
        .and_then(|u| u.get("payments"))
        .and_then(|p| p.get("captures"))
        .and_then(|c| c.get(0))
        .ok_or_else(|| AppError::PayPal("invalid capture response".into()))?;

    let capture_id = details
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::PayPal("missing capture id in response".into()))?
        .to_string();

    let amount_value = details
        .get("amount")
        .and_then(|a| a.get("value"))
        .ok_or_else(|| AppError::PayPal("missing amount in capture response".into()))?;

    // PayPal sends the amount as a decimal string; accept a bare number too.
    let amount = match amount_value {
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
    .ok_or_else(|| AppError::PayPal("invalid amount in capture response".into()))?;

    let metadata = serde_json::json!({
        "id": capture.get("id").cloned().unwrap_or(serde_json::Value::Null),
        "status": capture.get("status").cloned().unwrap_or(serde_json::Value::Null),
        "payment_source": capture.get("payment_source").cloned().unwrap_or(serde_json::Value::Null),
    });

    Ok(CaptureDetails {
        capture_id,
        amount,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_api_base_selection() {
        assert_eq!(api_base("sandbox"), SANDBOX_API_BASE);
        assert_eq!(api_base("live"), LIVE_API_BASE);
        // Anything that is not "sandbox" goes to the live host.
        assert_eq!(api_base("production"), LIVE_API_BASE);
    }

    #[test]
    fn test_cached_token_validity() {
        let now = Utc::now();
        let token = CachedToken {
            access_token: "abc".into(),
            expires_at: now + Duration::seconds(60),
        };
        assert!(token.is_valid(now));
        assert!(!token.is_valid(now + Duration::seconds(61)));
    }

    #[test]
    fn test_find_approve_link() {
        let links = vec![
            PayPalLink {
                rel: "self".into(),
                href: "https://api-m.sandbox.paypal.com/v2/checkout/orders/ORDER123".into(),
                method: Some("GET".into()),
            },
            PayPalLink {
                rel: "approve".into(),
                href: "https://www.sandbox.paypal.com/checkoutnow?token=ORDER123".into(),
                method: Some("GET".into()),
            },
        ];
        let approve = find_approve_link(&links).unwrap();
        assert!(approve.href.contains("checkoutnow"));
        assert!(find_approve_link(&links[..1]).is_none());
    }

    fn capture_response(amount: serde_json::Value) -> serde_json::Value {
        json!({
            "id": "ORDER123",
            "status": "COMPLETED",
            "payment_source": { "paypal": {} },
            "purchase_units": [{
                "payments": {
                    "captures": [{
                        "id": "CAPTURE456",
                        "status": "COMPLETED",
                        "amount": amount,
                    }]
                }
            }]
        })
    }

    #[test]
    fn test_extract_capture_string_amount() {
        let details =
            extract_capture(&capture_response(json!({ "currency_code": "USD", "value": "9.99" })))
                .unwrap();
        assert_eq!(details.capture_id, "CAPTURE456");
        assert_eq!(details.amount, 9.99);
        assert_eq!(details.metadata["id"], "ORDER123");
        assert_eq!(details.metadata["status"], "COMPLETED");
    }

    #[test]
    fn test_extract_capture_numeric_amount() {
        let details =
            extract_capture(&capture_response(json!({ "currency_code": "USD", "value": 9.99 })))
                .unwrap();
        assert_eq!(details.amount, 9.99);
    }

    #[test]
    fn test_extract_capture_missing_captures() {
        let response = json!({
            "id": "ORDER123",
            "status": "COMPLETED",
            "purchase_units": [{ "payments": { "captures": [] } }]
        });
        assert!(extract_capture(&response).is_err());
    }

    #[test]
    fn test_extract_capture_missing_amount() {
        let response = json!({
            "id": "ORDER123",
            "purchase_units": [{
                "payments": { "captures": [{ "id": "CAPTURE456" }] }
            }]
        });
        assert!(extract_capture(&response).is_err());
    }

    #[test]
    fn test_extract_capture_missing_purchase_units() {
        assert!(extract_capture(&json!({ "id": "ORDER123" })).is_err());
    }
}
