use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::services::paypal::{
    read_setting, SETTING_CALLBACK_URL, SETTING_CLIENT_ID, SETTING_CLIENT_SECRET, SETTING_MODE,
};
use crate::AppState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayPalMode {
    Sandbox,
    Live,
}

impl PayPalMode {
    fn as_str(&self) -> &'static str {
        match self {
            PayPalMode::Sandbox => "sandbox",
            PayPalMode::Live => "live",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayPalSettingsResponse {
    pub client_id: String,
    pub client_secret: String,
    pub mode: String,
    pub callback_url: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayPalSettingsRequest {
    #[validate(length(min = 1, message = "Client ID is required"))]
    pub client_id: String,
    #[validate(length(min = 1, message = "Client Secret is required"))]
    pub client_secret: String,
    pub mode: PayPalMode,
    #[validate(url(message = "Callback URL must be a valid URL"))]
    pub callback_url: Option<String>,
}

pub async fn get_paypal_settings(
    State(state): State<AppState>,
) -> AppResult<Json<PayPalSettingsResponse>> {
    let client_id = read_setting(&state.db, SETTING_CLIENT_ID).await?.unwrap_or_default();
    let client_secret = read_setting(&state.db, SETTING_CLIENT_SECRET)
        .await?
        .unwrap_or_default();
    let mode = read_setting(&state.db, SETTING_MODE)
        .await?
        .unwrap_or_else(|| "sandbox".into());
    let callback_url = read_setting(&state.db, SETTING_CALLBACK_URL)
        .await?
        .unwrap_or_default();

    Ok(Json(PayPalSettingsResponse {
        client_id,
        client_secret,
        mode,
        callback_url,
    }))
}

pub async fn update_paypal_settings(
    State(state): State<AppState>,
    Json(body): Json<UpdatePayPalSettingsRequest>,
) -> AppResult<Json<serde_json::Value>> {
    body.validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    upsert_setting(&state, SETTING_CLIENT_ID, &body.client_id).await?;
    upsert_setting(&state, SETTING_CLIENT_SECRET, &body.client_secret).await?;
    upsert_setting(&state, SETTING_MODE, body.mode.as_str()).await?;
    if let Some(callback_url) = &body.callback_url {
        upsert_setting(&state, SETTING_CALLBACK_URL, callback_url).await?;
    }

    // A cached token minted against the old credentials (or the other
    // environment) must not outlive this change.
    state.paypal.invalidate_token().await;

    tracing::info!(mode = body.mode.as_str(), "PayPal settings updated");

    Ok(Json(serde_json::json!({ "success": true })))
}

async fn upsert_setting(state: &AppState, key: &str, value: &str) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO system_settings (key, value) VALUES ($1, $2)
        ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(&state.db)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_roundtrip() {
        let mode: PayPalMode = serde_json::from_str("\"live\"").unwrap();
        assert_eq!(mode.as_str(), "live");
        assert!(serde_json::from_str::<PayPalMode>("\"production\"").is_err());
    }

    #[test]
    fn test_update_request_validation() {
        let valid = UpdatePayPalSettingsRequest {
            client_id: "id".into(),
            client_secret: "secret".into(),
            mode: PayPalMode::Sandbox,
            callback_url: Some("https://app.example.com/subscription".into()),
        };
        assert!(valid.validate().is_ok());

        let empty_id = UpdatePayPalSettingsRequest {
            client_id: "".into(),
            client_secret: "secret".into(),
            mode: PayPalMode::Sandbox,
            callback_url: None,
        };
        assert!(empty_id.validate().is_err());

        let bad_url = UpdatePayPalSettingsRequest {
            client_id: "id".into(),
            client_secret: "secret".into(),
            mode: PayPalMode::Sandbox,
            callback_url: Some("not-a-url".into()),
        };
        assert!(bad_url.validate().is_err());
    }
}
