use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, warn};

const MAX_RETRIES: u32 = 3;

/// Error surface of the control-plane API, mapped from HTTP status codes.
/// `Transient` failures are retried with backoff inside the client; the
/// rest bubble up to the caller.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("control plane rejected credentials")]
    Unauthorized,
    #[error("entity not found")]
    NotFound,
    #[error("transient control-plane failure: {0}")]
    Transient(String),
    #[error("control-plane API error {status}: {body}")]
    Api { status: u16, body: String },
}

impl ApiError {
    /// The create endpoint reports username/telegram-id collisions with an
    /// "already exists" body (error code A019). That case switches the
    /// provisioner onto the adopt-by-telegram-id path.
    pub fn is_already_exists(&self) -> bool {
        match self {
            ApiError::Api { body, .. } => {
                let body = body.to_lowercase();
                body.contains("already exists") || body.contains("username") || body.contains("a019")
            }
            _ => false,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }
}

/// User object as the control plane returns it (envelope stripped,
/// unknown fields ignored).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUser {
    pub uuid: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub short_uuid: Option<String>,
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Clone)]
pub struct RemnawaveClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl RemnawaveClient {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    // --- Users ---

    pub async fn create_user(
        &self,
        username: &str,
        expire_at: &str,
        telegram_id: i64,
        external_squad: Option<&str>,
        internal_squads: &[String],
    ) -> Result<RemoteUser, ApiError> {
        let mut payload = json!({
            "username": username,
            "expireAt": expire_at,
            "telegramId": telegram_id,
            "trafficLimitStrategy": "MONTH",
        });
        if let Some(squad) = external_squad {
            payload["externalSquadUuid"] = json!(squad);
        }
        if !internal_squads.is_empty() {
            payload["activeInternalSquads"] = json!(internal_squads);
        }

        let body = self.request(Method::POST, "/api/users", Some(payload)).await?;
        parse_user(body)
    }

    /// Absolute-set update; only the provided fields are sent.
    pub async fn update_user(
        &self,
        uuid: &str,
        expire_at: Option<&str>,
        external_squad: Option<&str>,
        internal_squads: Option<&[String]>,
    ) -> Result<RemoteUser, ApiError> {
        let mut payload = json!({ "uuid": uuid });
        if let Some(expire) = expire_at {
            payload["expireAt"] = json!(expire);
        }
        if let Some(squad) = external_squad {
            payload["externalSquadUuid"] = json!(squad);
        }
        if let Some(squads) = internal_squads {
            if !squads.is_empty() {
                payload["activeInternalSquads"] = json!(squads);
            }
        }

        let body = self.request(Method::PATCH, "/api/users", Some(payload)).await?;
        parse_user(body)
    }

    pub async fn get_user_by_uuid(&self, uuid: &str) -> Result<RemoteUser, ApiError> {
        let body = self
            .request(Method::GET, &format!("/api/users/{}", uuid), None)
            .await?;
        parse_user(body)
    }

    pub async fn get_user_by_telegram_id(&self, telegram_id: i64) -> Result<RemoteUser, ApiError> {
        let body = self
            .request(
                Method::GET,
                &format!("/api/users/by-telegram-id/{}", telegram_id),
                None,
            )
            .await?;
        // This endpoint returns a list for some panel versions; take the
        // first entry either way.
        let response = envelope(body);
        let user_value = match &response {
            Value::Array(items) => items.first().cloned().ok_or(ApiError::NotFound)?,
            other => other.clone(),
        };
        serde_json::from_value(user_value)
            .map_err(|e| ApiError::Api { status: 200, body: format!("unexpected user shape: {}", e) })
    }

    // --- Subscriptions ---

    pub async fn get_subscription_url(&self, short_uuid: &str) -> Result<Option<String>, ApiError> {
        let body = self
            .request(Method::GET, &format!("/api/sub/{}/info", short_uuid), None)
            .await?;
        let info = envelope(body);
        Ok(info
            .get("subscriptionUrl")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()))
    }

    // --- Transport ---

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_err = None;

        for attempt in 0..MAX_RETRIES {
            let mut req = self.client.request(method.clone(), &url);
            if let Some(token) = &self.token {
                req = req.bearer_auth(token);
            }
            if let Some(json_body) = &body {
                req = req.json(json_body);
            }

            debug!("{} {} (attempt {}/{})", method, url, attempt + 1, MAX_RETRIES);

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp
                            .json::<Value>()
                            .await
                            .map_err(|e| ApiError::Transient(e.to_string()));
                    }
                    let err = Self::map_status(status, resp, &url).await;
                    if err.is_transient() {
                        last_err = Some(err);
                    } else {
                        return Err(err);
                    }
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    last_err = Some(ApiError::Transient(e.to_string()));
                }
                Err(e) => return Err(ApiError::Transient(e.to_string())),
            }

            if attempt + 1 < MAX_RETRIES {
                let delay = Duration::from_millis(500 * 2u64.pow(attempt));
                warn!(
                    "Transient error on {} {}, retrying in {:?} (attempt {}/{})",
                    method, url, delay, attempt + 1, MAX_RETRIES
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(last_err.unwrap_or_else(|| {
            ApiError::Transient(format!("{} failed after {} attempts", url, MAX_RETRIES))
        }))
    }

    async fn map_status(status: StatusCode, resp: reqwest::Response, url: &str) -> ApiError {
        let body = resp.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Unauthorized,
            StatusCode::NOT_FOUND => ApiError::NotFound,
            StatusCode::PERMANENT_REDIRECT => {
                error!(
                    "API returned 308 Permanent Redirect for {} — use an HTTPS base URL",
                    url
                );
                ApiError::Api { status: 308, body: "API_BASE_URL must use https".to_string() }
            }
            s if s.is_server_error() => ApiError::Transient(format!("HTTP {}: {}", s, body)),
            s => {
                warn!("API error {} on {}: {}", s, url, body);
                ApiError::Api { status: s.as_u16(), body }
            }
        }
    }
}

fn envelope(body: Value) -> Value {
    body.get("response").cloned().unwrap_or(body)
}

fn parse_user(body: Value) -> Result<RemoteUser, ApiError> {
    serde_json::from_value(envelope(body))
        .map_err(|e| ApiError::Api { status: 200, body: format!("unexpected user shape: {}", e) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_is_optional() {
        let wrapped = json!({"response": {"uuid": "u-1", "shortUuid": "s-1"}});
        let user = parse_user(wrapped).unwrap();
        assert_eq!(user.uuid, "u-1");
        assert_eq!(user.short_uuid.as_deref(), Some("s-1"));

        let bare = json!({"uuid": "u-2", "expireAt": "2026-03-25T08:21:28Z"});
        let user = parse_user(bare).unwrap();
        assert_eq!(user.uuid, "u-2");
        assert!(user.expire_at.is_some());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let body = json!({
            "uuid": "u-3",
            "username": "alice",
            "status": "ACTIVE",
            "trafficLimitBytes": 0,
            "hwidDeviceLimit": null
        });
        let user = parse_user(body).unwrap();
        assert_eq!(user.username.as_deref(), Some("alice"));
        assert_eq!(user.status.as_deref(), Some("ACTIVE"));
    }

    #[test]
    fn already_exists_detection() {
        let err = ApiError::Api { status: 400, body: "User username already exists (A019)".into() };
        assert!(err.is_already_exists());
        assert!(!ApiError::NotFound.is_already_exists());
    }
}
