use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Method;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::{sync::Mutex, time::Instant};

use super::{DeviceGateway, DeviceStatus, GatewayError};

type HmacSha256 = Hmac<Sha256>;

/// Tokens are refreshed this long before the provider's expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Provider codes that mean the cached access token is no longer usable.
const TOKEN_INVALID_CODES: [&str; 2] = ["1010", "1011"];

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    success: bool,
    result: Option<T>,
    code: Option<serde_json::Value>,
    msg: Option<String>,
}

impl<T> ApiEnvelope<T> {
    fn into_result(self) -> Result<T, GatewayError> {
        if !self.success {
            let code = match self.code {
                Some(serde_json::Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => "unknown".to_string(),
            };
            return Err(GatewayError::Provider {
                code,
                message: self.msg.unwrap_or_default(),
            });
        }
        self.result
            .ok_or_else(|| GatewayError::InvalidResponse("successful response without result".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResult {
    access_token: String,
    expire_time: u64,
}

#[derive(Debug, Deserialize)]
struct StatusItem {
    code: String,
    #[serde(default)]
    value: serde_json::Value,
}

struct CachedToken {
    access_token: String,
    refresh_at: Instant,
}

/// Tuya OpenAPI client (cloud project credentials, simple token mode).
pub struct TuyaGateway {
    http: reqwest::Client,
    base_url: String,
    access_id: String,
    access_secret: String,
    token: Mutex<Option<CachedToken>>,
}

impl TuyaGateway {
    pub fn new(base_url: &str, access_id: &str, access_secret: &str, request_timeout: Duration) -> Result<Self, GatewayError> {
        if access_id.is_empty() || access_secret.is_empty() {
            return Err(GatewayError::Config("tuya access id and secret are required".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_id: access_id.to_string(),
            access_secret: access_secret.to_string(),
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.access_token.clone());
            }
        }

        let fresh: TokenResult = self
            .send_signed(Method::GET, "/v1.0/token?grant_type=1", None, None)
            .await?;
        let lifetime = Duration::from_secs(fresh.expire_time).saturating_sub(TOKEN_EXPIRY_MARGIN);
        tracing::debug!(expires_in_s = fresh.expire_time, "tuya access token refreshed");

        let access_token = fresh.access_token.clone();
        *cached = Some(CachedToken {
            access_token: fresh.access_token,
            refresh_at: Instant::now() + lifetime,
        });
        Ok(access_token)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, GatewayError> {
        let token = self.access_token().await?;
        let res = self.send_signed(method, path, body, Some(&token)).await;
        if let Err(GatewayError::Provider { code, .. }) = &res {
            if TOKEN_INVALID_CODES.contains(&code.as_str()) {
                tracing::warn!(code = %code, "tuya rejected access token, dropping cached token");
                *self.token.lock().await = None;
            }
        }
        res
    }

    async fn send_signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        access_token: Option<&str>,
    ) -> Result<T, GatewayError> {
        let body_str = body.map(|b| b.to_string()).unwrap_or_default();
        let t = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default()
            .to_string();
        let nonce = hex::encode(rand::random::<[u8; 16]>());
        let to_sign = string_to_sign(method.as_str(), &body_str, path);
        let sign = sign_request(&self.access_secret, &self.access_id, access_token, &t, &nonce, &to_sign)?;

        let mut req = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("client_id", &self.access_id)
            .header("sign", sign)
            .header("sign_method", "HMAC-SHA256")
            .header("t", &t)
            .header("nonce", &nonce);
        if let Some(token) = access_token {
            req = req.header("access_token", token);
        }
        if body.is_some() {
            req = req.header("Content-Type", "application/json").body(body_str);
        }

        let resp = req.send().await.map_err(|e| GatewayError::Transport(e.to_string()))?;
        let status = resp.status();
        let envelope: ApiEnvelope<T> = resp
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(format!("HTTP {status}: {e}")))?;
        envelope.into_result()
    }
}

/// `METHOD\nsha256(body)\n\nurl`; no signed custom headers.
pub fn string_to_sign(method: &str, body: &str, url: &str) -> String {
    let body_hash = hex::encode(Sha256::digest(body.as_bytes()));
    format!("{method}\n{body_hash}\n\n{url}")
}

/// Upper-case hex HMAC-SHA256 over `client_id [+ access_token] + t + nonce + stringToSign`.
pub fn sign_request(
    secret: &str,
    client_id: &str,
    access_token: Option<&str>,
    t: &str,
    nonce: &str,
    string_to_sign: &str,
) -> Result<String, GatewayError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::Config(format!("invalid signing secret: {e}")))?;
    mac.update(client_id.as_bytes());
    if let Some(token) = access_token {
        mac.update(token.as_bytes());
    }
    mac.update(t.as_bytes());
    mac.update(nonce.as_bytes());
    mac.update(string_to_sign.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()).to_uppercase())
}

#[async_trait]
impl DeviceGateway for TuyaGateway {
    async fn device_status(&self, device_id: &str) -> Result<DeviceStatus, GatewayError> {
        let path = format!("/v1.0/iot-03/devices/{device_id}/status");
        let items: Vec<StatusItem> = self.request(Method::GET, &path, None).await?;
        Ok(items.into_iter().map(|item| (item.code, item.value)).collect())
    }

    async fn send_command(
        &self,
        device_id: &str,
        code: &str,
        value: serde_json::Value,
    ) -> Result<bool, GatewayError> {
        let path = format!("/v1.0/iot-03/devices/{device_id}/commands");
        let body = json!({ "commands": [{ "code": code, "value": value }] });
        self.request(Method::POST, &path, Some(&body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn string_to_sign_hashes_empty_body() {
        let s = string_to_sign("GET", "", "/v1.0/token?grant_type=1");
        assert_eq!(s, format!("GET\n{EMPTY_SHA256}\n\n/v1.0/token?grant_type=1"));
    }

    #[test]
    fn signature_is_uppercase_hex_and_depends_on_token() {
        let sts = string_to_sign("GET", "", "/v1.0/iot-03/devices/d1/status");
        let without = sign_request("secret", "client", None, "1700000000000", "abc", &sts).unwrap();
        let with = sign_request("secret", "client", Some("tok"), "1700000000000", "abc", &sts).unwrap();

        assert_eq!(without.len(), 64);
        assert!(without.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        assert_ne!(without, with);

        let again = sign_request("secret", "client", Some("tok"), "1700000000000", "abc", &sts).unwrap();
        assert_eq!(with, again);
    }

    #[test]
    fn unsuccessful_envelope_carries_provider_code() {
        let raw = r#"{"success":false,"code":1010,"msg":"token invalid","t":1}"#;
        let env: ApiEnvelope<bool> = serde_json::from_str(raw).unwrap();
        assert_eq!(
            env.into_result(),
            Err(GatewayError::Provider {
                code: "1010".to_string(),
                message: "token invalid".to_string(),
            })
        );
    }

    #[test]
    fn status_items_parse_into_flat_map() {
        let raw = r#"{"success":true,"result":[{"code":"add_ele","value":1234},{"code":"switch_1","value":true}]}"#;
        let env: ApiEnvelope<Vec<StatusItem>> = serde_json::from_str(raw).unwrap();
        let status: DeviceStatus = env.into_result().unwrap().into_iter().map(|i| (i.code, i.value)).collect();
        assert_eq!(status["add_ele"], json!(1234));
        assert_eq!(status["switch_1"], json!(true));
    }

    #[test]
    fn missing_credentials_are_rejected() {
        assert!(matches!(
            TuyaGateway::new("https://openapi.tuyaus.com", "", "", Duration::from_secs(5)),
            Err(GatewayError::Config(_))
        ));
    }
}
