//! Credential exchange: HTTP login for the session token, then the
//! `authenticate` call over the socket.

use crate::client::session::Session;
use crate::error::{BlitzError, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

/// Default login endpoint for the broker's HTTP auth service.
pub const DEFAULT_LOGIN_URL: &str = "https://auth.iqoption.com/api/v2/login";

#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    data: Option<LoginData>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    #[serde(default)]
    ssid: Option<String>,
}

/// Exchange credentials for the opaque `ssid` session token.
///
/// Some deployments return the token in the JSON body, others only as a
/// `set-cookie` header; both are accepted.
pub async fn login(http: &reqwest::Client, login_url: &str, credentials: &Credentials) -> Result<String> {
    let response = http
        .post(login_url)
        .json(&json!({
            "identifier": credentials.email,
            "password": credentials.password,
        }))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BlitzError::Auth(format!("login failed ({status}): {body}")));
    }

    if let Some(ssid) = ssid_from_cookies(response.headers()) {
        return Ok(ssid);
    }

    let body: LoginResponse = response.json().await?;
    body.data
        .and_then(|data| data.ssid)
        .ok_or_else(|| BlitzError::Auth("no ssid in login response or cookies".to_string()))
}

fn ssid_from_cookies(headers: &reqwest::header::HeaderMap) -> Option<String> {
    for cookie in headers.get_all(reqwest::header::SET_COOKIE) {
        let Ok(cookie) = cookie.to_str() else { continue };
        if let Some(rest) = cookie.split(';').find_map(|part| part.trim().strip_prefix("ssid=")) {
            if !rest.is_empty() {
                return Some(rest.to_string());
            }
        }
    }
    None
}

/// Authenticate the socket session with a previously obtained `ssid`.
pub async fn authenticate(session: &Session, ssid: &str) -> Result<()> {
    let response = session
        .send(
            "authenticate",
            json!({
                "ssid": ssid,
                "protocol": 3,
                "session_id": "",
                "client_session_id": "",
            }),
            true,
        )
        .await?
        .ok_or_else(|| BlitzError::Internal("authenticate expected a response".to_string()))?;

    let accepted = response.msg == json!(true)
        || response.msg.get("isSuccessful").and_then(|v| v.as_bool()) == Some(true);
    if !accepted {
        return Err(BlitzError::Auth(format!(
            "socket authentication rejected: {}",
            response.msg
        )));
    }

    info!("authenticated");
    Ok(())
}
