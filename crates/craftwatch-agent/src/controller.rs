//! Async client for the Crafty Controller API v2.
//!
//! The client never retries; retry policy lives in the monitor loop, which
//! matches on [`ControllerError`] kinds to decide.

use reqwest::Method;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::ControllerConfig;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// Connection failures, timeouts, 5xx — worth retrying next tick.
    #[error("controller unreachable: {0}")]
    Transient(String),
    /// 401/403 — the token is wrong; retrying cannot help.
    #[error("controller rejected the API token (HTTP {0})")]
    AuthDenied(u16),
    #[error("server '{0}' is unknown to the controller")]
    NotFound(String),
    /// The controller answered, but not in a shape we understand.
    #[error("unexpected controller response: {0}")]
    Protocol(String),
}

impl ControllerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthDenied(_))
    }

    /// Protocol errors are treated as transient: the controller is alive,
    /// the next poll may well parse.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Protocol(_))
    }
}

/// One server's slice of `GET /api/v2/servers/{id}/stats`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServerStats {
    #[serde(default)]
    pub running: bool,
    /// Only meaningful while `running` is true.
    #[serde(default)]
    pub online: u32,
    #[serde(default)]
    pub max: u32,
    /// Base64 favicon as cached by the controller, passed through to the
    /// hibernation status response.
    #[serde(default)]
    pub icon: Option<String>,
}

fn classify_status(status: u16, server_id: Option<&str>) -> Option<ControllerError> {
    match status {
        200..=299 => None,
        401 | 403 => Some(ControllerError::AuthDenied(status)),
        404 => match server_id {
            Some(id) => Some(ControllerError::NotFound(id.to_string())),
            None => Some(ControllerError::Protocol("HTTP 404".to_string())),
        },
        other => Some(ControllerError::Transient(format!("HTTP {other}"))),
    }
}

/// Crafty wraps payloads in `{"status": "ok", "data": …}`; tolerate a flat
/// body too.
fn unwrap_data(body: Value) -> Value {
    match body {
        Value::Object(mut map) => match map.remove("data") {
            Some(data) => data,
            None => Value::Object(map),
        },
        other => other,
    }
}

fn parse_stats(body: Value) -> Result<ServerStats, ControllerError> {
    serde_json::from_value(unwrap_data(body))
        .map_err(|e| ControllerError::Protocol(format!("bad stats payload: {e}")))
}

fn id_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct CraftyClient {
    http: reqwest::Client,
    base_url: String,
}

impl CraftyClient {
    pub fn new(cfg: &ControllerConfig, token: &str) -> anyhow::Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| anyhow::anyhow!("API token contains invalid header characters"))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .user_agent(concat!("craftwatch/", env!("CARGO_PKG_VERSION")))
            .timeout(cfg.request_timeout())
            .default_headers(headers)
            .danger_accept_invalid_certs(!cfg.verify_tls)
            .build()?;

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn request_json(
        &self,
        method: Method,
        path: &str,
        server_id: Option<&str>,
    ) -> Result<Value, ControllerError> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(%url, "controller request");

        let resp = self
            .http
            .request(method, &url)
            .send()
            .await
            .map_err(|e| ControllerError::Transient(e.to_string()))?;

        if let Some(err) = classify_status(resp.status().as_u16(), server_id) {
            return Err(err);
        }

        resp.json()
            .await
            .map_err(|e| ControllerError::Protocol(format!("{path}: {e}")))
    }

    /// `GET /api/v2/crafty/check` — controller liveness.
    pub async fn check(&self) -> Result<bool, ControllerError> {
        let body = self
            .request_json(Method::GET, "/api/v2/crafty/check", None)
            .await?;
        Ok(body.get("status").and_then(Value::as_str) == Some("ok"))
    }

    /// `GET /api/v2/servers` — ids the token can see, used at boot to catch
    /// config typos.
    pub async fn list_server_ids(&self) -> Result<Vec<String>, ControllerError> {
        let body = self.request_json(Method::GET, "/api/v2/servers", None).await?;
        let data = unwrap_data(body);
        let rows = data
            .as_array()
            .ok_or_else(|| ControllerError::Protocol("server list is not an array".to_string()))?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("server_id"))
            .map(id_to_string)
            .collect())
    }

    /// `GET /api/v2/servers/{id}/stats`.
    pub async fn stats(&self, server_id: &str) -> Result<ServerStats, ControllerError> {
        let body = self
            .request_json(
                Method::GET,
                &format!("/api/v2/servers/{server_id}/stats"),
                Some(server_id),
            )
            .await?;
        parse_stats(body)
    }

    /// `POST /api/v2/servers/{id}/action/start_server`. Returns once the
    /// controller has accepted the request; it does not wait for the server
    /// to come online.
    pub async fn start(&self, server_id: &str) -> Result<(), ControllerError> {
        self.action(server_id, "start_server").await
    }

    /// `POST /api/v2/servers/{id}/action/stop_server`, same contract.
    pub async fn stop(&self, server_id: &str) -> Result<(), ControllerError> {
        self.action(server_id, "stop_server").await
    }

    async fn action(&self, server_id: &str, action: &str) -> Result<(), ControllerError> {
        let body = self
            .request_json(
                Method::POST,
                &format!("/api/v2/servers/{server_id}/action/{action}"),
                Some(server_id),
            )
            .await?;
        match body.get("status").and_then(Value::as_str) {
            Some("ok") => Ok(()),
            other => Err(ControllerError::Protocol(format!(
                "{action} for '{server_id}' answered status {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_classification() {
        assert!(classify_status(200, None).is_none());
        assert!(classify_status(204, None).is_none());
        assert!(matches!(
            classify_status(401, None),
            Some(ControllerError::AuthDenied(401))
        ));
        assert!(matches!(
            classify_status(403, Some("s1")),
            Some(ControllerError::AuthDenied(403))
        ));
        assert!(matches!(
            classify_status(404, Some("s1")),
            Some(ControllerError::NotFound(id)) if id == "s1"
        ));
        assert!(matches!(
            classify_status(500, None),
            Some(ControllerError::Transient(_))
        ));
        assert!(matches!(
            classify_status(429, None),
            Some(ControllerError::Transient(_))
        ));
    }

    #[test]
    fn stats_parse_enveloped() {
        let stats = parse_stats(json!({
            "status": "ok",
            "data": {"running": true, "online": 3, "max": 20, "icon": "aGk="}
        }))
        .unwrap();
        assert!(stats.running);
        assert_eq!(stats.online, 3);
        assert_eq!(stats.max, 20);
        assert_eq!(stats.icon.as_deref(), Some("aGk="));
    }

    #[test]
    fn stats_parse_flat_and_sparse() {
        let stats = parse_stats(json!({"running": false})).unwrap();
        assert!(!stats.running);
        assert_eq!(stats.online, 0);
        assert!(stats.icon.is_none());
    }

    #[test]
    fn stats_parse_rejects_garbage() {
        assert!(matches!(
            parse_stats(json!({"data": "not an object"})),
            Err(ControllerError::Protocol(_))
        ));
    }

    #[test]
    fn server_ids_tolerate_numbers() {
        assert_eq!(id_to_string(&json!("uuid-1")), "uuid-1");
        assert_eq!(id_to_string(&json!(7)), "7");
    }

    #[test]
    fn transient_matrix() {
        assert!(ControllerError::Transient("x".into()).is_transient());
        assert!(ControllerError::Protocol("x".into()).is_transient());
        assert!(!ControllerError::NotFound("x".into()).is_transient());
        assert!(!ControllerError::AuthDenied(401).is_transient());
        assert!(ControllerError::AuthDenied(403).is_fatal());
    }
}
