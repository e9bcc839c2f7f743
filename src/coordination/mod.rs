//! Coordination Client (spec.md §4.B): JSON-RPC client for file
//! reservations, messages, and approvals, with resource→tool fallback.
//! Grounded on `ai-session/src/mcp/jsonrpc.rs` for the wire types and
//! `src/mcp/transport.rs`'s `HttpTransport` for the `reqwest`-backed
//! transport.

pub mod jsonrpc;

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::config::CoordinationConfig;
use jsonrpc::{JsonRpcRequest, JsonRpcResponse, RequestId};

#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("coordination service unavailable: {0}")]
    Unavailable(String),
    #[error("coordination method not supported: {0}")]
    NotSupported(String),
    #[error("coordination request denied: {0}")]
    Denied(String),
    #[error("invalid coordination request: {0}")]
    Invalid(String),
    #[error("failed to parse coordination response: {0}")]
    Serialization(String),
}

/// A claim on a glob pattern (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReservation {
    pub id: String,
    #[serde(alias = "agent")]
    pub agent_name: String,
    pub path_pattern: String,
    pub exclusive: bool,
    pub reason: String,
    pub created_ts: i64,
    pub expires_ts: Option<i64>,
}

/// Contract consumed by the Work-Assignment Engine and Coordinator Loop.
/// A trait seam so tests substitute an in-memory fake (spec.md §9).
#[async_trait]
pub trait Coordination: Send + Sync {
    async fn read_resource(&self, uri: &str) -> Result<Value, CoordinationError>;
    async fn call_tool(&self, name: &str, params: Value) -> Result<Value, CoordinationError>;
    async fn list_reservations(
        &self,
        project: &str,
        filter_agent: Option<&str>,
        include_inactive: bool,
    ) -> Result<Vec<FileReservation>, CoordinationError>;
    async fn reserve_files(
        &self,
        agent: &str,
        patterns: &[String],
        reason: &str,
        ttl: Duration,
    ) -> Result<Vec<FileReservation>, CoordinationError>;
    /// Best-effort; errors are logged, never propagated.
    async fn transfer_reservations(&self, from_agent: &str, to_agent: &str, work_id: &str) -> bool;
    async fn is_available(&self) -> bool;
}

/// Production implementation over HTTP JSON-RPC 2.0.
pub struct HttpCoordinationClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    next_id: AtomicI64,
}

impl HttpCoordinationClient {
    pub fn new(cfg: &CoordinationConfig) -> Result<Self, CoordinationError> {
        let base_url = cfg
            .url
            .clone()
            .or_else(|| std::env::var("AGENT_MAIL_URL").ok())
            .ok_or_else(|| CoordinationError::Unavailable("AGENT_MAIL_URL not set".to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| CoordinationError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            token: cfg.token.clone().or_else(|| std::env::var("AGENT_MAIL_TOKEN").ok()),
            next_id: AtomicI64::new(1),
        })
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, CoordinationError> {
        let request = JsonRpcRequest::new(self.next_request_id(), method, params);
        let mut req = self.http.post(&self.base_url).json(&request);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                CoordinationError::Unavailable(e.to_string())
            } else {
                CoordinationError::Invalid(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_client_error() {
            return Err(CoordinationError::Invalid(format!(
                "http {status} calling {method}"
            )));
        }
        if status.is_server_error() {
            return Err(CoordinationError::Unavailable(format!(
                "http {status} calling {method}"
            )));
        }

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| CoordinationError::Serialization(e.to_string()))?;

        if let Some(err) = body.error {
            return Err(classify_rpc_error(&err));
        }
        body.result
            .ok_or_else(|| CoordinationError::Invalid("empty result".to_string()))
    }
}

fn classify_rpc_error(err: &jsonrpc::JsonRpcError) -> CoordinationError {
    match err.code {
        -32601 => CoordinationError::NotSupported(err.message.clone()),
        -32000..=-32099 if err.message.to_lowercase().contains("denied") => {
            CoordinationError::Denied(err.message.clone())
        }
        -32000..=-32099 => CoordinationError::NotSupported(err.message.clone()),
        _ => CoordinationError::Invalid(err.message.clone()),
    }
}

#[async_trait]
impl Coordination for HttpCoordinationClient {
    async fn read_resource(&self, uri: &str) -> Result<Value, CoordinationError> {
        let result = self
            .call("read_resource", Some(serde_json::json!({ "uri": uri })))
            .await?;
        let contents = result
            .get("contents")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|first| first.get("text"))
            .and_then(|text| text.as_str())
            .ok_or_else(|| CoordinationError::Invalid("missing contents[].text".to_string()))?;
        serde_json::from_str(contents).map_err(|e| CoordinationError::Serialization(e.to_string()))
    }

    async fn call_tool(&self, name: &str, params: Value) -> Result<Value, CoordinationError> {
        self.call(
            "call_tool",
            Some(serde_json::json!({ "name": name, "arguments": params })),
        )
        .await
    }

    async fn list_reservations(
        &self,
        project: &str,
        filter_agent: Option<&str>,
        include_inactive: bool,
    ) -> Result<Vec<FileReservation>, CoordinationError> {
        let active_only = !include_inactive;
        let uri = format!("resource://file_reservations/{project}?active_only={active_only}");
        let value = match self.read_resource(&uri).await {
            Ok(v) => v,
            Err(CoordinationError::NotSupported(_)) => {
                self.call_tool("list_file_reservations", serde_json::json!({ "project": project }))
                    .await?
            }
            Err(other) => return Err(other),
        };
        let mut reservations: Vec<FileReservation> = serde_json::from_value(value)
            .map_err(|e| CoordinationError::Serialization(e.to_string()))?;
        if let Some(agent) = filter_agent {
            reservations.retain(|r| r.agent_name == agent);
        }
        Ok(reservations)
    }

    async fn reserve_files(
        &self,
        agent: &str,
        patterns: &[String],
        reason: &str,
        ttl: Duration,
    ) -> Result<Vec<FileReservation>, CoordinationError> {
        let value = self
            .call_tool(
                "reserve_files",
                serde_json::json!({
                    "agent": agent,
                    "patterns": patterns,
                    "reason": reason,
                    "ttl_secs": ttl.as_secs(),
                    "exclusive": true,
                }),
            )
            .await?;
        serde_json::from_value(value).map_err(|e| CoordinationError::Serialization(e.to_string()))
    }

    async fn transfer_reservations(&self, from_agent: &str, to_agent: &str, work_id: &str) -> bool {
        let result = self
            .call_tool(
                "transfer_reservations",
                serde_json::json!({
                    "from_agent": from_agent,
                    "to_agent": to_agent,
                    "work_id": work_id,
                }),
            )
            .await;
        if let Err(err) = &result {
            warn!(from_agent, to_agent, work_id, error = %err, "reservation transfer failed");
        }
        result.is_ok()
    }

    async fn is_available(&self) -> bool {
        self.call_tool("ping", serde_json::json!({})).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(url: String) -> CoordinationConfig {
        CoordinationConfig {
            url: Some(url),
            token: None,
            enabled: true,
            timeout_secs: 2,
        }
    }

    #[tokio::test]
    async fn read_resource_parses_contents_text() {
        let server = MockServer::start().await;
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": { "contents": [ { "text": "{\"ok\":true}" } ] }
        });
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let client = HttpCoordinationClient::new(&config_for(server.uri())).unwrap();
        let value = client.read_resource("resource://file_reservations/p").await.unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn not_supported_falls_back_to_call_tool() {
        let server = MockServer::start().await;
        let error_body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32601, "message": "no such resource" }
        });
        let tool_body = json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": [
                { "id": "r1", "agent_name": "BlueLake", "path_pattern": "src/**", "exclusive": true, "reason": "bd-1", "created_ts": 0, "expires_ts": null }
            ]
        });
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(error_body))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(tool_body))
            .mount(&server)
            .await;

        let client = HttpCoordinationClient::new(&config_for(server.uri())).unwrap();
        let reservations = client
            .list_reservations("proj", Some("BlueLake"), false)
            .await
            .unwrap();
        assert_eq!(reservations.len(), 1);
        assert_eq!(reservations[0].agent_name, "BlueLake");
    }

    #[tokio::test]
    async fn server_error_classified_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = HttpCoordinationClient::new(&config_for(server.uri())).unwrap();
        let err = client.is_available().await;
        assert!(!err);
    }

    #[tokio::test]
    async fn transfer_reservations_is_best_effort() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = HttpCoordinationClient::new(&config_for(server.uri())).unwrap();
        let ok = client.transfer_reservations("a", "b", "bd-1").await;
        assert!(!ok);
    }
}
