//! Transport seam between the orchestrator and the network

use crate::error::{CallError, Result};
use crate::models::{RequestConfig, Response};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Failure reported by a [`Transport`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    /// Status of a non-success response, if one was received
    pub status: Option<u16>,
    pub is_network_error: bool,
    pub is_timeout_error: bool,
    pub is_cancel_error: bool,
    pub message: String,
}

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        TransportError {
            status: None,
            is_network_error: true,
            is_timeout_error: false,
            is_cancel_error: false,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        TransportError {
            is_network_error: false,
            is_timeout_error: true,
            ..Self::network(message)
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        TransportError {
            is_network_error: false,
            is_cancel_error: true,
            ..Self::network(message)
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        TransportError {
            status: Some(status),
            is_network_error: false,
            ..Self::network(message)
        }
    }
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        if err.is_cancel_error {
            CallError::Cancelled(err.message)
        } else if err.is_timeout_error {
            CallError::Timeout(err.message)
        } else if let Some(status) = err.status {
            CallError::from_http_status(status, err.message)
        } else if err.is_network_error {
            CallError::Network(err.message)
        } else {
            CallError::Unknown(err.message)
        }
    }
}

/// Sends one resolved request
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: RequestConfig) -> std::result::Result<Response, TransportError>;
}

/// Adapts an async closure into a [`Transport`]
pub struct FnTransport<F> {
    send_fn: F,
}

impl<F> FnTransport<F> {
    pub fn new(send_fn: F) -> Self {
        FnTransport { send_fn }
    }
}

#[async_trait]
impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(RequestConfig) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Response, TransportError>> + Send,
{
    async fn send(&self, request: RequestConfig) -> std::result::Result<Response, TransportError> {
        (self.send_fn)(request).await
    }
}

/// HTTP transport backed by `reqwest`
pub struct ReqwestTransport {
    client: Client,
    base_url: Option<String>,
}

impl ReqwestTransport {
    /// Create a transport with a pooled client and a 30s default timeout
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| CallError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        ReqwestTransport {
            client,
            base_url: None,
        }
    }

    /// Prefix for request URLs that start with `/`
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    fn resolve_url(&self, url: &str) -> String {
        match &self.base_url {
            Some(base) if url.starts_with('/') => format!("{}{}", base, url),
            _ => url.to_string(),
        }
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::timeout(format!("Request timed out: {}", err))
    } else if let Some(status) = err.status() {
        TransportError::status(status.as_u16(), err.to_string())
    } else {
        TransportError::network(format!("Request failed: {}", err))
    }
}

/// JSON when the body parses, a string otherwise, null when empty
fn decode_body(raw: &[u8]) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(raw)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(raw).into_owned()))
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: RequestConfig) -> std::result::Result<Response, TransportError> {
        let url = self.resolve_url(&request.url);
        debug!("Sending {} {}", request.method, url);

        let mut builder = self.client.request(request.method.clone(), &url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;

        let status = response.status();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        let raw = response.bytes().await.map_err(map_reqwest_error)?;

        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("Unknown status");
            return Err(TransportError::status(
                status.as_u16(),
                format!("{} {}", status.as_u16(), reason),
            ));
        }

        let mut result = Response::new(status.as_u16(), decode_body(&raw));
        result.headers = headers;
        result.raw = raw;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transport_error_mapping() {
        let err: CallError = TransportError::network("reset").into();
        assert!(matches!(err, CallError::Network(_)));

        let err: CallError = TransportError::timeout("slow").into();
        assert!(matches!(err, CallError::Timeout(_)));

        let err: CallError = TransportError::cancelled("aborted").into();
        assert!(matches!(err, CallError::Cancelled(_)));

        let err: CallError = TransportError::status(503, "unavailable").into();
        assert_eq!(err.status(), Some(503));
        assert!(err.should_retry());
    }

    #[test]
    fn test_decode_body() {
        assert_eq!(decode_body(b""), Value::Null);
        assert_eq!(decode_body(br#"{"id":1}"#), json!({"id": 1}));
        assert_eq!(decode_body(b"plain text"), json!("plain text"));
    }

    #[test]
    fn test_resolve_url() {
        let transport = ReqwestTransport::new()
            .unwrap()
            .with_base_url("http://api.local/");
        assert_eq!(transport.resolve_url("/users"), "http://api.local/users");
        assert_eq!(transport.resolve_url("http://other/x"), "http://other/x");
    }

    #[tokio::test]
    async fn test_fn_transport() {
        let transport = FnTransport::new(|request: RequestConfig| async move {
            Ok(Response::ok(json!({ "url": request.url })))
        });

        let response = transport.send(RequestConfig::get("/ping")).await.unwrap();
        assert_eq!(response.data, json!({"url": "/ping"}));
    }
}
