//! Request and response shapes exchanged with the transport

use bytes::Bytes;
use http::{Method, StatusCode};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Description of a single outgoing request
///
/// Built by a method's request builder, rewritten by request middleware and
/// finally handed to the [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, PartialEq)]
pub struct RequestConfig {
    /// HTTP verb
    pub method: Method,
    /// Target URL, passed through verbatim
    pub url: String,
    /// Request headers
    pub headers: BTreeMap<String, String>,
    /// Query parameters
    pub query: BTreeMap<String, String>,
    /// JSON body, if any
    pub body: Option<Value>,
    /// Transport-level timeout
    pub timeout: Option<Duration>,
}

impl RequestConfig {
    /// Create a request for the given verb and URL
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        RequestConfig {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Response returned by the transport
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Decoded payload
    pub data: Value,
    /// HTTP status code
    pub status: u16,
    /// Reason phrase for the status
    pub status_text: String,
    /// Response headers
    pub headers: BTreeMap<String, String>,
    /// Undecoded body as received
    pub raw: Bytes,
}

impl Response {
    /// Create a response with the given status and payload
    pub fn new(status: u16, data: Value) -> Self {
        let status_text = StatusCode::from_u16(status)
            .ok()
            .and_then(|code| code.canonical_reason())
            .unwrap_or("")
            .to_string();

        Response {
            data,
            status,
            status_text,
            headers: BTreeMap::new(),
            raw: Bytes::new(),
        }
    }

    /// A `200 OK` response carrying `data`
    pub fn ok(data: Value) -> Self {
        Self::new(200, data)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_builder() {
        let request = RequestConfig::get("https://api.example.com/users")
            .with_header("Authorization", "Bearer t")
            .with_query("page", "2")
            .with_timeout(Duration::from_secs(5));

        assert_eq!(request.method, Method::GET);
        assert_eq!(request.headers.get("Authorization").unwrap(), "Bearer t");
        assert_eq!(request.query.get("page").unwrap(), "2");
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
        assert!(request.body.is_none());
    }

    #[test]
    fn test_response_status_text() {
        let response = Response::ok(json!({"id": 1}));
        assert_eq!(response.status_text, "OK");
        assert!(response.is_success());

        let response = Response::new(503, Value::Null);
        assert_eq!(response.status_text, "Service Unavailable");
        assert!(!response.is_success());
    }
}
