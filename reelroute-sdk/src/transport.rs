//! # Transport Abstraction
//!
//! The orchestration core never references a concrete HTTP client. Adapters
//! describe each call as a [`NativeRequest`] and the router hands it to an
//! injected [`Transport`], which returns the raw status, headers and body.
//! [`ReqwestTransport`] is the batteries-included implementation; tests
//! inject scripted transports instead.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// One provider-native HTTP call, fully described by the adapter.
#[derive(Debug, Clone)]
pub struct NativeRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// JSON body; `Value::Null` for body-less requests.
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl NativeRequest {
    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: Vec::new(),
            body,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: serde_json::Value::Null,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }
}

/// Raw result of a transport call.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Failures below the HTTP layer: no status line was ever received.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport timeout")]
    Timeout,
    #[error("transport cancelled")]
    Cancelled,
    #[error("network error: {message}")]
    Network { message: String },
}

/// Injected HTTP executor.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: NativeRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, TransportError>;
}

/// Production transport backed by a pooled reqwest client.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| TransportError::Network {
                message: format!("failed to build http client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: NativeRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, TransportError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url).json(&request.body),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        builder = builder.timeout(timeout);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = builder.send() => result.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Network {
                        message: e.to_string(),
                    }
                }
            })?,
        };

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|value| (k.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            bytes = response.bytes() => bytes
                .map_err(|e| TransportError::Network {
                    message: e.to_string(),
                })?
                .to_vec(),
        };

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let response = TransportResponse {
            status: 429,
            headers: vec![("Retry-After".to_string(), "30".to_string())],
            body: Vec::new(),
        };
        assert_eq!(response.header("retry-after"), Some("30"));
        assert_eq!(response.header("x-missing"), None);
    }

    #[test]
    fn native_request_builder_collects_headers() {
        let request = NativeRequest::post("https://api.example/v1", serde_json::json!({"a": 1}))
            .with_header("Authorization", "Bearer k")
            .with_header("X-Version", "2024-11");
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.headers.len(), 2);
    }
}
