//! HTTP client for the remote label service.

use crate::sync::config::LabelSyncConfig;
use crate::sync::models::{LabelBatchRequest, LabelRequest, PullResponse};
use crate::{LabelSyncError, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Body marker the label server uses when its nonce is ahead of the wallet's.
///
/// Matched verbatim for wire compatibility, including the server's spelling.
pub const NONCE_CONFLICT_MARKERS: [&str; 2] = [
    "serverNonce is larger then walletNonde",
    "serverNonce is larger then walletNonce",
];

/// HTTP method used against the label service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A fully built request handed to a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

/// Raw status and body returned by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

impl From<TransportError> for LabelSyncError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => Self::NetworkTimeout,
            TransportError::Other(msg) => Self::Network(msg),
        }
    }
}

/// Request/response exchange with the network.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError>;
}

/// [`Transport`] over `reqwest`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| LabelSyncError::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

fn transport_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Other(e.to_string())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder.send().await.map_err(transport_error)?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(transport_error)?;

        Ok(HttpResponse { status, body })
    }
}

/// Client for the label service.
#[derive(Clone)]
pub struct SyncClient {
    transport: Arc<dyn Transport>,
    base_url: String,
    timeout: Duration,
}

impl SyncClient {
    /// Create a client that talks HTTP through `reqwest`.
    pub fn new(config: &LabelSyncConfig) -> Result<Self> {
        Ok(Self::with_transport(config, Arc::new(ReqwestTransport::new()?)))
    }

    /// Create a client over a caller-supplied transport.
    pub fn with_transport(config: &LabelSyncConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            timeout: config.request_timeout(),
        }
    }

    /// Upload a single label.
    pub async fn post_label(&self, request: &LabelRequest) -> Result<()> {
        self.request(Method::Post, "/label", Some(&to_payload(request)?))
            .await?;
        Ok(())
    }

    /// Upload a batch of labels.
    pub async fn post_labels(&self, request: &LabelBatchRequest) -> Result<()> {
        self.request(Method::Post, "/labels", Some(&to_payload(request)?))
            .await?;
        Ok(())
    }

    /// Fetch labels changed since `nonce`.
    pub async fn labels_since(&self, nonce: u64, wallet_id: &str) -> Result<PullResponse> {
        let path = format!("/labels/since/{}/for/{}", nonce, wallet_id);
        let response = self.request(Method::Get, &path, None).await?;
        serde_json::from_value(response)
            .map_err(|e| LabelSyncError::InvalidResponse(format!("Invalid pull response: {}", e)))
    }

    /// Send a request and classify the response.
    ///
    /// GET payloads become query parameters; POST payloads become a JSON body.
    pub async fn request(&self, method: Method, path: &str, payload: Option<&Value>) -> Result<Value> {
        let mut request = HttpRequest {
            method,
            url: format!("{}{}", self.base_url, path),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            timeout: self.timeout,
        };

        match (method, payload) {
            (Method::Get, Some(payload)) => request.query = query_pairs(payload),
            (Method::Post, Some(payload)) => {
                request.body = Some(
                    serde_json::to_vec(payload)
                        .map_err(|e| LabelSyncError::InvalidResponse(e.to_string()))?,
                );
                request
                    .headers
                    .push(("Content-Type".to_string(), "application/json".to_string()));
            }
            (_, None) => {}
        }

        let response = self.transport.send(request).await?;
        classify(response)
    }
}

fn to_payload<T: Serialize>(request: &T) -> Result<Value> {
    serde_json::to_value(request).map_err(|e| LabelSyncError::InvalidResponse(e.to_string()))
}

fn query_pairs(payload: &Value) -> Vec<(String, String)> {
    match payload {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), v)
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn classify(response: HttpResponse) -> Result<Value> {
    if response.status == 400
        && NONCE_CONFLICT_MARKERS
            .iter()
            .any(|marker| response.body.contains(marker))
    {
        return Err(LabelSyncError::NonceConflict);
    }

    if response.status != 200 {
        return Err(LabelSyncError::RemoteStatus {
            status: response.status,
            body: response.body,
        });
    }

    let value: Value = serde_json::from_str(&response.body)
        .map_err(|e| LabelSyncError::InvalidResponse(e.to_string()))?;

    if let Some(error) = value.get("error") {
        let message = match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Err(LabelSyncError::Remote(message));
    }

    Ok(value)
}
