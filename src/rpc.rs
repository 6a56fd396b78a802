//! JSON-RPC transport for chain calls.
//!
//! Single and batched requests against one HTTP endpoint with an iterative
//! retry loop. Rate-limit responses (429/503) honor a server-provided
//! `Retry-After` delay when present and do not consume the attempt budget;
//! protocol-level error objects in an otherwise successful HTTP response are
//! retried under the same budget. Batches are all-or-nothing.

use crate::metrics::Metrics;
use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Rate-limit waits are unbounded by the retry budget, so cap them
/// separately to avoid spinning on a permanently saturated endpoint.
const MAX_RATE_LIMIT_WAITS: u32 = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
    pub id: u64,
}

impl RpcRequest {
    pub fn new(method: &str, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: 1,
        }
    }

    pub fn with_id(method: &str, params: Vec<Value>, id: u64) -> Self {
        Self {
            id,
            ..Self::new(method, params)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
    #[serde(default)]
    pub id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Error)]
pub enum RpcClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {0}")]
    Status(StatusCode),
    #[error("rpc error {code}: {message}")]
    Protocol { code: i64, message: String },
    #[error("malformed rpc response: {0}")]
    Malformed(String),
    #[error("rate limited for too long ({0} waits)")]
    RateLimited(u32),
    #[error("rpc retries exhausted after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<RpcClientError>,
    },
}

/// Backoff policy as a first-class value: `delay_for(attempt)` is the pause
/// before retry number `attempt` (1-based).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        self.base_delay.mul_f64(factor)
    }

    /// Geometric fallback when a rate-limit response carries no
    /// `Retry-After` header.
    pub fn rate_limit_delay(&self, waits: u32) -> Duration {
        self.base_delay.mul_f64(self.multiplier.powi(waits as i32))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            multiplier: 1.7,
        }
    }
}

/// Seam for the chain RPC: production uses [`HttpTransport`], tests swap in
/// a scripted chain.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcClientError>;

    async fn call_batch(
        &self,
        requests: Vec<RpcRequest>,
    ) -> Result<Vec<RpcResponse>, RpcClientError>;
}

enum Outcome {
    Ok(Value),
    RateLimited(Option<u64>),
    Failed(RpcClientError),
}

pub struct HttpTransport {
    client: HttpClient,
    endpoint: String,
    retry: RetryPolicy,
}

impl HttpTransport {
    pub fn new(
        endpoint: &str,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, RpcClientError> {
        let client = HttpClient::builder()
            .timeout(timeout)
            .user_agent("arena-indexer/0.1")
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            retry,
        })
    }

    async fn round_trip(&self, body: &Value) -> Outcome {
        let response = match self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Outcome::Failed(RpcClientError::Http(e)),
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            return Outcome::RateLimited(retry_after);
        }
        if !status.is_success() {
            return Outcome::Failed(RpcClientError::Status(status));
        }

        match response.json::<Value>().await {
            Ok(json) => Outcome::Ok(json),
            Err(e) => Outcome::Failed(RpcClientError::Malformed(e.to_string())),
        }
    }

    /// Retry loop shared by single and batch calls. Returns the raw JSON
    /// body once it contains no protocol-level error object.
    async fn execute(&self, body: Value) -> Result<Value, RpcClientError> {
        let mut attempts: u32 = 0;
        let mut rate_limit_waits: u32 = 0;
        let mut last_error: Option<RpcClientError> = None;

        loop {
            Metrics::rpc_call();
            match self.round_trip(&body).await {
                Outcome::Ok(json) => match protocol_error_in(&json) {
                    None => return Ok(json),
                    Some(error) => {
                        debug!("rpc protocol error, will retry: {}", error);
                        last_error = Some(error);
                    }
                },
                Outcome::RateLimited(retry_after) => {
                    if rate_limit_waits >= MAX_RATE_LIMIT_WAITS {
                        last_error = Some(RpcClientError::RateLimited(rate_limit_waits));
                    } else {
                        let wait = retry_after
                            .map(Duration::from_secs)
                            .unwrap_or_else(|| self.retry.rate_limit_delay(rate_limit_waits));
                        rate_limit_waits += 1;
                        Metrics::rpc_rate_limit_wait();
                        debug!(
                            "rate limited, waiting {:?} (wait {}/{})",
                            wait, rate_limit_waits, MAX_RATE_LIMIT_WAITS
                        );
                        tokio::time::sleep(wait).await;
                        // Does not consume the attempt budget.
                        continue;
                    }
                }
                Outcome::Failed(error) => {
                    debug!("rpc transport failure: {}", error);
                    last_error = Some(error);
                }
            }

            attempts += 1;
            if attempts >= self.retry.max_attempts {
                let last = last_error
                    .unwrap_or_else(|| RpcClientError::Malformed("no error recorded".into()));
                warn!("rpc retries exhausted after {} attempts: {}", attempts, last);
                return Err(RpcClientError::Exhausted {
                    attempts,
                    last: Box::new(last),
                });
            }
            Metrics::rpc_retry();
            tokio::time::sleep(self.retry.delay_for(attempts)).await;
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcClientError> {
        let request = RpcRequest::new(method, params);
        let body = serde_json::to_value(&request)
            .map_err(|e| RpcClientError::Malformed(e.to_string()))?;

        let json = self.execute(body).await?;
        let response: RpcResponse =
            serde_json::from_value(json).map_err(|e| RpcClientError::Malformed(e.to_string()))?;
        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn call_batch(
        &self,
        requests: Vec<RpcRequest>,
    ) -> Result<Vec<RpcResponse>, RpcClientError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let expected = requests.len();
        let body = serde_json::to_value(&requests)
            .map_err(|e| RpcClientError::Malformed(e.to_string()))?;

        let json = self.execute(body).await?;
        let mut responses: Vec<RpcResponse> =
            serde_json::from_value(json).map_err(|e| RpcClientError::Malformed(e.to_string()))?;
        if responses.len() != expected {
            return Err(RpcClientError::Malformed(format!(
                "batch returned {} responses, expected {}",
                responses.len(),
                expected
            )));
        }
        // Providers may answer batches out of order.
        responses.sort_by_key(|response| response.id);
        Ok(responses)
    }
}

/// Scan a response body (single object or batch array) for a protocol-level
/// error object.
fn protocol_error_in(json: &Value) -> Option<RpcClientError> {
    let as_protocol = |entry: &Value| -> Option<RpcClientError> {
        let error = entry.get("error")?;
        if error.is_null() {
            return None;
        }
        Some(RpcClientError::Protocol {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown rpc error")
                .to_string(),
        })
    };

    match json {
        Value::Array(entries) => entries.iter().find_map(as_protocol),
        other => as_protocol(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retry_policy_is_geometric() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));

        assert_eq!(policy.rate_limit_delay(0), Duration::from_millis(100));
        assert_eq!(policy.rate_limit_delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_rpc_request_shape() {
        let request = RpcRequest::with_id("eth_blockNumber", vec![], 7);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["method"], "eth_blockNumber");
        assert_eq!(json["id"], 7);
    }

    #[test]
    fn test_protocol_error_in_single_response() {
        let ok = json!({"jsonrpc": "2.0", "result": "0x1", "id": 1});
        assert!(protocol_error_in(&ok).is_none());

        let failed = json!({
            "jsonrpc": "2.0",
            "error": {"code": -32000, "message": "header not found"},
            "id": 1
        });
        match protocol_error_in(&failed) {
            Some(RpcClientError::Protocol { code, message }) => {
                assert_eq!(code, -32000);
                assert_eq!(message, "header not found");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_protocol_error_anywhere_in_batch() {
        let batch = json!([
            {"jsonrpc": "2.0", "result": "0x1", "id": 1},
            {"jsonrpc": "2.0", "error": {"code": -32005, "message": "limit exceeded"}, "id": 2},
        ]);
        assert!(protocol_error_in(&batch).is_some());

        let clean = json!([
            {"jsonrpc": "2.0", "result": "0x1", "id": 1},
            {"jsonrpc": "2.0", "result": "0x2", "id": 2},
        ]);
        assert!(protocol_error_in(&clean).is_none());
    }

    #[test]
    fn test_response_parses_with_missing_fields() {
        let response: RpcResponse =
            serde_json::from_value(json!({"jsonrpc": "2.0", "result": null})).unwrap();
        assert!(response.result.is_none() || response.result == Some(Value::Null));
        assert!(response.error.is_none());
    }
}
