//! `http` capability: one HTTP request per invocation.
//!
//! Parameters:
//! - `url` (required)
//! - `method` (default `GET`)
//! - `headers`: object of header name to string value
//! - `json`: request body sent as JSON; or `body`: raw string body
//! - `timeout_secs`: per-request timeout (default 30)
//!
//! Output is `{"status": <u16>, "body": <parsed JSON or text>}`.
//!
//! Error classification: 5xx, 429, timeouts and connection failures are
//! transient. Any other non-success status and every malformed parameter is
//! permanent.

use std::time::Duration;

use serde_json::{Map, Value, json};
use taskloom_core::capability::Capability;
use taskloom_types::error::CapabilityError;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub struct HttpCapability {
    client: reqwest::Client,
}

impl HttpCapability {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .user_agent(concat!("taskloom/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    fn build_request(&self, parameters: &Map<String, Value>) -> Result<reqwest::RequestBuilder, CapabilityError> {
        let url = parameters
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| CapabilityError::permanent("missing 'url' parameter"))?;

        let method = parameters.get("method").and_then(Value::as_str).unwrap_or("GET");
        let method: reqwest::Method = method
            .to_ascii_uppercase()
            .parse()
            .map_err(|_| CapabilityError::permanent(format!("invalid HTTP method: {method}")))?;

        let mut request = self.client.request(method, url);

        if let Some(headers) = parameters.get("headers") {
            let headers = headers
                .as_object()
                .ok_or_else(|| CapabilityError::permanent("'headers' must be an object"))?;
            for (name, value) in headers {
                let value = value.as_str().ok_or_else(|| {
                    CapabilityError::permanent(format!("header '{name}' must be a string"))
                })?;
                request = request.header(name.as_str(), value);
            }
        }

        if let Some(body) = parameters.get("json") {
            request = request.json(body);
        } else if let Some(body) = parameters.get("body") {
            let body = match body {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            request = request.body(body);
        }

        if let Some(secs) = parameters.get("timeout_secs").and_then(Value::as_u64) {
            request = request.timeout(Duration::from_secs(secs));
        }

        Ok(request)
    }
}

/// Whether a non-success status is worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

fn classify_send_error(err: reqwest::Error) -> CapabilityError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        CapabilityError::transient(format!("HTTP request failed: {err}"))
    } else {
        CapabilityError::permanent(format!("HTTP request failed: {err}"))
    }
}

impl Capability for HttpCapability {
    fn name(&self) -> &str {
        "http"
    }

    async fn invoke(
        &self,
        action: &str,
        parameters: &Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        let request = self.build_request(parameters)?;
        let response = request.send().await.map_err(classify_send_error)?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| {
            CapabilityError::transient(format!("failed to read HTTP response body: {e}"))
        })?;

        tracing::info!(action, status, body_len = text.len(), "HTTP call completed");

        if !(200..300).contains(&status) {
            let message = format!("HTTP {status}: {text}");
            return Err(if is_retryable_status(status) {
                CapabilityError::transient(message)
            } else {
                CapabilityError::permanent(message)
            });
        }

        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        Ok(json!({ "status": status, "body": body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response per accepted connection and return the base URL.
    async fn serve(responses: Vec<(u16, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 {status} X\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(429));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(400));
    }

    #[tokio::test]
    async fn success_parses_json_body() {
        let url = serve(vec![(200, r#"{"rows":3}"#)]).await;
        let http = HttpCapability::new().unwrap();
        let out = http
            .invoke("http", &params(json!({"url": format!("{url}/feed")})))
            .await
            .unwrap();
        assert_eq!(out, json!({"status": 200, "body": {"rows": 3}}));
    }

    #[tokio::test]
    async fn server_errors_are_transient_client_errors_permanent() {
        let url = serve(vec![(503, "busy"), (404, "nope")]).await;
        let http = HttpCapability::new().unwrap();
        let p = params(json!({"url": url, "method": "post", "json": {"a": 1}}));

        let first = http.invoke("http", &p).await.unwrap_err();
        assert!(first.is_transient());
        assert!(first.to_string().contains("HTTP 503"));

        let second = http.invoke("http", &p).await.unwrap_err();
        assert!(!second.is_transient());
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let http = HttpCapability::new().unwrap();
        let err = http
            .invoke("http", &params(json!({"url": format!("http://{addr}/")})))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn bad_parameters_are_permanent() {
        let http = HttpCapability::new().unwrap();
        let missing = http.invoke("http", &Map::new()).await.unwrap_err();
        assert!(!missing.is_transient());

        let bad_headers = http
            .invoke(
                "http",
                &params(json!({"url": "http://127.0.0.1:1/", "headers": ["x"]})),
            )
            .await
            .unwrap_err();
        assert!(bad_headers.to_string().contains("'headers' must be an object"));
    }
}
