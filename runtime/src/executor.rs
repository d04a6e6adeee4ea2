//! Call execution seam for the gateway.
//!
//! The gateway is executor-agnostic: it shapes requests and applies
//! policy, then hands execution to a [`CallExecutor`]. The default
//! [`HttpExecutor`] speaks HTTP via a hardened reqwest client; tests
//! substitute scripted executors.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;

use appdock_types::{AppId, CorrelationId};

/// An outbound request after gateway shaping: correlation id assigned and
/// standard headers injected.
#[derive(Debug, Clone)]
pub struct ShapedRequest {
    pub app_id: AppId,
    pub correlation_id: CorrelationId,
    pub endpoint: String,
    pub method: String,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
}

/// A completed call.
#[derive(Debug, Clone)]
pub struct CallResponse {
    pub status: u16,
    pub body: Value,
    pub bytes: u64,
}

/// A single attempt's failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("HTTP {status}")]
    Status { status: u16 },
    #[error("attempt timed out")]
    Timeout,
}

/// Executes one shaped request. Implementations must be cheap to call
/// concurrently for many apps.
pub trait CallExecutor: Send + Sync {
    fn execute(&self, request: ShapedRequest) -> BoxFuture<'_, Result<CallResponse, CallError>>;
}

/// Default executor: HTTP over a hardened reqwest client, relative
/// endpoints joined onto the configured base URL.
pub struct HttpExecutor {
    client: reqwest::Client,
    base_url: url::Url,
}

impl HttpExecutor {
    pub fn new(base_url: &str, call_timeout: Duration) -> Result<Self, String> {
        let base_url = url::Url::parse(base_url).map_err(|e| format!("invalid base url: {e}"))?;
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self { client, base_url })
    }

    fn url_for(&self, endpoint: &str) -> Result<url::Url, CallError> {
        self.base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| CallError::Transport(format!("bad endpoint '{endpoint}': {e}")))
    }
}

impl CallExecutor for HttpExecutor {
    fn execute(&self, request: ShapedRequest) -> BoxFuture<'_, Result<CallResponse, CallError>> {
        Box::pin(async move {
            let url = self.url_for(&request.endpoint)?;
            let method = reqwest::Method::from_bytes(request.method.as_bytes())
                .map_err(|_| CallError::Transport(format!("bad method '{}'", request.method)))?;

            let mut builder = self.client.request(method, url);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    CallError::Timeout
                } else {
                    CallError::Transport(e.to_string())
                }
            })?;

            let status = response.status();
            if !status.is_success() {
                return Err(CallError::Status {
                    status: status.as_u16(),
                });
            }

            let raw = response
                .bytes()
                .await
                .map_err(|e| CallError::Transport(e.to_string()))?;
            let bytes = raw.len() as u64;
            let body = serde_json::from_slice(&raw)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&raw).into_owned()));

            Ok(CallResponse {
                status: status.as_u16(),
                body,
                bytes,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn shaped(endpoint: &str) -> ShapedRequest {
        let mut headers = BTreeMap::new();
        headers.insert("x-appdock-app".to_string(), "demo".to_string());
        ShapedRequest {
            app_id: AppId::from("demo"),
            correlation_id: CorrelationId::generate(),
            endpoint: endpoint.to_string(),
            method: "GET".to_string(),
            body: None,
            headers,
        }
    }

    #[tokio::test]
    async fn executes_against_base_url_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/data"))
            .and(header_exists("x-appdock-app"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let executor =
            HttpExecutor::new(&server.uri(), Duration::from_secs(5)).expect("executor builds");
        let response = executor
            .execute(shaped("/api/data"))
            .await
            .expect("call succeeds");
        assert_eq!(response.status, 200);
        assert_eq!(response.body["ok"], true);
        assert!(response.bytes > 0);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let executor =
            HttpExecutor::new(&server.uri(), Duration::from_secs(5)).expect("executor builds");
        let error = executor
            .execute(shaped("/api/missing"))
            .await
            .expect_err("404 should error");
        assert!(matches!(error, CallError::Status { status: 404 }));
    }

    #[tokio::test]
    async fn non_json_bodies_come_back_as_strings() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/text"))
            .respond_with(ResponseTemplate::new(200).set_body_string("plain text"))
            .mount(&server)
            .await;

        let executor =
            HttpExecutor::new(&server.uri(), Duration::from_secs(5)).expect("executor builds");
        let response = executor
            .execute(shaped("/api/text"))
            .await
            .expect("call succeeds");
        assert_eq!(response.body, Value::String("plain text".to_string()));
    }
}
