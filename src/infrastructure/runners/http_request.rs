//! HTTP request runner

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::domain::flow::{
    ExecutionContext, FlowError, NodeError, NodeInvocation, NodeRunner, NodeType, VertexResult,
    stringify,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Issues one HTTP request per visit
///
/// Params: `url` (required), `method` (default GET), `headers` object,
/// `body` (strings are sent raw, anything else as JSON) and `timeout_ms`.
/// Output is `{status, headers, body}`; a JSON response body is parsed.
/// 4xx responses fail the node; 5xx, timeouts and connection errors fail it
/// as retryable.
#[derive(Debug, Clone)]
pub struct HttpRequestRunner {
    client: Client,
    default_timeout: Duration,
}

impl HttpRequestRunner {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

impl Default for HttpRequestRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_method(method: Option<&str>) -> Result<Method, String> {
    let method = method.unwrap_or("GET").to_uppercase();
    Method::from_bytes(method.as_bytes()).map_err(|_| format!("Invalid HTTP method '{}'", method))
}

#[async_trait]
impl NodeRunner for HttpRequestRunner {
    fn node_type(&self) -> NodeType {
        NodeType::HttpRequest
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["url"]
    }

    async fn execute(
        &self,
        invocation: NodeInvocation<'_>,
        result: &mut VertexResult,
        _ctx: &mut ExecutionContext,
    ) -> Result<(), FlowError> {
        let Some(url) = invocation.param_str("url") else {
            result.fail(NodeError::new("Param 'url' must be a string"));
            return Ok(());
        };
        let method = match parse_method(invocation.param_str("method")) {
            Ok(method) => method,
            Err(message) => {
                result.fail(NodeError::new(message));
                return Ok(());
            }
        };
        let timeout = invocation
            .param("timeout_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let mut request = self.client.request(method.clone(), url).timeout(timeout);

        if let Some(Value::Object(headers)) = invocation.param("headers") {
            for (name, value) in headers {
                request = request.header(name.as_str(), stringify(value));
            }
        }

        match invocation.param("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(body)) => request = request.body(body.clone()),
            Some(body) => request = request.json(body),
        }

        result.log(format!("{} {}", method, url));
        debug!(
            execute_id = %invocation.execute_id,
            node_id = %invocation.node.id(),
            method = %method,
            url = %url,
            "Sending HTTP request"
        );

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let message = if e.is_timeout() {
                    format!("Request to {} timed out", url)
                } else if e.is_connect() {
                    format!("Connection to {} failed", url)
                } else {
                    format!("Request failed: {}", e)
                };
                warn!(node_id = %invocation.node.id(), error = %message, "HTTP request failed");

                let error = if e.is_timeout() || e.is_connect() {
                    NodeError::transient(message)
                } else {
                    NodeError::new(message)
                };
                result.fail(error);
                return Ok(());
            }
        };

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), Value::String(v.to_string())))
            })
            .collect();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                result.fail(NodeError::transient(format!("Failed to read response body: {}", e)));
                return Ok(());
            }
        };
        let body = match serde_json::from_str::<Value>(&text) {
            Ok(parsed) => parsed,
            Err(_) => Value::String(text),
        };

        result.log(format!("status {}", status.as_u16()));
        result.output = json!({
            "status": status.as_u16(),
            "headers": headers,
            "body": body,
        });

        if status.is_success() {
            result.success = true;
        } else if status.is_server_error() {
            result.fail(NodeError::transient(format!("HTTP status {}", status)));
        } else {
            result.fail(NodeError::new(format!("HTTP status {}", status)));
        }

        Ok(())
    }
}
