//! Endpoints - message sinks behind each executor
//!
//! An endpoint makes one delivery attempt per call and classifies the result;
//! retry, backoff and checkpointing belong to the executor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eh_common::{system_properties, EndpointKind, EndpointSpec, Message};
use tracing::{debug, warn};

use crate::{Result, RouterError};

/// Outcome of a single delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted by the sink
    Delivered,
    /// Permanently refused (e.g. HTTP 400); retrying the same message will not help
    Rejected { reason: String },
    /// Transient failure; the executor retries with backoff
    Failed { reason: String },
}

#[async_trait]
pub trait Endpoint: Send + Sync {
    fn id(&self) -> &str;

    async fn send(&self, message: &Message) -> SendOutcome;
}

/// Builds endpoints for the ids a route table references
pub trait EndpointFactory: Send + Sync {
    /// `spec` is the configured definition for `id`, if the configuration has one
    fn create(&self, id: &str, spec: Option<&EndpointSpec>) -> Result<Arc<dyn Endpoint>>;
}

// ============================================================================
// Null Endpoint
// ============================================================================

/// Accepts and discards every message
pub struct NullEndpoint {
    id: String,
}

impl NullEndpoint {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl Endpoint for NullEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, message: &Message) -> SendOutcome {
        debug!(endpoint_id = %self.id, offset = message.offset(), "Discarding message");
        SendOutcome::Delivered
    }
}

// ============================================================================
// HTTP Endpoint
// ============================================================================

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// POSTs each message body to a URL
pub struct HttpEndpoint {
    id: String,
    url: String,
    headers: BTreeMap<String, String>,
    client: reqwest::Client,
}

impl HttpEndpoint {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        headers: BTreeMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .map_err(|e| RouterError::endpoint(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            id: id.into(),
            url: url.into(),
            headers,
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// 4xx responses other than timeout and throttling will not succeed on retry
fn is_permanent_rejection(status: reqwest::StatusCode) -> bool {
    status.is_client_error() && !matches!(status.as_u16(), 408 | 429)
}

#[async_trait]
impl Endpoint for HttpEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, message: &Message) -> SendOutcome {
        let content_type = message
            .system_properties()
            .get(system_properties::CONTENT_TYPE)
            .unwrap_or(DEFAULT_CONTENT_TYPE);

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", content_type)
            .header("X-EdgeHub-Source", message.source().path())
            .header("X-EdgeHub-Offset", message.offset().to_string())
            .body(message.body().clone());

        if let Some(message_id) = message.message_id() {
            request = request.header("X-EdgeHub-Message-Id", message_id);
        }
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    debug!(endpoint_id = %self.id, status = %status, "Message delivered");
                    return SendOutcome::Delivered;
                }

                let body = response.text().await.unwrap_or_default();
                let reason = format!("HTTP {}: {}", status, body);
                if is_permanent_rejection(status) {
                    warn!(endpoint_id = %self.id, status = %status, "Endpoint rejected message");
                    SendOutcome::Rejected { reason }
                } else {
                    SendOutcome::Failed { reason }
                }
            }
            Err(e) => SendOutcome::Failed {
                reason: format!("HTTP request failed: {}", e),
            },
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Builds endpoints from their configured definitions
#[derive(Debug, Default)]
pub struct SpecEndpointFactory;

impl SpecEndpointFactory {
    pub fn new() -> Self {
        Self
    }
}

impl EndpointFactory for SpecEndpointFactory {
    fn create(&self, id: &str, spec: Option<&EndpointSpec>) -> Result<Arc<dyn Endpoint>> {
        let spec = spec.ok_or_else(|| RouterError::UnknownEndpoint(id.to_string()))?;
        match &spec.kind {
            EndpointKind::Http {
                url,
                headers,
                timeout_ms,
            } => {
                let endpoint = HttpEndpoint::new(
                    id,
                    url.clone(),
                    headers.clone(),
                    timeout_ms.map(Duration::from_millis),
                )?;
                Ok(Arc::new(endpoint))
            }
            EndpointKind::Null => Ok(Arc::new(NullEndpoint::new(id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eh_common::MessageSource;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_message() -> Message {
        Message::builder(MessageSource::TELEMETRY, "{\"temp\":31}")
            .system_property(system_properties::CONTENT_TYPE, "application/json")
            .system_property(system_properties::MESSAGE_ID, "msg-1")
            .offset(7)
            .build()
    }

    fn http_endpoint(server: &MockServer) -> HttpEndpoint {
        HttpEndpoint::new("upstream", format!("{}/ingest", server.uri()), BTreeMap::new(), None).unwrap()
    }

    #[tokio::test]
    async fn test_http_delivers_body_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .and(header("Content-Type", "application/json"))
            .and(header("X-EdgeHub-Message-Id", "msg-1"))
            .and(header("X-EdgeHub-Offset", "7"))
            .and(body_string("{\"temp\":31}"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = http_endpoint(&server).send(&create_test_message()).await;
        assert_eq!(outcome, SendOutcome::Delivered);
    }

    #[tokio::test]
    async fn test_http_classifies_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad payload"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let endpoint = http_endpoint(&server);
        let message = create_test_message();

        match endpoint.send(&message).await {
            SendOutcome::Rejected { reason } => assert!(reason.contains("bad payload")),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(matches!(endpoint.send(&message).await, SendOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_http_unreachable_is_transient() {
        let endpoint = HttpEndpoint::new(
            "down",
            "http://127.0.0.1:1/ingest",
            BTreeMap::new(),
            Some(Duration::from_millis(500)),
        )
        .unwrap();
        assert!(matches!(
            endpoint.send(&create_test_message()).await,
            SendOutcome::Failed { .. }
        ));
    }

    #[test]
    fn test_factory_requires_definition() {
        let factory = SpecEndpointFactory::new();
        assert!(matches!(
            factory.create("missing", None),
            Err(RouterError::UnknownEndpoint(id)) if id == "missing"
        ));

        let spec = EndpointSpec {
            id: "sink".to_string(),
            kind: EndpointKind::Null,
        };
        assert_eq!(factory.create("sink", Some(&spec)).unwrap().id(), "sink");
    }

    #[test]
    fn test_rejection_classification() {
        assert!(is_permanent_rejection(reqwest::StatusCode::BAD_REQUEST));
        assert!(!is_permanent_rejection(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_permanent_rejection(reqwest::StatusCode::BAD_GATEWAY));
    }
}
