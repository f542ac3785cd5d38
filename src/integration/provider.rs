// Integration providers
//
// A provider performs the external side effect for one integration type.
// Providers are invoked without any engine lock held and may be slow; the
// dispatcher bounds every call with the policy's attempt timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use super::types::{IntegrationRequest, IntegrationType, ProviderResponse};

/// Failure reported by a provider call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Provider processed the request and refused it
    #[error("Provider rejected request: {0}")]
    Rejected(String),

    /// Request never produced a usable reply
    #[error("Provider transport error: {0}")]
    Transport(String),
}

/// External system that executes integration steps
#[async_trait]
pub trait IntegrationProvider: Send + Sync {
    /// Integration type this provider serves
    fn integration_type(&self) -> IntegrationType;

    /// Perform one attempt
    async fn invoke(&self, request: &IntegrationRequest) -> Result<ProviderResponse, ProviderError>;
}

/// Providers keyed by integration type
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<IntegrationType, Arc<dyn IntegrationProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any existing one for the same type
    pub fn register(&mut self, provider: Arc<dyn IntegrationProvider>) {
        tracing::debug!("Registered provider for {}", provider.integration_type());
        self.providers.insert(provider.integration_type(), provider);
    }

    /// Builder form of `register`
    pub fn with(mut self, provider: Arc<dyn IntegrationProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, integration_type: IntegrationType) -> Option<Arc<dyn IntegrationProvider>> {
        self.providers.get(&integration_type).cloned()
    }

    /// Registered types, sorted
    pub fn types(&self) -> Vec<IntegrationType> {
        let mut types: Vec<IntegrationType> = self.providers.keys().copied().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("types", &self.types())
            .finish()
    }
}

/// Wire body sent to an HTTP provider
#[derive(Debug, Serialize)]
struct HttpRequestBody<'a> {
    integration_id: String,
    workflow_id: String,
    step_id: String,
    integration_type: IntegrationType,
    attempt: u32,
    payload: &'a serde_json::Value,
}

/// Wire body returned by an HTTP provider
#[derive(Debug, Deserialize)]
struct HttpResponseBody {
    success: bool,
    #[serde(default)]
    external_id: Option<String>,
    #[serde(default)]
    response: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
}

/// Provider reached over HTTP with a JSON POST
#[derive(Debug, Clone)]
pub struct HttpProvider {
    integration_type: IntegrationType,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(integration_type: IntegrationType, endpoint: impl Into<String>) -> Self {
        Self {
            integration_type,
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl IntegrationProvider for HttpProvider {
    fn integration_type(&self) -> IntegrationType {
        self.integration_type
    }

    async fn invoke(&self, request: &IntegrationRequest) -> Result<ProviderResponse, ProviderError> {
        let body = HttpRequestBody {
            integration_id: request.integration_id.to_string(),
            workflow_id: request.workflow_id.to_string(),
            step_id: request.step_id.to_string(),
            integration_type: request.integration_type,
            attempt: request.attempt,
            payload: &request.payload,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ProviderError::Transport(format!(
                "{} returned {}",
                self.endpoint, status
            )));
        }

        let reply: HttpResponseBody = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(format!("Malformed provider reply: {}", e)))?;

        if reply.success && status.is_success() {
            Ok(ProviderResponse {
                external_id: reply.external_id,
                payload: reply.response,
            })
        } else {
            Err(ProviderError::Rejected(
                reply
                    .error
                    .unwrap_or_else(|| format!("{} returned {}", self.endpoint, status)),
            ))
        }
    }
}

/// Scripted reply for a simulated provider
#[derive(Debug, Clone, PartialEq)]
pub enum SimulatedReply {
    /// Succeed with a generated external id
    Succeed,
    /// Fail with the given message
    Fail(String),
    /// Never reply; the attempt runs into its timeout
    Hang,
}

/// In-process provider driven by a reply script
///
/// Replies are consumed in order; once the script is empty every call
/// succeeds. Used by the CLI demo and the test suites.
#[derive(Debug)]
pub struct SimulatedProvider {
    integration_type: IntegrationType,
    latency: Duration,
    script: Mutex<VecDeque<SimulatedReply>>,
    requests: Mutex<Vec<IntegrationRequest>>,
    calls: AtomicU32,
}

impl SimulatedProvider {
    pub fn new(integration_type: IntegrationType) -> Self {
        Self {
            integration_type,
            latency: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        }
    }

    /// Provider that fails the first `times` calls
    pub fn always_failing(integration_type: IntegrationType, times: usize) -> Self {
        Self::new(integration_type)
            .with_script(std::iter::repeat(SimulatedReply::Fail("simulated outage".to_string())).take(times))
    }

    /// Delay applied to every reply
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue replies ahead of the default success
    pub fn with_script(self, replies: impl IntoIterator<Item = SimulatedReply>) -> Self {
        let script = replies.into_iter().collect();
        Self {
            script: Mutex::new(script),
            ..self
        }
    }

    /// Append a reply to the script
    pub async fn push_reply(&self, reply: SimulatedReply) {
        self.script.lock().await.push_back(reply);
    }

    /// Number of calls received
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received, in order
    pub async fn requests(&self) -> Vec<IntegrationRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl IntegrationProvider for SimulatedProvider {
    fn integration_type(&self) -> IntegrationType {
        self.integration_type
    }

    async fn invoke(&self, request: &IntegrationRequest) -> Result<ProviderResponse, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().await.push(request.clone());
        let reply = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or(SimulatedReply::Succeed);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match reply {
            SimulatedReply::Succeed => Ok(ProviderResponse {
                external_id: Some(format!("{}-{}-{}", self.integration_type, request.step_id.simple(), call)),
                payload: serde_json::json!({ "attempt": request.attempt }),
            }),
            SimulatedReply::Fail(message) => Err(ProviderError::Rejected(message)),
            SimulatedReply::Hang => {
                std::future::pending::<()>().await;
                Err(ProviderError::Transport("unreachable".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn request(attempt: u32) -> IntegrationRequest {
        IntegrationRequest {
            integration_id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            step_id: Uuid::new_v4(),
            integration_type: IntegrationType::Docusign,
            payload: serde_json::json!({"envelope": "offer"}),
            attempt,
        }
    }

    #[tokio::test]
    async fn test_simulated_provider_follows_script() {
        let provider = SimulatedProvider::new(IntegrationType::Docusign)
            .with_script([SimulatedReply::Fail("busy".to_string())]);

        let first = provider.invoke(&request(1)).await;
        assert_eq!(first, Err(ProviderError::Rejected("busy".to_string())));

        let second = provider.invoke(&request(2)).await.unwrap();
        assert!(second.external_id.unwrap().starts_with("docusign-"));
        assert_eq!(second.payload["attempt"], 2);
        assert_eq!(provider.calls(), 2);
        assert_eq!(provider.requests().await.len(), 2);
    }

    #[tokio::test]
    async fn test_hanging_reply_never_resolves() {
        let provider = SimulatedProvider::new(IntegrationType::DocSearch)
            .with_script([SimulatedReply::Hang]);
        let result =
            tokio::time::timeout(Duration::from_millis(20), provider.invoke(&request(1))).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ProviderRegistry::new()
            .with(Arc::new(SimulatedProvider::new(IntegrationType::BackgroundCheck)))
            .with(Arc::new(HttpProvider::new(
                IntegrationType::Docusign,
                "http://localhost:9000/docusign",
            )));

        assert_eq!(
            registry.types(),
            vec![IntegrationType::Docusign, IntegrationType::BackgroundCheck]
        );
        assert!(registry.get(IntegrationType::DocSearch).is_none());
        assert_eq!(
            registry.get(IntegrationType::Docusign).unwrap().integration_type(),
            IntegrationType::Docusign
        );
    }
}
