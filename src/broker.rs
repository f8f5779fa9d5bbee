//! Message-broker offload for non-streaming inference calls.
//!
//! The gateway only depends on the [`Broker`] trait: publish a request, wait
//! for the reply within a deadline. [`NatsBroker`] implements it with NATS
//! request/reply, routing on the model family so that workers can subscribe
//! to just the models they serve.

use crate::config::BrokerConfig;
use async_nats::Client;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Errors from the broker path. Never shown to callers: any of these falls
/// back to direct proxying.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to connect to broker at {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("not connected to broker")]
    NotConnected,

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("request to {subject} failed: {reason}")]
    Request { subject: String, reason: String },

    #[error("request to {subject} timed out after {timeout:?}")]
    Timeout { subject: String, timeout: Duration },

    #[error("malformed reply: {0}")]
    Decode(String),

    #[error("worker error: {0}")]
    Worker(String),
}

/// An inference call handed to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub id: String,
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub options: HashMap<String, serde_json::Value>,
    /// 0 = unset, 1-4 low, 5 normal, 6-10 high
    #[serde(default)]
    pub priority: u8,
    pub timestamp: DateTime<Utc>,
}

/// A worker's reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub worker_id: String,
    pub model: String,
    pub response: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Processing time in milliseconds
    #[serde(default)]
    pub duration: u64,
}

impl InferenceRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model: model.into(),
            prompt: prompt.into(),
            stream: false,
            options: HashMap::new(),
            priority: 0,
            timestamp: Utc::now(),
        }
    }
}

/// Alternate dispatch path for inference work.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Whether the broker can currently accept requests.
    fn is_connected(&self) -> bool;

    /// Publish a request and wait up to `timeout` for the worker's reply.
    async fn publish(
        &self,
        request: &InferenceRequest,
        timeout: Duration,
    ) -> Result<InferenceResponse, BrokerError>;
}

/// Model family used as the last subject token.
pub fn model_family(model: &str) -> &'static str {
    let model = model.to_ascii_lowercase();
    if ["llama3", "llama-3"].iter().any(|p| model.contains(p)) {
        "llama3"
    } else if model.contains("mistral") {
        "mistral"
    } else if model.contains("qwen") {
        "qwen"
    } else if model.contains("dolphin") {
        "dolphin"
    } else {
        "default"
    }
}

/// Subject a request is published on. Explicit priorities bypass the model
/// family routing; unset (0) and normal (5) use it.
pub fn subject_for(config: &BrokerConfig, request: &InferenceRequest) -> String {
    match request.priority {
        p if p > 5 => format!("{}.high", config.priority_prefix),
        1..=4 => format!("{}.low", config.priority_prefix),
        _ => format!("{}.{}", config.subject_prefix, model_family(&request.model)),
    }
}

/// NATS request/reply broker.
pub struct NatsBroker {
    client: Client,
    config: BrokerConfig,
}

impl NatsBroker {
    pub async fn connect(config: BrokerConfig) -> Result<Self, BrokerError> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| BrokerError::Connect {
                url: config.url.clone(),
                reason: e.to_string(),
            })?;
        info!(url = %config.url, prefix = %config.subject_prefix, "Connected to NATS");
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Broker for NatsBroker {
    fn is_connected(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }

    async fn publish(
        &self,
        request: &InferenceRequest,
        timeout: Duration,
    ) -> Result<InferenceResponse, BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        let subject = subject_for(&self.config, request);
        let data = serde_json::to_vec(request)?;

        let reply = tokio::time::timeout(timeout, self.client.request(subject.clone(), data.into()))
            .await
            .map_err(|_| BrokerError::Timeout {
                subject: subject.clone(),
                timeout,
            })?
            .map_err(|e| BrokerError::Request {
                subject: subject.clone(),
                reason: e.to_string(),
            })?;

        let response: InferenceResponse = serde_json::from_slice(&reply.payload)
            .map_err(|e| BrokerError::Decode(e.to_string()))?;
        if !response.error.is_empty() {
            return Err(BrokerError::Worker(response.error));
        }

        debug!(subject = %subject, worker = %response.worker_id, "Received broker reply");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BrokerConfig {
        serde_json::from_str(r#"{"url": "nats://localhost:4222"}"#).unwrap()
    }

    #[test]
    fn test_model_family() {
        assert_eq!(model_family("llama3.2:3b"), "llama3");
        assert_eq!(model_family("Meta-Llama-3-8B"), "llama3");
        assert_eq!(model_family("mistral:7b"), "mistral");
        assert_eq!(model_family("qwen2.5-coder"), "qwen");
        assert_eq!(model_family("dolphin-mixtral"), "dolphin");
        assert_eq!(model_family("phi3"), "default");
    }

    #[test]
    fn test_subject_routing_by_priority() {
        let config = config();
        let mut req = InferenceRequest::new("mistral:7b", "hi");
        assert_eq!(subject_for(&config, &req), "llm.inference.mistral");

        req.priority = 5;
        assert_eq!(subject_for(&config, &req), "llm.inference.mistral");

        req.priority = 9;
        assert_eq!(subject_for(&config, &req), "llm.priority.high");

        req.priority = 2;
        assert_eq!(subject_for(&config, &req), "llm.priority.low");
    }

    #[test]
    fn test_response_tolerates_missing_fields() {
        let resp: InferenceResponse =
            serde_json::from_str(r#"{"model": "llama3", "response": "hi"}"#).unwrap();
        assert!(resp.error.is_empty());
        assert_eq!(resp.duration, 0);
        assert!(!resp.done);
    }
}
