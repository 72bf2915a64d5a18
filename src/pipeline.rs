//! Downstream reply pipeline for requests that are not speech commands.
//!
//! The router only needs "request in, reply text out"; the default
//! implementation asks a local Ollama model through /api/generate.

use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;

/// Produces a reply for a user request.
pub trait Pipeline: Send + Sync {
    fn respond(&self, request: &str) -> impl Future<Output = Result<String, PipelineError>> + Send;
}

pub struct OllamaPipeline {
    config: PipelineConfig,
    client: Client,
}

impl OllamaPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self { config, client }
    }
}

impl Pipeline for OllamaPipeline {
    async fn respond(&self, request: &str) -> Result<String, PipelineError> {
        debug!("Sending to Ollama model '{}': {}", self.config.model, request);

        let body = json!({
            "model": self.config.model,
            "prompt": request,
            "system": self.config.system_prompt,
            "stream": false,
        });
        let url = format!("{}/api/generate", self.config.host.trim_end_matches('/'));

        let resp = self.client.post(&url).json(&body).send().await.map_err(|e| {
            if e.is_connect() {
                warn!("Cannot connect to Ollama at {}", self.config.host);
                PipelineError::Unreachable(format!("cannot connect to {}", self.config.host))
            } else if e.is_timeout() {
                warn!("Ollama request timed out");
                PipelineError::Unreachable("request timed out".into())
            } else {
                warn!("Ollama request failed: {e}");
                PipelineError::Unreachable(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            warn!("Ollama returned status {}", resp.status());
            return Err(PipelineError::Status(resp.status().as_u16()));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| PipelineError::Malformed(e.to_string()))?;
        let reply = data["response"]
            .as_str()
            .ok_or_else(|| PipelineError::Malformed("missing 'response' field".into()))?
            .trim()
            .to_string();
        if reply.is_empty() {
            return Err(PipelineError::Empty);
        }
        debug!("Ollama reply: '{reply}'");
        Ok(reply)
    }
}

/// Replies with the request itself. Used when no model is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoPipeline;

impl Pipeline for EchoPipeline {
    async fn respond(&self, request: &str) -> Result<String, PipelineError> {
        let reply = request.trim();
        if reply.is_empty() {
            return Err(PipelineError::Empty);
        }
        Ok(reply.to_string())
    }
}

#[cfg(test)]
mod tests {
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;

    use super::*;

    async fn fake_ollama(reply: Value, status: u16) -> String {
        let app = Router::new().route(
            "/api/generate",
            post(move |Json(body): Json<Value>| {
                let reply = reply.clone();
                async move {
                    assert_eq!(body["stream"], false);
                    (axum::http::StatusCode::from_u16(status).unwrap(), Json(reply))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn pipeline(host: String) -> OllamaPipeline {
        OllamaPipeline::new(PipelineConfig {
            host,
            timeout_secs: 5,
            ..PipelineConfig::default()
        })
    }

    #[tokio::test]
    async fn returns_trimmed_reply() {
        let host = fake_ollama(json!({"response": "  It is sunny.\n"}), 200).await;
        assert_eq!(pipeline(host).respond("weather?").await.unwrap(), "It is sunny.");
    }

    #[tokio::test]
    async fn maps_failures() {
        let host = fake_ollama(json!({"error": "model not found"}), 404).await;
        assert!(matches!(pipeline(host).respond("hi").await, Err(PipelineError::Status(404))));

        let host = fake_ollama(json!({"done": true}), 200).await;
        assert!(matches!(pipeline(host).respond("hi").await, Err(PipelineError::Malformed(_))));

        let host = fake_ollama(json!({"response": "   "}), 200).await;
        assert!(matches!(pipeline(host).respond("hi").await, Err(PipelineError::Empty)));
    }

    #[tokio::test]
    async fn unreachable_host() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = pipeline(format!("http://{addr}")).respond("hi").await;
        assert!(matches!(result, Err(PipelineError::Unreachable(_))));
    }

    #[tokio::test]
    async fn echo() {
        assert_eq!(EchoPipeline.respond(" hello ").await.unwrap(), "hello");
        assert!(EchoPipeline.respond("").await.is_err());
    }
}
