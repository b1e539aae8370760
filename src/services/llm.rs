//! Text-generation backend for the generation services.
//!
//! [`OllamaClient`] walks an ordered list of models per task. A model that
//! errors or answers with nothing hands over to the next one; an endpoint
//! that refuses the connection ends the walk immediately, since every
//! remaining model lives behind the same endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{LlmSection, ModelsSection};
use crate::errors::StageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTask {
    Story,
    Scenarios,
    Code,
    Healing,
}

impl ModelTask {
    pub const ALL: [ModelTask; 4] = [Self::Story, Self::Scenarios, Self::Code, Self::Healing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Story => "story",
            Self::Scenarios => "scenarios",
            Self::Code => "code",
            Self::Healing => "healing",
        }
    }
}

#[async_trait]
pub trait TextModel: Send + Sync {
    /// Completion text for `prompt`. Fails with
    /// [`StageError::GenerationUnavailable`] when no model could answer.
    async fn complete(&self, task: ModelTask, prompt: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f64,
    top_p: f64,
    top_k: u32,
    num_predict: u32,
    repeat_penalty: f64,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            top_p: 0.95,
            top_k: 40,
            num_predict: 2500,
            repeat_penalty: 1.1,
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

enum ModelFailure {
    Unreachable(String),
    Failed(String),
}

pub struct OllamaClient {
    client: reqwest::Client,
    endpoint: String,
    models: ModelsSection,
}

impl OllamaClient {
    pub fn new(cfg: &LlmSection) -> Result<Self> {
        Self::with_timeout(&cfg.endpoint, cfg.models.clone(), cfg.timeout())
    }

    pub fn with_timeout(endpoint: &str, models: ModelsSection, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build model endpoint HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            models,
        })
    }

    async fn generate(&self, model: &str, prompt: &str) -> Result<String, ModelFailure> {
        let url = format!("{}/api/generate", self.endpoint);
        let body = GenerateRequest {
            model,
            prompt,
            stream: false,
            options: GenerateOptions::default(),
        };

        let resp = self.client.post(&url).json(&body).send().await.map_err(|e| {
            if e.is_connect() {
                ModelFailure::Unreachable(format!("{}: {}", self.endpoint, e))
            } else {
                ModelFailure::Failed(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ModelFailure::Failed(format!("HTTP {}", status)));
        }
        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| ModelFailure::Failed(format!("bad response body: {}", e)))?;

        let text = parsed.response.trim().to_string();
        if text.is_empty() {
            return Err(ModelFailure::Failed("empty response".into()));
        }
        Ok(text)
    }
}

#[async_trait]
impl TextModel for OllamaClient {
    async fn complete(&self, task: ModelTask, prompt: &str) -> Result<String> {
        let candidates = self.models.for_task(task);
        let mut last_error = String::from("no models configured");

        for model in candidates {
            debug!(task = task.as_str(), model = %model, prompt_chars = prompt.len(), "calling model");
            match self.generate(model, prompt).await {
                Ok(text) => {
                    info!(task = task.as_str(), model = %model, chars = text.len(), "model answered");
                    return Ok(text);
                }
                Err(ModelFailure::Unreachable(reason)) => {
                    warn!(task = task.as_str(), %reason, "model endpoint unreachable");
                    return Err(StageError::GenerationUnavailable(format!(
                        "model endpoint unreachable at {}",
                        reason
                    ))
                    .into());
                }
                Err(ModelFailure::Failed(reason)) => {
                    warn!(task = task.as_str(), model = %model, %reason, "model failed, trying next");
                    last_error = format!("{}: {}", model, reason);
                }
            }
        }

        Err(StageError::GenerationUnavailable(format!(
            "all {} models failed ({})",
            task.as_str(),
            last_error
        ))
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn models(names: &[&str]) -> ModelsSection {
        let list: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        ModelsSection {
            story: list.clone(),
            scenarios: list.clone(),
            code: list.clone(),
            healing: list,
        }
    }

    /// Minimal HTTP responder: 404 for `broken`, a canned answer otherwise.
    async fn serve_models(listener: TcpListener) {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let n = socket.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&buf);
                    if let Some(head_end) = text.find("\r\n\r\n") {
                        let length = text[..head_end]
                            .lines()
                            .find_map(|l| {
                                l.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                            })
                            .unwrap_or(0);
                        if buf.len() >= head_end + 4 + length {
                            break;
                        }
                    }
                }
                let request = String::from_utf8_lossy(&buf);
                let response = if request.contains("\"model\":\"broken\"") {
                    "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                        .to_string()
                } else {
                    let body = r#"{"response":"  import pytest\n"}"#;
                    format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    )
                };
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    }

    #[tokio::test]
    async fn test_falls_back_to_next_model() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(serve_models(listener));

        let client = OllamaClient::with_timeout(
            &format!("http://{}/", addr),
            models(&["broken", "good"]),
            Duration::from_secs(5),
        )?;
        let text = client.complete(ModelTask::Code, "write a test").await?;
        assert_eq!(text, "import pytest");
        Ok(())
    }

    #[tokio::test]
    async fn test_all_models_failing_is_generation_unavailable() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(serve_models(listener));

        let client = OllamaClient::with_timeout(
            &format!("http://{}", addr),
            models(&["broken"]),
            Duration::from_secs(5),
        )?;
        let err = client.complete(ModelTask::Story, "tell me").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StageError>(),
            Some(StageError::GenerationUnavailable(msg)) if msg.contains("broken")
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_refused_connection_stops_the_chain() -> Result<()> {
        // Bind then drop to get a port nothing listens on.
        let addr = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
        let client = OllamaClient::with_timeout(
            &format!("http://{}", addr),
            models(&["a", "b", "c"]),
            Duration::from_secs(5),
        )?;
        let err = client.complete(ModelTask::Healing, "fix").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StageError>(),
            Some(StageError::GenerationUnavailable(msg)) if msg.contains("unreachable")
        ));
        Ok(())
    }

    #[test]
    fn test_request_body_shape() -> Result<()> {
        let body = GenerateRequest {
            model: "m",
            prompt: "p",
            stream: false,
            options: GenerateOptions::default(),
        };
        let value = serde_json::to_value(&body)?;
        assert_eq!(value["stream"], false);
        assert_eq!(value["options"]["num_predict"], 2500);
        assert_eq!(value["options"]["top_k"], 40);
        Ok(())
    }
}
