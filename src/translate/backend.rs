use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::{BatchRequest, TranslationBackend};
use crate::config::TranslateConfig;
use crate::error::{Result, SubweaveError};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    done: bool,
}

/// Ollama `/api/generate`, one non-streaming call per chunk.
pub struct OllamaBackend {
    client: Client,
    endpoint: String,
    model: String,
}

impl OllamaBackend {
    pub fn new(config: &TranslateConfig) -> Result<Self> {
        // the executor enforces the per-call limit; this only stops a hung socket
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.saturating_add(30)))
            .build()
            .map_err(|e| SubweaveError::Backend(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl TranslationBackend for OllamaBackend {
    async fn complete(&self, request: &BatchRequest) -> Result<String> {
        let url = format!("{}/api/generate", self.endpoint);
        debug!("Sending chunk {} ({} rows) to {}", request.chunk, request.rows.len(), url);

        let response = self
            .client
            .post(&url)
            .json(&GenerateRequest {
                model: self.model.clone(),
                prompt: request.prompt.clone(),
                stream: false,
            })
            .send()
            .await
            .map_err(|e| SubweaveError::Backend(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(SubweaveError::Backend(format!("Ollama API error {}: {}", status, error_text)));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| SubweaveError::Backend(format!("Failed to parse response: {}", e)))?;

        if body.response.trim().is_empty() {
            return Err(SubweaveError::Backend("Empty response received".to_string()));
        }
        Ok(body.response)
    }
}

/// External CLI that reads the prompt on stdin and answers on stdout.
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
}

impl CommandBackend {
    pub fn new(config: &TranslateConfig) -> Self {
        Self {
            program: config.command.clone(),
            args: config.args.clone(),
        }
    }
}

#[async_trait]
impl TranslationBackend for CommandBackend {
    async fn complete(&self, request: &BatchRequest) -> Result<String> {
        debug!("Running {} for chunk {}", self.program, request.chunk);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SubweaveError::Backend(format!("Failed to start {}: {}", self.program, e)))?;

        // stdin is fed while stdout is drained
        let writer = child.stdin.take().map(|mut stdin| {
            let prompt = request.prompt.clone().into_bytes();
            let program = self.program.clone();
            tokio::spawn(async move {
                // a child that exits early closes the pipe; its exit status says why
                if let Err(e) = stdin.write_all(&prompt).await {
                    debug!("Writing prompt to {} failed: {}", program, e);
                }
            })
        });

        let output = child.wait_with_output().await?;
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                debug!("Prompt writer for {} did not finish: {}", self.program, e);
            }
        }
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SubweaveError::Backend(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                tail(&format!("{}\n{}", stderr, stdout), 800)
            )));
        }
        if stdout.trim().is_empty() {
            return Err(SubweaveError::Backend(format!("{} produced no output", self.program)));
        }
        Ok(stdout)
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    trimmed.chars().skip(count.saturating_sub(max_chars)).collect()
}

/// Check if Ollama is available and the model is loaded
pub async fn check_ollama_availability(endpoint: &str, model: &str) -> Result<()> {
    let client = Client::new();
    let url = format!("{}/api/show", endpoint.trim_end_matches('/'));

    let response = client
        .post(&url)
        .json(&json!({ "name": model }))
        .send()
        .await
        .map_err(|e| SubweaveError::Backend(format!("Failed to connect to Ollama: {}", e)))?;

    if response.status().is_success() {
        info!("Ollama model '{}' is available", model);
        Ok(())
    } else {
        Err(SubweaveError::Backend(format!(
            "Ollama model '{}' not found. Please pull the model first: ollama pull {}",
            model, model
        )))
    }
}
