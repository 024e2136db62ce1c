//! LLM client: one interface over Ollama and OpenAI-compatible backends.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::{json, Value};
use spacemix_core::config::LlmConfig;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::types::{LlmRequest, LlmResponse};

/// Provider backend for LLM inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmProvider {
    /// Ollama running locally (recommended).
    Ollama {
        /// Server root, e.g. `http://localhost:11434`.
        base_url: String,
    },
    /// OpenAI-compatible API (also works with vLLM, llama.cpp server, Together, etc.).
    OpenAiCompatible {
        /// Server root without the `/v1` suffix.
        base_url: String,
        /// Bearer token.
        api_key: String,
    },
    /// No LLM available; every call fails and queries fall back to defaults.
    None,
}

/// Routes requests to the configured backend.
#[derive(Debug, Clone)]
pub struct LlmClient {
    provider: LlmProvider,
    http: Client,
    model: String,
    max_retries: u32,
    timeout_ms: u64,
    temperature: f32,
}

impl LlmClient {
    /// Create a new LLM client.
    #[must_use]
    pub fn new(provider: LlmProvider, model: impl Into<String>, max_retries: u32) -> Self {
        Self {
            provider,
            http: Client::new(),
            model: model.into(),
            max_retries,
            timeout_ms: 5000,
            temperature: 0.0,
        }
    }

    /// Create a client with no LLM backend.
    #[must_use]
    pub fn none() -> Self {
        Self::new(LlmProvider::None, String::new(), 0)
    }

    /// Build a client from `[llm]`. The OpenAI key is read from the
    /// environment variable named by `api_key_env`.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::ConfigError`] for an unknown provider or a missing
    /// API key.
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let provider = match config.provider.as_str() {
            "ollama" => LlmProvider::Ollama { base_url },
            "openai" => {
                let api_key = std::env::var(&config.api_key_env).map_err(|_| {
                    LlmError::ConfigError(format!("environment variable {} is not set", config.api_key_env))
                })?;
                LlmProvider::OpenAiCompatible { base_url, api_key }
            }
            "none" => LlmProvider::None,
            other => return Err(LlmError::ConfigError(format!("unknown provider '{other}'"))),
        };
        let mut client = Self::new(provider, config.model.clone(), config.max_retries);
        client.timeout_ms = config.request_timeout_ms;
        client.temperature = config.temperature;
        Ok(client)
    }

    /// A JSON-mode request carrying this client's timeout and temperature.
    #[must_use]
    pub fn request(&self, system: impl Into<String>, user: impl Into<String>) -> LlmRequest {
        LlmRequest::new(system, user)
            .with_timeout(self.timeout_ms)
            .with_temperature(self.temperature)
    }

    /// Generate a response from the LLM.
    ///
    /// # Errors
    ///
    /// Returns `Err` if no backend is configured, the response cannot be
    /// parsed, or all retries fail.
    pub async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        match &self.provider {
            LlmProvider::None => Err(LlmError::Unavailable("No LLM provider configured".into())),
            LlmProvider::Ollama { base_url } => self.generate_ollama(base_url, request).await,
            LlmProvider::OpenAiCompatible { base_url, api_key } => {
                self.generate_openai(base_url, api_key, request).await
            }
        }
    }

    /// Generate using Ollama's API.
    async fn generate_ollama(&self, base_url: &str, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let url = format!("{base_url}/api/generate");
        let mut body = json!({
            "model": self.model,
            "system": request.system,
            "prompt": request.user,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            }
        });
        if request.json_mode {
            body["format"] = json!("json");
        }

        let (json, latency_ms) = self.post_with_retries("Ollama", &url, None, &body, request.timeout_ms).await?;
        let text = json["response"]
            .as_str()
            .ok_or_else(|| LlmError::ParseError("Ollama response has no 'response' field".into()))?
            .to_string();
        Ok(LlmResponse {
            text,
            tokens_generated: json["eval_count"].as_u64().map_or(0, saturate),
            latency_ms,
            model: self.model.clone(),
        })
    }

    /// Generate using an OpenAI-compatible chat completions API.
    async fn generate_openai(
        &self,
        base_url: &str,
        api_key: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse, LlmError> {
        let url = format!("{base_url}/v1/chat/completions");
        let mut body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if request.json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let (json, latency_ms) = self
            .post_with_retries("OpenAI API", &url, Some(api_key), &body, request.timeout_ms)
            .await?;
        let text = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmError::ParseError("completion has no message content".into()))?
            .to_string();
        Ok(LlmResponse {
            text,
            tokens_generated: json["usage"]["completion_tokens"].as_u64().map_or(0, saturate),
            latency_ms,
            model: self.model.clone(),
        })
    }

    async fn post_with_retries(
        &self,
        backend: &str,
        url: &str,
        bearer: Option<&str>,
        body: &Value,
        timeout_ms: u64,
    ) -> Result<(Value, u64), LlmError> {
        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                debug!("Retrying {} call (attempt {}/{})", backend, attempt + 1, self.max_retries + 1);
            }

            let start = Instant::now();
            let mut call = self.http.post(url).json(body).timeout(Duration::from_millis(timeout_ms));
            if let Some(key) = bearer {
                call = call.bearer_auth(key);
            }
            let result = call.send().await;
            let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

            match result {
                Ok(resp) if resp.status().is_success() => {
                    let json: Value = resp.json().await.map_err(|e| LlmError::ParseError(e.to_string()))?;
                    return Ok((json, latency_ms));
                }
                Ok(resp) => {
                    last_error = format!("HTTP {}: {}", resp.status(), resp.text().await.unwrap_or_default());
                    warn!("{} returned error: {}", backend, last_error);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if e.is_timeout() {
                        warn!("{} request timed out after {}ms", backend, timeout_ms);
                        if attempt == self.max_retries {
                            return Err(LlmError::Timeout(timeout_ms));
                        }
                    } else if e.is_connect() {
                        warn!("{} unreachable: {}", backend, last_error);
                        if attempt == self.max_retries {
                            return Err(LlmError::Unavailable(last_error));
                        }
                    } else {
                        warn!("{} request failed: {}", backend, last_error);
                    }
                }
            }
        }

        Err(LlmError::RetriesExhausted {
            attempts: self.max_retries + 1,
            last_error,
        })
    }

    /// Check if the LLM client has a backend configured.
    #[must_use]
    pub fn is_available(&self) -> bool {
        !matches!(self.provider, LlmProvider::None)
    }

    /// Backend in use.
    #[must_use]
    pub fn provider(&self) -> &LlmProvider {
        &self.provider
    }

    /// Model name sent with every request.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }
}

fn saturate(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_selects_provider() {
        let config = LlmConfig {
            base_url: "http://localhost:11434/".into(),
            ..LlmConfig::default()
        };
        let client = LlmClient::from_config(&config).expect("ollama");
        assert_eq!(
            client.provider(),
            &LlmProvider::Ollama {
                base_url: "http://localhost:11434".into()
            }
        );
        assert!(client.is_available());

        let none = LlmClient::from_config(&LlmConfig {
            provider: "none".into(),
            ..LlmConfig::default()
        })
        .expect("none");
        assert!(!none.is_available());
    }

    #[test]
    fn from_config_rejects_bad_settings() {
        let unknown = LlmClient::from_config(&LlmConfig {
            provider: "carrier-pigeon".into(),
            ..LlmConfig::default()
        });
        assert!(matches!(unknown, Err(LlmError::ConfigError(_))));

        let missing_key = LlmClient::from_config(&LlmConfig {
            provider: "openai".into(),
            api_key_env: "SPACEMIX_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..LlmConfig::default()
        });
        assert!(matches!(missing_key, Err(LlmError::ConfigError(_))));
    }

    #[test]
    fn request_inherits_client_defaults() {
        let config = LlmConfig {
            request_timeout_ms: 1234,
            temperature: 0.3,
            ..LlmConfig::default()
        };
        let client = LlmClient::from_config(&config).expect("client");
        let request = client.request("sys", "user");
        assert_eq!(request.timeout_ms, 1234);
        assert!((request.temperature - 0.3).abs() < f32::EPSILON);
        assert!(request.json_mode);
    }

    #[tokio::test]
    async fn none_provider_is_unavailable() {
        let result = LlmClient::none().generate(&LlmRequest::new("s", "u")).await;
        assert!(matches!(result, Err(LlmError::Unavailable(_))));
    }

    #[tokio::test]
    async fn unreachable_server_exhausts_retries() {
        let client = LlmClient::new(
            LlmProvider::Ollama {
                base_url: "http://127.0.0.1:9".into(),
            },
            "qwen2.5:1.5b",
            1,
        );
        let result = client.generate(&LlmRequest::new("s", "u").with_timeout(500)).await;
        assert!(matches!(
            result,
            Err(LlmError::Unavailable(_) | LlmError::Timeout(_) | LlmError::RetriesExhausted { .. })
        ));
    }
}
