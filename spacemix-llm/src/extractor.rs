//! [`ParamExtractor`] backed by an [`LlmClient`].

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use spacemix_core::query::{ExtractionError, ParamExtractor, ParamSpec};
use tracing::debug;

use crate::client::LlmClient;
use crate::error::LlmError;
use crate::prompt::PromptSet;

impl From<LlmError> for ExtractionError {
    fn from(err: LlmError) -> Self {
        if err.is_malformed_output() {
            Self::Malformed(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

/// Fills query params by prompting a language model.
#[derive(Debug, Clone)]
pub struct LlmParamExtractor {
    client: LlmClient,
    prompts: PromptSet,
}

impl LlmParamExtractor {
    /// Extractor with the built-in prompts.
    #[must_use]
    pub fn new(client: LlmClient) -> Self {
        Self {
            client,
            prompts: PromptSet::builtin(),
        }
    }

    /// Replace the prompts.
    #[must_use]
    pub fn with_prompts(mut self, prompts: PromptSet) -> Self {
        self.prompts = prompts;
        self
    }

    /// The client.
    #[must_use]
    pub fn client(&self) -> &LlmClient {
        &self.client
    }
}

#[async_trait]
impl ParamExtractor for LlmParamExtractor {
    async fn extract(&self, text: &str, params: &[ParamSpec]) -> Result<Map<String, Value>, ExtractionError> {
        let (system, user) = self.prompts.render(text, params, Utc::now());
        let mut request = self.client.request(system, user);
        request.max_tokens = self.prompts.max_tokens;

        let response = self.client.generate(&request).await?;
        debug!(
            model = %response.model,
            latency_ms = response.latency_ms,
            tokens = response.tokens_generated,
            prompt_version = %self.prompts.version,
            "Param extraction answered"
        );
        parse_param_object(&response.text, params)
    }
}

/// Parse model output into a name → value map restricted to `params`.
///
/// Accepts a bare object, an object wrapped in a Markdown code fence, or an
/// object surrounded by prose.
///
/// # Errors
///
/// Returns [`ExtractionError::Malformed`] when no JSON object can be read.
pub fn parse_param_object(raw: &str, params: &[ParamSpec]) -> Result<Map<String, Value>, ExtractionError> {
    let body = strip_code_fences(raw);
    let body = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => &body[start..=end],
        _ => return Err(ExtractionError::Malformed(format!("no JSON object in output: '{raw}'"))),
    };
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ExtractionError::Malformed(format!("JSON parse error: {e}; raw text: '{raw}'")))?;
    let Value::Object(mut map) = value else {
        return Err(ExtractionError::Malformed(format!("expected a JSON object, got '{raw}'")));
    };
    map.retain(|name, _| {
        let declared = params.iter().any(|p| p.name() == name);
        if !declared {
            debug!(name = %name, "Ignoring undeclared param in model output");
        }
        declared
    });
    Ok(map)
}

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}
