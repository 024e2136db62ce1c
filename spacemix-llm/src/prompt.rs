//! Prompt templates for natural-language parameter extraction.
//!
//! Every prompt is a versioned, testable artifact. The built-in templates
//! can be replaced by a TOML file without recompiling.

use std::fmt::Write as _;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use spacemix_core::query::ParamSpec;

use crate::error::LlmError;

/// System prompt: role, rules and output contract.
pub const PARAM_EXTRACTION_SYSTEM: &str = r"You are a search assistant that translates a user's request into the parameters of a vector search query.

RULES:
- Only fill the parameters listed by the user message. Never invent new parameter names.
- Use null for any parameter the request says nothing about.
- Weights are floats. Positive means the aspect should matter (larger is stronger), negative means the opposite is preferred, 0 means ignore it.
- Respect each parameter's type and allowed range.
- Timestamps are RFC 3339 strings; resolve relative dates against today's date.
- Categories are a JSON array of strings.
- Your response must be a single valid JSON object and nothing else.";

/// User prompt: declared params and the request text.
pub const PARAM_EXTRACTION_USER: &str = r#"Today is {today}.

Parameters:
{params_formatted}

User request: "{query}"

Return a JSON object mapping every parameter name above to its value or null, for example:
{"param_name": value_or_null}"#;

/// Simple template interpolation for prompts.
///
/// Replaces `{key}` with the corresponding value.
#[must_use]
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        result = result.replace(&format!("{{{key}}}"), value);
    }
    result
}

/// One bullet per param: name, type, description, usage, range, default and
/// the space annotation when there is one.
#[must_use]
pub fn format_param_specs(specs: &[ParamSpec]) -> String {
    let mut out = String::new();
    for spec in specs {
        let _ = write!(out, "- {} ({})", spec.name(), spec.param_type);
        if let Some(description) = &spec.param.description {
            let _ = write!(out, ": {description}");
        }
        let _ = write!(out, ". Used as {}.", spec.usage);
        if let Some((min, max)) = spec.param.range {
            let _ = write!(out, " Range [{min}, {max}].");
        }
        if let Some(default) = &spec.param.default {
            let _ = write!(out, " Default {default}.");
        }
        if let Some(hint) = &spec.hint {
            let _ = write!(out, " Note: {hint}");
        }
        out.push('\n');
    }
    out.truncate(out.trim_end().len());
    out
}

/// A pair of templates plus generation settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PromptSet {
    /// Template version, recorded in logs.
    pub version: String,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// System template.
    pub system: String,
    /// User template; `{today}`, `{params_formatted}` and `{query}` are filled in.
    pub user: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self::builtin()
    }
}

#[derive(Deserialize)]
struct TomlPromptFile {
    prompt: PromptSet,
}

impl PromptSet {
    /// The compiled-in templates.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            version: "builtin".into(),
            max_tokens: 256,
            system: PARAM_EXTRACTION_SYSTEM.into(),
            user: PARAM_EXTRACTION_USER.into(),
        }
    }

    /// Parse a `[prompt]` table. Missing keys keep their built-in value.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::ConfigError`] if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, LlmError> {
        let parsed: TomlPromptFile =
            toml::from_str(content).map_err(|e| LlmError::ConfigError(format!("invalid prompt file: {e}")))?;
        Ok(parsed.prompt)
    }

    /// Load a `[prompt]` table from disk.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::ConfigError`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LlmError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| LlmError::ConfigError(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Render `(system, user)` for one request.
    #[must_use]
    pub fn render(&self, query: &str, specs: &[ParamSpec], today: DateTime<Utc>) -> (String, String) {
        let params_formatted = format_param_specs(specs);
        let today = today.format("%Y-%m-%d").to_string();
        let vars = [
            ("today", today.as_str()),
            ("params_formatted", params_formatted.as_str()),
            ("query", query),
        ];
        (render_template(&self.system, &vars), render_template(&self.user, &vars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spacemix_core::query::{Param, ParamType};

    fn spec(param: Param, param_type: ParamType, usage: &str) -> ParamSpec {
        ParamSpec {
            param,
            param_type,
            usage: usage.into(),
            hint: None,
        }
    }

    #[test]
    fn template_rendering_works() {
        let rendered = render_template("Find {what} from {when}.", &[("what", "shoes"), ("when", "2024")]);
        assert_eq!(rendered, "Find shoes from 2024.");
    }

    #[test]
    fn template_handles_missing_vars() {
        let rendered = render_template("Find {what}, {unknown}.", &[("what", "shoes")]);
        assert_eq!(rendered, "Find shoes, {unknown}.");
    }

    #[test]
    fn specs_are_formatted_one_per_line() {
        let specs = vec![
            spec(
                Param::new("price_weight").description("how much cheapness matters").range(-1.0, 1.0),
                ParamType::Float,
                "weight of space 'price'",
            ),
            spec(Param::new("brand").default("acme"), ParamType::String, "filter on 'brand'"),
        ];
        let text = format_param_specs(&specs);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "- price_weight (float): how much cheapness matters. Used as weight of space 'price'. Range [-1, 1]."
        );
        assert_eq!(lines[1], "- brand (string). Used as filter on 'brand'. Default \"acme\".");
    }

    #[test]
    fn partial_toml_keeps_builtin_values() {
        let set = PromptSet::from_toml(
            r#"
            [prompt]
            version = "2"
            system = "Be brief."
            "#,
        )
        .expect("valid");
        assert_eq!(set.version, "2");
        assert_eq!(set.system, "Be brief.");
        assert_eq!(set.user, PARAM_EXTRACTION_USER);
        assert_eq!(set.max_tokens, 256);
    }

    #[test]
    fn from_file_reports_missing_file() {
        let result = PromptSet::from_file("/nonexistent/spacemix/prompt.toml");
        assert!(matches!(result, Err(LlmError::ConfigError(_))));
    }
}
