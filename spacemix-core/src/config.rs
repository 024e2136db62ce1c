//! Configuration for spacemix.
//!
//! Maps directly to `spacemix.toml`. Every field has a serde default, so an
//! empty file is a valid configuration.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SpacemixError};

/// Top-level configuration, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SpacemixConfig {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,
    /// Logging and PII exposure.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Event decay and blending.
    #[serde(default)]
    pub events: EventsConfig,
    /// Query limits and natural-language resolution.
    #[serde(default)]
    pub query: QueryConfig,
    /// Vector store backend.
    #[serde(default)]
    pub store: StoreConfig,
    /// Encoder caching.
    #[serde(default)]
    pub encoders: EncodersConfig,
    /// LLM used for natural-language parameter extraction.
    #[serde(default)]
    pub llm: LlmConfig,
}

impl SpacemixConfig {
    /// Load configuration from a TOML string and validate it.
    ///
    /// # Errors
    /// Returns `SpacemixError::Config` if the TOML is invalid or a value is
    /// out of range.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| SpacemixError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Reject values that would make the engine misbehave.
    ///
    /// # Errors
    /// Returns `SpacemixError::Config` naming the offending key.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(SpacemixError::Config(msg.to_string()));

        if !self.events.half_life_secs.is_finite() || self.events.half_life_secs <= 0.0 {
            return fail("events.half_life_secs must be positive");
        }
        if !self.events.base_weight.is_finite() || self.events.base_weight <= 0.0 {
            return fail("events.base_weight must be positive");
        }
        if self.query.default_limit == 0 || self.query.max_limit == 0 {
            return fail("query limits must be at least 1");
        }
        if self.query.default_limit > self.query.max_limit {
            return fail("query.default_limit exceeds query.max_limit");
        }
        if !matches!(self.llm.provider.as_str(), "ollama" | "openai" | "none") {
            return fail("llm.provider must be one of: ollama, openai, none");
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return fail("llm.temperature must be within [0, 2]");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// General system settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error. `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Logging and PII exposure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub json_logs: bool,
    /// Log field values and natural-language query text verbatim.
    #[serde(default)]
    pub expose_pii: bool,
    /// Log any query exceeding this threshold (ms) at `warn`.
    #[serde(default = "default_slow_query_ms")]
    pub log_slow_queries_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json_logs: false,
            expose_pii: false,
            log_slow_queries_ms: default_slow_query_ms(),
        }
    }
}

/// Event decay and blending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Half-life of an event's influence, in seconds.
    #[serde(default = "default_half_life")]
    pub half_life_secs: f64,
    /// Weight of the ingested vector against accumulated event influence.
    #[serde(default = "default_1_0")]
    pub base_weight: f64,
    /// Fixed decay reference time; engine construction time when absent.
    #[serde(default)]
    pub reference_time: Option<DateTime<Utc>>,
}

impl EventsConfig {
    /// Half-life as a duration.
    #[must_use]
    pub fn half_life(&self) -> Duration {
        Duration::milliseconds((self.half_life_secs * 1000.0) as i64)
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            half_life_secs: default_half_life(),
            base_weight: 1.0,
            reference_time: None,
        }
    }
}

/// Query limits and natural-language resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Limit used when a query does not set one.
    #[serde(default = "default_10")]
    pub default_limit: usize,
    /// Largest accepted limit.
    #[serde(default = "default_1000")]
    pub max_limit: usize,
    /// Deadline for natural-language parameter extraction (ms).
    #[serde(default = "default_5000")]
    pub natural_query_timeout_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_limit: 1000,
            natural_query_timeout_ms: 5000,
        }
    }
}

/// Vector store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store.
    #[default]
    Memory,
    /// SQLite database file.
    Sqlite,
}

/// Vector store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend: `memory` or `sqlite`.
    #[serde(default)]
    pub backend: StoreBackend,
    /// Database path for the SQLite backend.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Enable SQLite WAL mode.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
    /// Replace a stored layout that differs from the declared index,
    /// dropping every stored vector.
    #[serde(default)]
    pub override_existing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: default_store_path(),
            wal_mode: true,
            override_existing: false,
        }
    }
}

/// Encoder caching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodersConfig {
    /// LRU entries per cached encoder (0 disables caching).
    #[serde(default = "default_1024")]
    pub cache_capacity: usize,
}

impl Default for EncodersConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_1024(),
        }
    }
}

/// LLM integration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider: "ollama", "openai", "none".
    #[serde(default = "default_ollama")]
    pub provider: String,
    /// Base URL for the LLM API.
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    /// Model name.
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable holding the API key (OpenAI-compatible only).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Hard timeout for any LLM call in milliseconds.
    #[serde(default = "default_5000")]
    pub request_timeout_ms: u64,
    /// Max retries after the first failed attempt.
    #[serde(default = "default_2")]
    pub max_retries: u32,
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_ollama(),
            base_url: default_ollama_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            request_timeout_ms: 5000,
            max_retries: 2,
            temperature: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Serde default helpers
// ---------------------------------------------------------------------------

fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_ollama() -> String { "ollama".to_string() }
fn default_ollama_url() -> String { "http://localhost:11434".to_string() }
fn default_model() -> String { "qwen2.5:1.5b".to_string() }
fn default_api_key_env() -> String { "OPENAI_API_KEY".to_string() }
fn default_store_path() -> PathBuf { PathBuf::from("spacemix.db") }
fn default_1_0() -> f64 { 1.0 }
fn default_half_life() -> f64 { 7.0 * 86_400.0 }
fn default_2() -> u32 { 2 }
fn default_10() -> usize { 10 }
fn default_1000() -> usize { 1000 }
fn default_1024() -> usize { 1024 }
fn default_slow_query_ms() -> u64 { 250 }
fn default_5000() -> u64 { 5000 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_default() {
        let c = SpacemixConfig::from_toml("").expect("valid");
        assert_eq!(c.query.default_limit, 10);
        assert_eq!(c.store.backend, StoreBackend::Memory);
        assert!(!c.telemetry.expose_pii);
        assert_eq!(c.events.half_life(), Duration::days(7));
    }

    #[test]
    fn parses_sections() {
        let c = SpacemixConfig::from_toml(
            r#"
            [general]
            log_level = "debug"

            [telemetry]
            json_logs = true
            expose_pii = true

            [events]
            half_life_secs = 3600
            reference_time = "2024-06-01T00:00:00Z"

            [store]
            backend = "sqlite"
            path = "/tmp/v.db"

            [llm]
            provider = "openai"
            model = "gpt-4o-mini"
            "#,
        )
        .expect("valid");
        assert_eq!(c.general.log_level, "debug");
        assert!(c.telemetry.json_logs && c.telemetry.expose_pii);
        assert_eq!(c.events.half_life(), Duration::hours(1));
        assert!(c.events.reference_time.is_some());
        assert_eq!(c.store.backend, StoreBackend::Sqlite);
        assert_eq!(c.llm.provider, "openai");
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(SpacemixConfig::from_toml("[events]\nhalf_life_secs = 0").is_err());
        assert!(SpacemixConfig::from_toml("[query]\nmax_limit = 0").is_err());
        assert!(SpacemixConfig::from_toml("[query]\ndefault_limit = 50\nmax_limit = 5").is_err());
        assert!(SpacemixConfig::from_toml("[llm]\nprovider = \"carrier-pigeon\"").is_err());
        assert!(SpacemixConfig::from_toml("[store]\nbackend = \"redis\"").is_err());
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("spacemix.toml");
        std::fs::write(&path, "[query]\ndefault_limit = 3\n").expect("write");
        let c = SpacemixConfig::from_file(&path).expect("valid");
        assert_eq!(c.query.default_limit, 3);
    }
}
