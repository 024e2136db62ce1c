//! # spacemix-llm: natural-language parameters for spacemix queries
//!
//! Turns a free-text request ("cheap running shoes from last month") into
//! values for the params a query template declares. Backends:
//!   - **Ollama** (local, recommended default)
//!   - **OpenAI-compatible API** (vLLM, llama.cpp server, hosted APIs)
//!
//! Every call goes through this crate, ensuring:
//!   - JSON output mode on both backends
//!   - Timeout management
//!   - Bounded retries
//!   - A typed failure the resolver can fall back on
//!
//! # Flow
//!
//! ```text
//! QueryTemplate params ──► prompt::format_param_specs ──► LlmClient
//!                                                            │
//! Resolver ◄── validated values ◄── parse_param_object ◄─────┘
//! ```

pub mod client;
pub mod error;
pub mod extractor;
pub mod prompt;
pub mod types;

pub use client::{LlmClient, LlmProvider};
pub use error::LlmError;
pub use extractor::{parse_param_object, LlmParamExtractor};
pub use prompt::PromptSet;
pub use types::{LlmRequest, LlmResponse};
