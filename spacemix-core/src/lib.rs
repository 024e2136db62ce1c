//! # spacemix core library
//!
//! Records are embedded into several independent **spaces** (text, bounded
//! numbers, recency, categories, images, custom encoders). An [`Index`]
//! concatenates the per-space unit vectors into one composite vector, so a
//! single inner-product search ranks by a weighted sum of per-space cosine
//! similarities. The weights live only on the query side:
//!
//! ```text
//! stored  = [u_1 | u_2 | ... | u_n]          (unit or zero sub-vectors)
//! query   = [s(q_1)·v_1 | ... | s(q_n)·v_n]  s(q) = sign(q)·√|q|
//! score   = Σ s(q_i) · cos(u_i, v_i)
//! ```
//!
//! Changing a weight re-ranks without re-embedding anything.
//!
//! On top of that:
//!
//! - **Events** ([`event`]) pull a record's sub-vectors toward the records it
//!   interacted with, decayed by age and blended incrementally.
//! - **Parameterised queries** ([`query`]) leave weights, targets, filters and
//!   the limit open as [`query::Param`]s, bound per execution from explicit
//!   values, natural language or defaults.
//!
//! [`Engine`] is the entry point that wires these together with a
//! [`store::VectorStore`].

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod decay;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod event;
pub mod filter;
pub mod index;
pub mod metrics;
pub mod query;
pub mod record;
pub mod schema;
pub mod space;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod vector;

pub use config::SpacemixConfig;
pub use engine::{Engine, IngestFailure, IngestReport};
pub use error::{Result, SpacemixError};
pub use event::{Event, EventReport};
pub use filter::Predicate;
pub use index::{Effect, Index};
pub use query::{Param, ParamExtractor, Query, QueryParams, QueryResult, QueryTemplate};
pub use schema::{FieldType, Schema};
pub use space::Space;
pub use types::{FieldValue, RecordId, SpaceMode};
