//! Parameterised queries.
//!
//! A [`QueryTemplate`] is declared once with [`Query::find`] and executed many
//! times. Any clause value may be a [`Param`], bound per execution by the
//! [`Resolver`] from explicit values, natural language or defaults.

mod param;
mod resolver;
mod result;
mod template;

pub use param::{Bindable, Param, ParamType, QueryParams};
pub use resolver::{ExtractionError, ParamExtractor, ResolvedQuery, Resolver};
pub use result::{QueryResult, ResultEntry, SpaceWeight};
pub use template::{ParamSpec, Query, QueryBuilder, QueryTemplate, SimilarClause, WeightClause};
