//! Error types for the spacemix core library.
//!
//! Each concern has its own enum so callers can match on exactly the failure
//! class they care about; [`SpacemixError`] aggregates them for `?`-friendly
//! propagation.

use thiserror::Error;

use crate::types::RecordId;

/// Top-level error type for all spacemix operations.
#[derive(Error, Debug)]
pub enum SpacemixError {
    /// A schema declaration or a record failed schema validation.
    #[error(transparent)]
    SchemaValidation(#[from] SchemaError),

    /// An encoder rejected a value or produced the wrong dimension.
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// A space or index declaration is invalid.
    #[error(transparent)]
    SpaceConfig(#[from] SpaceConfigError),

    /// An interaction event was rejected.
    #[error(transparent)]
    EventValidation(#[from] EventError),

    /// A query parameter could not be bound.
    #[error(transparent)]
    ParamResolution(#[from] ParamError),

    /// The vector store collaborator failed.
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpacemixError {
    /// Whether the failed operation may be retried as-is.
    ///
    /// Only store I/O failures qualify. Upserts are idempotent for the same
    /// record id and vector; raw event application is not, but duplicates are
    /// rejected by key so a retried event either lands once or fails with
    /// [`EventError::Duplicate`].
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(e) if e.is_retryable())
    }
}

/// Schema declaration and record validation failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    /// Schema has no identifier field.
    #[error("Schema '{schema}' declares no identifier field")]
    MissingIdField {
        /// Schema name.
        schema: String,
    },

    /// Schema declares more than one identifier field.
    #[error("Schema '{schema}' declares a second identifier field '{field}'")]
    DuplicateIdField {
        /// Schema name.
        schema: String,
        /// The offending field.
        field: String,
    },

    /// A field name was declared twice.
    #[error("Schema '{schema}' declares field '{field}' twice")]
    DuplicateField {
        /// Schema name.
        schema: String,
        /// The duplicated field.
        field: String,
    },

    /// Reference to a field the schema does not have.
    #[error("Unknown field '{field}' in schema '{schema}'")]
    UnknownField {
        /// Schema name.
        schema: String,
        /// The unknown field.
        field: String,
    },

    /// A value does not match its declared field type.
    #[error("Field '{field}' expects {expected}, got {actual}")]
    TypeMismatch {
        /// Field name.
        field: String,
        /// Expected type.
        expected: String,
        /// What was supplied.
        actual: String,
    },

    /// Record is missing its identifier or the identifier is empty.
    #[error("Record of schema '{schema}' has no identifier")]
    MissingId {
        /// Schema name.
        schema: String,
    },

    /// Record input is not a JSON object.
    #[error("Record of schema '{schema}' must be an object")]
    NotAnObject {
        /// Schema name.
        schema: String,
    },

    /// An identifier is already owned by a record of another schema.
    #[error("Record '{id}' already belongs to schema '{existing}', not '{attempted}'")]
    IdentityConflict {
        /// The identifier.
        id: RecordId,
        /// Schema that owns the id.
        existing: String,
        /// Schema that tried to reuse it.
        attempted: String,
    },

    /// The schema is not covered by the index.
    #[error("Schema '{schema}' is not covered by index '{index}'")]
    SchemaNotIndexed {
        /// Schema name.
        schema: String,
        /// Index name.
        index: String,
    },

    /// A filter names a field the index does not expose for filtering.
    #[error("Field '{field}' is not filterable in index '{index}'")]
    NotFilterable {
        /// Field name.
        field: String,
        /// Index name.
        index: String,
    },
}

/// Encoder failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodingError {
    /// The encoder does not accept this kind of value.
    #[error("Encoder '{encoder}' cannot encode {value_kind}")]
    UnsupportedValue {
        /// Encoder model name.
        encoder: String,
        /// Kind of value supplied.
        value_kind: String,
    },

    /// The encoder produced a vector of the wrong length.
    #[error("Encoder '{encoder}' produced {actual} dimensions, declared {expected}")]
    Dimension {
        /// Encoder model name.
        encoder: String,
        /// Declared dimension.
        expected: usize,
        /// Produced dimension.
        actual: usize,
    },

    /// The model backing the encoder failed.
    #[error("Encoder '{encoder}' failed: {reason}")]
    Model {
        /// Encoder model name.
        encoder: String,
        /// Failure description.
        reason: String,
    },
}

/// Space and index declaration failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpaceConfigError {
    /// A default weight is not strictly positive and finite.
    #[error("Space '{space}' has invalid default weight {weight}")]
    InvalidWeight {
        /// Space name.
        space: String,
        /// The weight.
        weight: f64,
    },

    /// Numeric range is empty or inverted.
    #[error("Space '{space}' requires min_value < max_value, got [{min}, {max}]")]
    InvalidRange {
        /// Space name.
        space: String,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },

    /// Space binds no fields.
    #[error("Space '{space}' binds no fields")]
    NoFields {
        /// Space name.
        space: String,
    },

    /// Space binds two fields of the same schema.
    #[error("Space '{space}' binds more than one field of schema '{schema}'")]
    DuplicateSchema {
        /// Space name.
        space: String,
        /// Schema name.
        schema: String,
    },

    /// Field type does not suit the space kind.
    #[error("Space '{space}' cannot bind field '{field}' of type {field_type}")]
    FieldType {
        /// Space name.
        space: String,
        /// Field name.
        field: String,
        /// Field type.
        field_type: String,
    },

    /// Image and description fields live in different schemas.
    #[error("Space '{space}': image and description fields must be in the same schema")]
    SchemaMismatch {
        /// Space name.
        space: String,
    },

    /// Generic invalid parameter.
    #[error("Space '{space}': {reason}")]
    InvalidParameter {
        /// Space name.
        space: String,
        /// Description.
        reason: String,
    },

    /// Index has no spaces.
    #[error("Index '{index}' has no spaces")]
    EmptyIndex {
        /// Index name.
        index: String,
    },

    /// Two spaces share a name.
    #[error("Index '{index}' contains space '{space}' twice")]
    DuplicateSpace {
        /// Index name.
        index: String,
        /// Space name.
        space: String,
    },

    /// Reference to a space the index does not contain.
    #[error("Index '{index}' has no space '{space}'")]
    UnknownSpace {
        /// Index name.
        index: String,
        /// Space name.
        space: String,
    },

    /// The store holds vectors built with a different space layout.
    #[error("Index '{index}' layout changed (stored {stored}, declared {declared}); re-ingestion required")]
    LayoutMismatch {
        /// Index name.
        index: String,
        /// Stored layout fingerprint.
        stored: String,
        /// Declared layout fingerprint.
        declared: String,
    },
}

/// Event validation failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventError {
    /// Source or target record does not exist.
    #[error("Event references unknown record '{0}'")]
    UnknownRecord(RecordId),

    /// No effect is declared for the event type.
    #[error("No effect declared for event type '{0}'")]
    UnknownEventType(String),

    /// Event names a space outside its effect or the index.
    #[error("Event type '{event_type}' does not affect space '{space}'")]
    UnknownSpace {
        /// Event type.
        event_type: String,
        /// Space name.
        space: String,
    },

    /// Weight is negative or not finite.
    #[error("Event weight {0} is invalid")]
    InvalidWeight(f64),

    /// An event with the same key was already applied.
    #[error("Duplicate event {source_id} -> {target} ({event_type} at {timestamp})")]
    Duplicate {
        /// Source record.
        source_id: RecordId,
        /// Target record.
        target: RecordId,
        /// Event type.
        event_type: String,
        /// Event timestamp (RFC 3339).
        timestamp: String,
    },
}

/// Query parameter resolution failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamError {
    /// No explicit value, no natural-language value and no default.
    #[error("Param '{param}' is unresolved (used by {usage})")]
    Unresolved {
        /// Param name.
        param: String,
        /// Where the param is used, e.g. "weight of space 'rating'".
        usage: String,
    },

    /// A bound value has the wrong type.
    #[error("Param '{param}' expects {expected}, got {actual}")]
    InvalidType {
        /// Param name.
        param: String,
        /// Expected type.
        expected: String,
        /// What was supplied.
        actual: String,
    },

    /// A bound value lies outside the declared range.
    #[error("Param '{param}' value {value} outside [{min}, {max}]")]
    OutOfRange {
        /// Param name.
        param: String,
        /// Supplied value.
        value: f64,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },

    /// Caller supplied a value for a param the query does not declare.
    #[error("Query declares no param '{0}'")]
    UnknownParam(String),

    /// The same param name is used with incompatible types.
    #[error("Param '{param}' used as both {first} and {second}")]
    ConflictingUse {
        /// Param name.
        param: String,
        /// First inferred type.
        first: String,
        /// Second inferred type.
        second: String,
    },

    /// Natural-language extraction failed.
    #[error("Natural-language resolution failed for [{params}]: {reason}")]
    NaturalLanguage {
        /// Params that were pending.
        params: String,
        /// Why extraction failed.
        reason: String,
    },

    /// Natural-language extraction did not finish in time.
    #[error("Natural-language resolution timed out after {0}ms")]
    Timeout(u64),

    /// The query limit is zero or above the configured maximum.
    #[error("Query limit {limit} outside [1, {max}]")]
    InvalidLimit {
        /// Requested limit.
        limit: i64,
        /// Configured maximum.
        max: usize,
    },
}

/// Vector store failures.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite adapter failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Vector or payload (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A stored row failed its checksum.
    #[error("Checksum mismatch for record '{0}'")]
    Corrupted(RecordId),

    /// Vector dimension does not match the index layout.
    #[error("Vector dimension {actual} does not match index dimension {expected}")]
    Dimension {
        /// Expected dimension.
        expected: usize,
        /// Supplied dimension.
        actual: usize,
    },

    /// The backend is unreachable or refused the operation.
    #[error("Store unavailable during {operation}: {reason}")]
    Unavailable {
        /// Which store operation failed.
        operation: &'static str,
        /// Failure description.
        reason: String,
    },
}

impl StoreError {
    /// Whether the operation may be retried as-is.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Unavailable { .. })
    }
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, SpacemixError>;
