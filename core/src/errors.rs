/// Error types for the Gantry control plane.
use thiserror::Error;

/// Core error type for state store operations.
#[derive(Error, Debug)]
pub enum StateStoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for state store operations.
pub type StateStoreResult<T> = Result<T, StateStoreError>;

/// Errors raised while loading or validating workflow and pipeline definitions.
#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("Definition not found: {0}")]
    NotFound(String),

    #[error("Failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid definition '{name}': {message}")]
    Invalid { name: String, message: String },
}

/// Result type for definition operations.
pub type DefinitionResult<T> = Result<T, DefinitionError>;

/// Error type for pipeline execution.
///
/// Step failures are not errors at this level: they are recorded on the
/// execution and step rows. These variants cover requests that could not be
/// started or continued at all.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("State store error: {0}")]
    Store(#[from] StateStoreError),

    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Failure of a single pipeline step body.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error("Failed to spawn '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error("Command exited with status {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Step timed out after {0}s")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(String),

    #[error("{0}")]
    Reference(String),

    #[error("Template error: {0}")]
    Template(String),
}

/// Result type for step bodies.
pub type StepResult<T> = Result<T, StepError>;

/// Error type for configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
