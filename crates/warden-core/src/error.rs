//! Error types for the filtering core.

use thiserror::Error;

/// Core error type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Category 0 is reserved and means "do not filter".
    #[error("category 0 is reserved and cannot hold rules")]
    ReservedCategory,

    /// IO error while reading a rule or trigger source.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-rule parse failure. These are counted, never fatal to a batch.
#[derive(Debug, Error)]
pub enum RuleParseError {
    /// The rule carried an option the engine does not understand.
    #[error("unknown filter option: {0}")]
    UnknownOption(String),

    /// The rule body was empty after stripping anchors and options.
    #[error("empty filter pattern")]
    EmptyPattern,

    /// A `/.../` rule failed to compile.
    #[error("invalid regex rule: {0}")]
    BadRegex(String),

    /// An element-hiding rule had an empty or unsafe selector.
    #[error("invalid element hiding selector")]
    BadSelector,

    /// A `domain=` option listed no usable domains.
    #[error("empty domain option")]
    EmptyDomains,
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
