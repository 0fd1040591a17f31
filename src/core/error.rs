//! Error taxonomy — resolution, graph, state, and engine errors.
//!
//! ResolveError and GraphError are always detected before any provider call
//! is made. Provider failures are carried per-resource in the apply report,
//! not as an engine-level error.

use std::path::PathBuf;
use thiserror::Error;

/// Expression resolution failure. Every variant names the lookup that failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("parameter '{0}' has no value: no override supplied and no default declared")]
    MissingParameterValue(String),

    #[error("parameter '{name}': value '{value}' is not one of the allowed values")]
    InvalidEnumValue { name: String, value: String },

    #[error("unknown mapping '{0}'")]
    UnknownMapping(String),

    #[error("mapping '{mapping}' has no top-level key '{key}'")]
    UnknownMappingKey { mapping: String, key: String },

    #[error("mapping '{mapping}.{key}' has no attribute '{attribute}'")]
    UnknownMappingAttribute {
        mapping: String,
        key: String,
        attribute: String,
    },

    #[error("reference to unknown resource '{0}'")]
    UnknownResource(String),

    /// The referenced resource is declared but not yet Created. The graph
    /// builder must guarantee this never happens at evaluation time, so
    /// hitting it is a dependency-ordering bug, not a retryable condition.
    #[error("attribute '{attribute}' of resource '{resource}' is not available yet (dependency-ordering bug)")]
    AttributeNotAvailable { resource: String, attribute: String },

    #[error("resource '{resource}' has no attribute '{attribute}'")]
    UnknownAttribute { resource: String, attribute: String },

    #[error("type mismatch in {context}: expected a scalar")]
    TypeMismatch { context: String },

    #[error("unclosed '${{' placeholder at byte {0} of substitution")]
    UnclosedPlaceholder(usize),

    #[error("empty placeholder in substitution")]
    EmptyPlaceholder,
}

/// Dependency graph construction failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("resource '{resource}' references unknown resource '{dependency}'")]
    UnknownDependency {
        resource: String,
        dependency: String,
    },

    #[error("dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },
}

/// Stack state or journal I/O failure.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot access {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid state file {path}: {message}")]
    Corrupt { path: PathBuf, message: String },
}

/// Fatal pre-flight failure of an apply or destroy run. Anything that gets
/// past pre-flight is reported per-resource instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("resolution error in {id}: {source}")]
    Resolution {
        id: String,
        #[source]
        source: ResolveError,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    State(#[from] StateError),
}
