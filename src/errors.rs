//! Error types for the Datarepo crate.
//!
//! This module defines a unified error enumeration used across config parsing,
//! the object cache, the revision store, registries, and pipeline execution.
//! It integrates with `thiserror` to provide rich `Display` implementations
//! and error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - `force=true` destructive operations swallow backend variants and continue
//!   their best-effort cleanup; everything else propagates to the caller.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DatarepoError>;

#[derive(Error, Debug)]
/// Unified error enumeration for the Datarepo library.
///
/// - Used across configs, caches, revision stores, registries and execution.
/// - Implements `std::error::Error` via `thiserror`.
pub enum DatarepoError {
    /// No aux directory found at or above the given path.
    #[error("Can't find project at '{0}'")]
    ProjectNotFound(String),

    /// `init` requested on a path that already hosts a project.
    #[error("Can't create project in '{0}': a project already exists")]
    ProjectAlreadyExists(String),

    /// Remote-touching operation on a tree with no parent project.
    #[error("{0}")]
    DetachedProject(String),

    /// Mutation attempted on a read-only (non-working) tree.
    #[error("{0}")]
    ReadonlyProject(String),

    /// Source name collision on add.
    #[error("Source '{0}' already exists")]
    SourceExists(String),

    /// Source absent from the containing tree.
    #[error("Unknown source '{0}'")]
    UnknownSource(String),

    /// Model absent from the containing tree.
    #[error("Unknown model '{0}'")]
    UnknownModel(String),

    /// Remote absent from the containing tree.
    #[error("Unknown remote '{0}'")]
    UnknownRemote(String),

    /// Build target or stage absent from the containing tree.
    #[error("Unknown build target '{0}'")]
    UnknownTarget(String),

    /// Stage name collision inside a build target.
    #[error("Stage '{0}' already exists")]
    StageExists(String),

    /// Ref doesn't resolve in the revision store or the object cache.
    #[error("Can't parse ref '{0}'")]
    UnknownRef(String),

    /// Unknown stage type or plugin kind encountered during execution.
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// Non-generated source missing from the cache and unretrievable.
    #[error("Can't find object '{0}' in the cache, and it can't be retrieved")]
    MissingObject(String),

    /// Execution requested on a pipeline with no nodes.
    #[error("Can't run an empty pipeline")]
    EmptyPipeline,

    /// Pipeline graph has no out-degree-0 node.
    #[error("A pipeline must have a head, but it has none")]
    MissingPipelineHead,

    /// Pipeline graph has two or more out-degree-0 nodes.
    #[error("A pipeline can have only one main target, but it has at least 2: {0}, {1}")]
    MultiplePipelineHeads(String, String),

    /// Incompatible parent datasets during a join; carries the contributing
    /// source node names.
    #[error("Can't merge datasets from sources: {}", .sources.join(", "))]
    DatasetMerge { sources: Vec<String> },

    /// Revision-store backend failure.
    #[error("Revision backend error: {0}")]
    Vcs(String),

    /// Remote URL carries a scheme outside the supported set.
    #[error(
        "Invalid remote '{url}': scheme '{scheme}' is not supported, \
         the only available are: {allowed}"
    )]
    UnsupportedUrlScheme {
        url: String,
        scheme: String,
        allowed: String,
    },

    /// Remote URL is empty or otherwise malformed.
    #[error("Invalid remote URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Name violates the file-name-safe grammar or the reserved set.
    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Config record failed validation (unknown version, payload mismatch).
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Invalid function argument.
    #[error("Argument parse failed: {0}")]
    InvalidArgument(String),

    /// Referenced file or directory does not exist.
    #[error("Can't find file or directory '{0}'")]
    PathNotFound(String),

    /// Plugin (extractor, transform, launcher) failure.
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// I/O error from the underlying filesystem.
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    /// YAML (de)serialization failure for configs and stage files.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// JSON (de)serialization failure for manifests and native datasets.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}
