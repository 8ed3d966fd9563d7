//! Error types for profile resolution with clear, actionable messages.
//!
//! Every failure in the resolution pipeline surfaces as one of these
//! variants; nothing is swallowed or retried internally.

use thiserror::Error;

/// Errors raised while resolving a profile into a running cluster
#[derive(Error, Debug)]
pub enum ProfileError {
    /// The cluster section names a backend type nobody registered
    #[error("unknown cluster type: {0:?}")]
    UnknownBackend(String),

    /// No profile with this name; the message lists every valid choice
    #[error("unknown profile: {name:?}. Choose one of {{{available}}}.")]
    UnknownProfile { name: String, available: String },

    /// The resolved document has no `cluster` section at all
    #[error("malformed profile {0:?}: needs at least the 'cluster' key")]
    MissingClusterSection(String),

    /// The `cluster` section has no `type` key
    #[error("profile {0:?}: cluster configuration does not have a 'type' key")]
    MissingBackendType(String),

    /// Derived resources are inconsistent (zero workers, or the derived
    /// total exceeds the declared memory ceiling)
    #[error("invalid resource configuration: {0}")]
    InvalidResource(String),

    /// No separator-pair candidate parses the resource-spec string cleanly
    #[error("could not detect the settings separator in {0:?}")]
    MalformedResourceSpec(String),

    /// A `${VAR}` reference points at an unset environment variable
    #[error("environment variable {0:?} is referenced but not set")]
    UnresolvedEnvironmentVariable(String),

    /// A human-readable memory size that does not parse
    #[error("could not parse memory size {0:?}")]
    InvalidMemory(String),

    /// A dotted override path runs through a scalar leaf
    #[error("override key {path:?} collides with a non-mapping value at {segment:?}")]
    OverrideConflict { path: String, segment: String },

    /// The profile source is not valid YAML
    #[error("failed to parse profile definitions: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A backend refused or failed to construct the cluster
    #[error("backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, ProfileError>;
