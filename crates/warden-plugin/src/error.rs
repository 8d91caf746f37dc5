//! Plugin host error types.

use thiserror::Error;

/// Coarse classification of a [`PluginError`].
///
/// Callers that only need to know *why* a pipeline stage failed (for
/// diagnostics or security auditing) match on this instead of on the
/// individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A path, plugin name, symbol or dependency does not exist.
    NotFound,
    /// Metadata, image or parameters could not be understood.
    Malformed,
    /// The binary's signature is missing, wrong, or not trusted.
    Untrusted,
    /// The request collides with current registry state.
    Conflict,
    /// The isolation context could not be established.
    SandboxFailure,
    /// The plugin itself reported failure or misbehaved.
    PluginInternal,
    /// Host-side I/O failure unrelated to the plugin's content.
    Io,
    /// A lifecycle notification could not be delivered.
    Delivery,
}

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("missing required symbol '{symbol}' in {path}")]
    MissingSymbol { path: String, symbol: String },

    #[error("missing dependency: plugin {plugin} requires {dependency}")]
    MissingDependency { plugin: String, dependency: String },

    #[error("metadata unreadable: {0}")]
    MetadataUnreadable(String),

    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    #[error("invalid image format: {0}")]
    InvalidImage(String),

    #[error("missing signature: {0}")]
    MissingSignature(String),

    #[error("signature mismatch: declared {declared}, computed {computed}")]
    SignatureMismatch { declared: String, computed: String },

    #[error("untrusted signer: digest {0} is not in the trust store")]
    UntrustedSigner(String),

    #[error("plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("incompatible API: plugin {plugin} requires {required}, host provides {provided}")]
    IncompatibleApi {
        plugin: String,
        required: String,
        provided: String,
    },

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("plugin {0} failed to initialize")]
    InitializationFailed(String),

    #[error("plugin {plugin} panicked during {during}")]
    Panicked { plugin: String, during: &'static str },

    #[error("execution timeout: plugin {0} did not answer in time")]
    Timeout(String),

    #[error("execution timeout: plugin {0} exceeded fuel limit")]
    FuelExhausted(String),

    #[error("memory limit exceeded: plugin {0}")]
    MemoryExceeded(String),

    #[error("plugin runtime error: {0}")]
    Runtime(String),

    #[error("event delivery failed: {0}")]
    Delivery(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("semver error: {0}")]
    Semver(#[from] semver::Error),
}

impl PluginError {
    /// Returns the taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::MissingSymbol { .. } | Self::MissingDependency { .. } => {
                ErrorKind::NotFound
            }
            Self::MetadataUnreadable(_)
            | Self::MalformedMetadata(_)
            | Self::InvalidImage(_)
            | Self::Serialization(_)
            | Self::TomlParse(_)
            | Self::Semver(_) => ErrorKind::Malformed,
            Self::MissingSignature(_)
            | Self::SignatureMismatch { .. }
            | Self::UntrustedSigner(_) => ErrorKind::Untrusted,
            Self::AlreadyLoaded(_) | Self::IncompatibleApi { .. } => ErrorKind::Conflict,
            Self::Sandbox(_) => ErrorKind::SandboxFailure,
            Self::InitializationFailed(_)
            | Self::Panicked { .. }
            | Self::Timeout(_)
            | Self::FuelExhausted(_)
            | Self::MemoryExceeded(_)
            | Self::Runtime(_) => ErrorKind::PluginInternal,
            Self::Delivery(_) => ErrorKind::Delivery,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}
