//! The capability set every plugin exposes to the host.
//!
//! The contract is deliberately narrow: lifecycle hooks, metadata
//! accessors and one string-keyed, JSON-valued operation entry point. The
//! host never needs compile-time knowledge of a plugin's concrete type.

use serde::{Deserialize, Serialize};

/// Version of the plugin contract implemented by this host.
///
/// A plugin's declared `api_version` is a semver requirement that must
/// match this version for the plugin to load.
pub const HOST_API_VERSION: &str = "1.0.0";

/// Immutable self-description of a plugin.
///
/// Produced by the metadata extractor before any plugin code runs. The
/// `verified` flag can only be set by the signature verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub api_version: String,
    /// Lowercase hex SHA-256 of the module's signed region.
    #[serde(default)]
    pub signature: String,
    #[serde(skip)]
    verified: bool,
}

impl PluginMetadata {
    /// Create metadata with the required fields; the rest start empty.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            author: String::new(),
            description: String::new(),
            dependencies: Vec::new(),
            api_version: api_version.into(),
            signature: String::new(),
            verified: false,
        }
    }

    /// Whether the signature verifier approved the binary this metadata
    /// was extracted from.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub(crate) fn into_verified(mut self) -> Self {
        self.verified = true;
        self
    }

    /// Check the declared API requirement against [`HOST_API_VERSION`].
    pub fn is_api_compatible(&self) -> bool {
        let Ok(required) = semver::VersionReq::parse(&self.api_version) else {
            return false;
        };
        semver::Version::parse(HOST_API_VERSION)
            .map(|host| required.matches(&host))
            .unwrap_or(false)
    }
}

/// A plugin instance as seen by the host.
///
/// Implementations must never let a panic or error escape as anything
/// other than the documented return values: `false` from `initialize`,
/// `None` from `execute_operation`. The host additionally contains
/// panics at every call site.
pub trait Plugin: Send {
    /// Called exactly once after construction, before any operation.
    fn initialize(&mut self) -> bool;

    /// Called exactly once before destruction, even when `initialize`
    /// failed or never ran.
    fn shutdown(&mut self);

    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn metadata(&self) -> PluginMetadata;

    /// Run a named operation with JSON-encoded parameters.
    ///
    /// Returns the JSON-encoded result, or `None` when the operation is
    /// unknown, the parameters are malformed, or the plugin failed.
    fn execute_operation(&mut self, operation: &str, params: &str) -> Option<String>;
}

/// Check an operation name against the wire format (`[A-Za-z0-9_]+`).
pub fn is_valid_operation_name(operation: &str) -> bool {
    !operation.is_empty()
        && operation
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metadata_is_unverified() {
        let meta = PluginMetadata::new("sample", "1.0.0", "^1.0");
        assert!(!meta.is_verified());
        assert!(meta.into_verified().is_verified());
    }

    #[test]
    fn test_api_compatibility() {
        assert!(PluginMetadata::new("a", "1", "^1.0").is_api_compatible());
        assert!(PluginMetadata::new("a", "1", "1").is_api_compatible());
        assert!(PluginMetadata::new("a", "1", ">=0.9, <2").is_api_compatible());
        assert!(!PluginMetadata::new("a", "1", "^2.0").is_api_compatible());
        assert!(!PluginMetadata::new("a", "1", "not-a-req!").is_api_compatible());
    }

    #[test]
    fn test_verified_flag_is_not_serialized() {
        let meta = PluginMetadata::new("sample", "1.0.0", "^1.0").into_verified();
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("verified").is_none());
        let back: PluginMetadata = serde_json::from_value(json).unwrap();
        assert!(!back.is_verified());
    }

    #[test]
    fn test_operation_names() {
        assert!(is_valid_operation_name("echo"));
        assert!(is_valid_operation_name("get_status_2"));
        assert!(!is_valid_operation_name(""));
        assert!(!is_valid_operation_name("../escape"));
        assert!(!is_valid_operation_name("with space"));
        assert!(!is_valid_operation_name("warden-construct"));
    }
}
