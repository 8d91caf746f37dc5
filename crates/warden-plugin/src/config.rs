//! Host configuration read from the environment.

use std::path::PathBuf;

use crate::package::DEFAULT_MAX_IMAGE_SIZE;
use crate::sandbox::{SandboxConfig, SandboxLevel};

/// Default plugin search directory.
const DEFAULT_SEARCH_PATH: &str = "./plugins";

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Directories scanned by discovery, in order.
    pub search_paths: Vec<PathBuf>,
    /// Whether discovery descends into subdirectories (default: false).
    pub recursive_discovery: bool,
    /// Largest image the host will read, in bytes (default: 50 MB).
    pub max_image_size: u64,
    /// TOML trust store loaded at startup, if any.
    pub trust_store: Option<PathBuf>,
    /// Level used by front-ends when the operator does not pick one.
    /// Never `none`.
    pub default_sandbox: SandboxLevel,
    pub sandbox: SandboxConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            search_paths: vec![PathBuf::from(DEFAULT_SEARCH_PATH)],
            recursive_discovery: false,
            max_image_size: DEFAULT_MAX_IMAGE_SIZE,
            trust_store: None,
            default_sandbox: SandboxLevel::Memory,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl HostConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let search_paths = std::env::var_os("PLUGIN_SEARCH_PATH")
            .map(|v| std::env::split_paths(&v).collect::<Vec<_>>())
            .filter(|paths| !paths.is_empty())
            .unwrap_or_else(|| vec![PathBuf::from(DEFAULT_SEARCH_PATH)]);

        let default_sandbox = match std::env::var("PLUGIN_DEFAULT_SANDBOX") {
            Ok(raw) => parse_default_level(&raw),
            Err(_) => SandboxLevel::Memory,
        };

        Self {
            search_paths,
            recursive_discovery: std::env::var("PLUGIN_DISCOVERY_RECURSIVE")
                .unwrap_or_default()
                .eq_ignore_ascii_case("true"),
            max_image_size: std::env::var("PLUGIN_MAX_SIZE_MB")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(DEFAULT_MAX_IMAGE_SIZE / (1024 * 1024))
                * 1024
                * 1024,
            trust_store: std::env::var_os("PLUGIN_TRUST_STORE").map(PathBuf::from),
            default_sandbox,
            sandbox: SandboxConfig::from_env(),
        }
    }
}

/// Parse a configured default level. `none` is never accepted as a
/// default and falls back to `memory`.
fn parse_default_level(raw: &str) -> SandboxLevel {
    match raw.parse::<SandboxLevel>() {
        Ok(SandboxLevel::None) => {
            tracing::warn!(
                "PLUGIN_DEFAULT_SANDBOX=none refused; sandbox level 'none' must be requested explicitly"
            );
            SandboxLevel::Memory
        }
        Ok(level) => level,
        Err(e) => {
            tracing::warn!("invalid PLUGIN_DEFAULT_SANDBOX, using 'memory': {e}");
            SandboxLevel::Memory
        }
    }
}
