//! Sandbox levels, the policies they translate to, and the Extism
//! (wasmtime) sandbox that enforces a policy around one module.
//!
//! Levels are strictly additive: every level keeps all the restrictions
//! of the levels below it. [`SandboxPolicy::covers`] expresses that
//! relation so it can be checked rather than trusted.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;
use crate::process::WorkerCommand;

/// WASM linear memory page size.
const WASM_PAGE_SIZE: usize = 64 * 1024;

/// Per-call timeout at `process` and above, in seconds.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 10;

// ─── Levels ─────────────────────────────────────────────────────────────

/// Isolation level selected by the caller for a single load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxLevel {
    /// No restrictions. Only for trusted first-party plugins; never
    /// chosen automatically.
    None,
    Memory,
    File,
    Network,
    Process,
    Full,
}

impl SandboxLevel {
    pub const ALL: [SandboxLevel; 6] = [
        SandboxLevel::None,
        SandboxLevel::Memory,
        SandboxLevel::File,
        SandboxLevel::Network,
        SandboxLevel::Process,
        SandboxLevel::Full,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Memory => "memory",
            Self::File => "file",
            Self::Network => "network",
            Self::Process => "process",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for SandboxLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxLevel {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PluginError::Sandbox(format!("unknown sandbox level '{s}'")))
    }
}

// ─── Configuration ──────────────────────────────────────────────────────

/// Limits and allow-lists the sandbox levels draw from.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum memory in bytes (default: 32 MB).
    pub memory_limit: usize,
    /// Maximum fuel (instructions) per execution (default: 1_000_000).
    pub fuel_limit: u64,
    /// Per-call timeout at `process` and above (default: 10).
    pub call_timeout_secs: u64,
    /// Hosts reachable at `network` and above.
    pub allowed_hosts: Vec<String>,
    /// Directories reachable at `file` and above.
    pub allowed_paths: Vec<PathBuf>,
    /// Enable WASI for levels below `full` (default: false).
    pub wasi_enabled: bool,
    /// Worker process that hosts modules at `process` and above. Without
    /// one, those levels fall back to an in-process worker thread.
    pub worker: Option<WorkerCommand>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 32 * 1024 * 1024,
            fuel_limit: 1_000_000,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            allowed_hosts: Vec::new(),
            allowed_paths: Vec::new(),
            wasi_enabled: false,
            worker: None,
        }
    }
}

/// Validate an allow-listed host entry.
///
/// Must be non-empty, contain no spaces, and either be `"*"`, `"localhost"`,
/// or contain at least one dot (basic domain validation).
fn validate_http_host(host: &str) -> Result<(), PluginError> {
    if host.is_empty() {
        return Err(PluginError::Sandbox(
            "allowed host entry must not be empty".into(),
        ));
    }
    if host.contains(' ') {
        return Err(PluginError::Sandbox(format!(
            "allowed host entry must not contain spaces: '{host}'"
        )));
    }
    if host != "*" && host != "localhost" && !host.contains('.') {
        return Err(PluginError::Sandbox(format!(
            "allowed host entry is not a valid domain: '{host}'"
        )));
    }
    Ok(())
}

/// Split a comma-separated host list, dropping invalid entries.
pub(crate) fn parse_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .filter_map(|host| match validate_http_host(host) {
            Ok(()) => Some(host.to_string()),
            Err(e) => {
                tracing::warn!("ignoring allowed host: {e}");
                None
            }
        })
        .collect()
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self {
            memory_limit: std::env::var("PLUGIN_MEMORY_LIMIT_MB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(32)
                * 1024
                * 1024,
            fuel_limit: std::env::var("PLUGIN_FUEL_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000_000),
            call_timeout_secs: std::env::var("PLUGIN_CALL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_CALL_TIMEOUT_SECS),
            allowed_hosts: std::env::var("PLUGIN_ALLOWED_HOSTS")
                .map(|v| parse_host_list(&v))
                .unwrap_or_default(),
            allowed_paths: std::env::var_os("PLUGIN_ALLOWED_PATHS")
                .map(|v| std::env::split_paths(&v).collect())
                .unwrap_or_default(),
            wasi_enabled: std::env::var("PLUGIN_WASI_ENABLED")
                .unwrap_or_default()
                .eq_ignore_ascii_case("true"),
            worker: WorkerCommand::from_env(),
        }
    }

    fn memory_pages(&self) -> u32 {
        u32::try_from(self.memory_limit / WASM_PAGE_SIZE).unwrap_or(u32::MAX)
    }
}

// ─── Policy ─────────────────────────────────────────────────────────────

/// Filesystem reach of a sandboxed module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsAccess {
    Unrestricted,
    /// Only these host directories are preopened. Empty means none.
    AllowList(Vec<PathBuf>),
}

/// Outbound HTTP reach of a sandboxed module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetAccess {
    Unrestricted,
    /// Only these hosts may be called. Empty means none.
    AllowList(Vec<String>),
}

/// Concrete restrictions derived from a [`SandboxLevel`].
///
/// Serializable so it can be handed to a worker process unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxPolicy {
    pub level: SandboxLevel,
    pub memory_max_pages: Option<u32>,
    pub fuel_limit: Option<u64>,
    pub filesystem: FsAccess,
    pub network: NetAccess,
    pub wasi: bool,
    /// Run the plugin outside the host's own call stack: in a worker
    /// process when one is configured, else on a worker thread.
    pub out_of_line: bool,
    pub call_timeout: Option<Duration>,
}

/// `a` is at least as strict as `b` when it has a limit and that limit is
/// not larger.
fn limit_covers<T: PartialOrd>(a: Option<T>, b: Option<T>) -> bool {
    match (a, b) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(a), Some(b)) => a <= b,
    }
}

fn list_covers<T: PartialEq>(a: Option<&[T]>, b: Option<&[T]>) -> bool {
    match (a, b) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(a), Some(b)) => a.iter().all(|item| b.contains(item)),
    }
}

impl FsAccess {
    fn allow_list(&self) -> Option<&[PathBuf]> {
        match self {
            Self::Unrestricted => None,
            Self::AllowList(paths) => Some(paths),
        }
    }
}

impl NetAccess {
    fn allow_list(&self) -> Option<&[String]> {
        match self {
            Self::Unrestricted => None,
            Self::AllowList(hosts) => Some(hosts),
        }
    }
}

impl SandboxPolicy {
    /// Translate a level into the restrictions it stands for.
    pub fn for_level(level: SandboxLevel, config: &SandboxConfig) -> Self {
        let mut policy = Self {
            level,
            memory_max_pages: None,
            fuel_limit: None,
            filesystem: FsAccess::Unrestricted,
            network: NetAccess::Unrestricted,
            wasi: config.wasi_enabled,
            out_of_line: false,
            call_timeout: None,
        };

        if level >= SandboxLevel::Memory {
            policy.memory_max_pages = Some(config.memory_pages());
            policy.fuel_limit = Some(config.fuel_limit);
        }
        if level >= SandboxLevel::File {
            policy.filesystem = FsAccess::AllowList(config.allowed_paths.clone());
        }
        if level >= SandboxLevel::Network {
            policy.network = NetAccess::AllowList(config.allowed_hosts.clone());
        }
        if level >= SandboxLevel::Process {
            policy.out_of_line = true;
            policy.call_timeout = Some(Duration::from_secs(config.call_timeout_secs));
        }
        if level >= SandboxLevel::Full {
            policy.wasi = false;
            policy.filesystem = FsAccess::AllowList(Vec::new());
        }

        policy
    }

    /// Whether this policy is at least as strict as `other` on every axis.
    pub fn covers(&self, other: &SandboxPolicy) -> bool {
        limit_covers(self.memory_max_pages, other.memory_max_pages)
            && limit_covers(self.fuel_limit, other.fuel_limit)
            && limit_covers(self.call_timeout, other.call_timeout)
            && list_covers(self.filesystem.allow_list(), other.filesystem.allow_list())
            && list_covers(self.network.allow_list(), other.network.allow_list())
            && (!self.wasi || other.wasi)
            && (self.out_of_line || !other.out_of_line)
    }
}

// ─── Sandbox ────────────────────────────────────────────────────────────

/// An Extism plugin built under a [`SandboxPolicy`].
pub struct PluginSandbox {
    plugin: extism::Plugin,
    plugin_name: String,
}

impl std::fmt::Debug for PluginSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSandbox")
            .field("plugin_name", &self.plugin_name)
            .finish_non_exhaustive()
    }
}

impl PluginSandbox {
    /// Instantiate a module with the policy's limits applied.
    ///
    /// Memory is capped in 64 KB pages, fuel bounds each call, and the
    /// path and host allow-lists become the manifest's preopens and
    /// allowed hosts.
    pub fn build(
        wasm_bytes: &[u8],
        policy: &SandboxPolicy,
        name: &str,
    ) -> Result<Self, PluginError> {
        let manifest = Self::manifest(wasm_bytes, policy);

        let mut builder = extism::PluginBuilder::new(manifest).with_wasi(policy.wasi);
        if let Some(fuel) = policy.fuel_limit {
            builder = builder.with_fuel_limit(fuel);
        }

        if policy.level == SandboxLevel::None {
            tracing::warn!(
                plugin = %name,
                "sandbox level 'none': plugin runs without memory, filesystem or network limits"
            );
        }
        if policy.wasi {
            tracing::warn!(
                plugin = %name,
                "WASI enabled for plugin: plugin can access environment variables. \
                 Avoid running with sensitive env vars exposed."
            );
        }

        let plugin = builder
            .build()
            .map_err(|e| PluginError::Sandbox(e.to_string()))?;

        Ok(Self {
            plugin,
            plugin_name: name.to_string(),
        })
    }

    /// Only level `none` preopens the host root. Below `file` every other
    /// level leaves the filesystem closed.
    fn manifest(wasm_bytes: &[u8], policy: &SandboxPolicy) -> extism::Manifest {
        let mut manifest = extism::Manifest::new([extism::Wasm::data(wasm_bytes.to_vec())]);

        if let Some(pages) = policy.memory_max_pages {
            manifest = manifest.with_memory_max(pages);
        }
        if let Some(timeout) = policy.call_timeout {
            manifest = manifest.with_timeout(timeout);
        }

        match &policy.filesystem {
            FsAccess::Unrestricted if policy.level == SandboxLevel::None => {
                manifest = manifest.with_allowed_path("/".to_string(), "/");
            }
            FsAccess::Unrestricted => {}
            FsAccess::AllowList(paths) => {
                for path in paths {
                    manifest = manifest.with_allowed_path(path.display().to_string(), path);
                }
            }
        }

        match &policy.network {
            NetAccess::Unrestricted => {
                manifest = manifest.with_allowed_host("*");
            }
            NetAccess::AllowList(hosts) => {
                manifest = manifest.with_allowed_hosts(hosts.clone().into_iter());
            }
        }

        manifest
    }

    /// Call a WASM function by name with raw byte input/output.
    ///
    /// Errors are classified into fuel exhaustion, memory exceeded, or
    /// general runtime errors.
    pub fn call(&mut self, function_name: &str, input: &[u8]) -> Result<Vec<u8>, PluginError> {
        self.plugin
            .call::<&[u8], Vec<u8>>(function_name, input)
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("fuel") {
                    PluginError::FuelExhausted(self.plugin_name.clone())
                } else if msg.contains("memory") {
                    PluginError::MemoryExceeded(self.plugin_name.clone())
                } else if msg.contains("timeout") || msg.contains("interrupt") {
                    PluginError::Timeout(self.plugin_name.clone())
                } else {
                    PluginError::Runtime(msg)
                }
            })
    }

    /// Check if the module exports a function with the given name.
    pub fn has_function(&self, name: &str) -> bool {
        self.plugin.function_exists(name)
    }

    pub fn name(&self) -> &str {
        &self.plugin_name
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
