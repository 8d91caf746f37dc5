//! Warden Plugin Host
//!
//! Loads untrusted WASM plugin modules into an isolated, signature-checked
//! runtime built on Extism (wasmtime). A plugin declares its identity in an
//! embedded descriptor, is approved by digest against an operator trust
//! store, runs under one of six sandbox levels, and talks to the host
//! through named operations with JSON parameters.

pub mod config;
pub mod contract;
pub mod error;
pub mod events;
pub mod isolation;
pub mod loader;
pub mod metadata;
pub mod package;
pub mod process;
pub mod registry;
pub mod sandbox;
pub mod signature;

pub use config::HostConfig;
pub use contract::{Plugin, PluginMetadata, HOST_API_VERSION};
pub use error::{ErrorKind, PluginError};
pub use events::{BroadcastPublisher, CallbackId, EventPublisher, LifecycleEvent, SecurityEvent};
pub use isolation::{IsolationBackend, RuntimeIsolation, SandboxContext, SandboxController};
pub use loader::{ImageLoader, LibraryHandle, LoadedImage, WasmImageLoader};
pub use metadata::MetadataExtractor;
pub use package::{embed_descriptor, seal, PluginImage, SealedModule};
pub use process::{ProcessPlugin, WorkerCommand};
pub use registry::{LoadStage, PluginRef, PluginRegistry, PluginStatus, RegistryBuilder};
pub use sandbox::{PluginSandbox, SandboxConfig, SandboxLevel, SandboxPolicy};
pub use signature::{SignatureVerifier, TrustStore};
