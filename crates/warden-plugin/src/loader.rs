//! Dynamic loader: maps plugin images and resolves their entry points.
//!
//! A mapped image is owned by a [`LibraryHandle`]. The handle is released
//! exactly once, either through [`LibraryHandle::unload`] or on drop, and
//! every instance it constructed must be destroyed through it before that
//! happens.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::contract::{is_valid_operation_name, Plugin, PluginMetadata};
use crate::error::PluginError;
use crate::isolation::SandboxContext;
use crate::package::{
    signed_digest, PluginImage, CONSTRUCT_SYMBOL, DEFAULT_MAX_IMAGE_SIZE, DESTROY_SYMBOL,
    INITIALIZE_EXPORT, OPERATION_PREFIX, SHUTDOWN_EXPORT, WASM_MAGIC,
};
use crate::process::{ModuleSource, ProcessPlugin};
use crate::sandbox::{PluginSandbox, SandboxPolicy};

/// Allowed WASM import namespaces. Imports outside these are rejected.
const ALLOWED_IMPORT_NAMESPACES: &[&str] = &[
    "env",                    // Extism host functions
    "extism:host/env",        // Extism kernel
    "wasi_snapshot_preview1", // WASI preview 1
    "wasi_unstable",          // Legacy WASI
];

/// Symbols every image must export.
pub const REQUIRED_SYMBOLS: [&str; 2] = [CONSTRUCT_SYMBOL, DESTROY_SYMBOL];

/// A resolved exported function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    /// Function index within the module.
    pub index: u32,
}

// ─── Traits ─────────────────────────────────────────────────────────────

/// A mapped image. Dropping it unmaps the image.
pub trait LoadedImage: Send + Sync {
    fn path(&self) -> &Path;

    fn symbol(&self, name: &str) -> Option<Symbol>;

    /// Construct a plugin instance inside `context`.
    fn construct(
        &self,
        context: &SandboxContext,
        metadata: &PluginMetadata,
    ) -> Result<Box<dyn Plugin>, PluginError>;

    /// Destroy an instance this image constructed.
    fn destroy(&self, instance: Box<dyn Plugin>) {
        drop(instance);
    }
}

/// Maps images into the host.
pub trait ImageLoader: Send + Sync {
    fn map_image(&self, image: &PluginImage) -> Result<LibraryHandle, PluginError>;

    fn load_library(&self, path: &Path) -> Result<LibraryHandle, PluginError> {
        let image = PluginImage::read(path, DEFAULT_MAX_IMAGE_SIZE)?;
        self.map_image(&image)
    }

    fn unload_library(&self, handle: LibraryHandle) {
        handle.unload();
    }
}

// ─── Handle ─────────────────────────────────────────────────────────────

/// Exclusive owner of a mapped image.
pub struct LibraryHandle {
    path: PathBuf,
    image: Option<Box<dyn LoadedImage>>,
}

impl std::fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("path", &self.path)
            .field("mapped", &self.image.is_some())
            .finish()
    }
}

impl LibraryHandle {
    pub fn new(image: Box<dyn LoadedImage>) -> Self {
        Self {
            path: image.path().to_path_buf(),
            image: Some(image),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn symbol(&self, name: &str) -> Option<Symbol> {
        self.image.as_ref().and_then(|image| image.symbol(name))
    }

    pub fn construct(
        &self,
        context: &SandboxContext,
        metadata: &PluginMetadata,
    ) -> Result<Box<dyn Plugin>, PluginError> {
        match &self.image {
            Some(image) => image.construct(context, metadata),
            None => Err(PluginError::Runtime(format!(
                "{} is no longer mapped",
                self.path.display()
            ))),
        }
    }

    pub fn destroy(&self, instance: Box<dyn Plugin>) {
        match &self.image {
            Some(image) => image.destroy(instance),
            None => drop(instance),
        }
    }

    /// Release the image now.
    pub fn unload(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(image) = self.image.take() {
            tracing::trace!(path = %self.path.display(), "image unmapped");
            drop(image);
        }
    }
}

impl Drop for LibraryHandle {
    fn drop(&mut self) {
        self.release();
    }
}

// ─── WASM ───────────────────────────────────────────────────────────────

/// Loader for WASM plugin modules run by Extism.
#[derive(Debug, Default, Clone, Copy)]
pub struct WasmImageLoader;

impl WasmImageLoader {
    /// Validate WASM imports against the allowed namespace list and
    /// collect exported functions.
    fn scan_exports(wasm_bytes: &[u8]) -> Result<HashMap<String, u32>, PluginError> {
        use wasmparser::{ExternalKind, Parser, Payload};

        let mut exports = HashMap::new();

        for payload in Parser::new(0).parse_all(wasm_bytes) {
            let payload = payload
                .map_err(|e| PluginError::InvalidImage(format!("failed to parse WASM: {e}")))?;

            match payload {
                Payload::ImportSection(reader) => {
                    for import in reader {
                        let import = import.map_err(|e| {
                            PluginError::InvalidImage(format!("failed to read import: {e}"))
                        })?;

                        if !ALLOWED_IMPORT_NAMESPACES.contains(&import.module) {
                            return Err(PluginError::InvalidImage(format!(
                                "unauthorized import namespace: '{}' (function: '{}'); \
                                 allowed namespaces: {:?}",
                                import.module, import.name, ALLOWED_IMPORT_NAMESPACES
                            )));
                        }
                    }
                }
                Payload::ExportSection(reader) => {
                    for export in reader {
                        let export = export.map_err(|e| {
                            PluginError::InvalidImage(format!("failed to read export: {e}"))
                        })?;
                        if export.kind == ExternalKind::Func {
                            exports.insert(export.name.to_string(), export.index);
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(exports)
    }
}

impl ImageLoader for WasmImageLoader {
    fn map_image(&self, image: &PluginImage) -> Result<LibraryHandle, PluginError> {
        let bytes = image.bytes();

        if bytes.len() < WASM_MAGIC.len() || &bytes[..WASM_MAGIC.len()] != WASM_MAGIC {
            return Err(PluginError::InvalidImage(
                "invalid WASM binary: magic bytes mismatch".into(),
            ));
        }

        wasmparser::Validator::new()
            .validate_all(bytes)
            .map_err(|e| PluginError::InvalidImage(format!("WASM validation failed: {e}")))?;

        let exports = Self::scan_exports(bytes)?;

        for symbol in REQUIRED_SYMBOLS {
            if !exports.contains_key(symbol) {
                return Err(PluginError::MissingSymbol {
                    path: image.path().display().to_string(),
                    symbol: symbol.to_string(),
                });
            }
        }

        tracing::debug!(
            path = %image.path().display(),
            exports = exports.len(),
            "image mapped"
        );

        Ok(LibraryHandle::new(Box::new(WasmImage {
            path: image.path().to_path_buf(),
            bytes: image.shared_bytes(),
            exports,
        })))
    }
}

/// A validated WASM module ready for instantiation.
#[derive(Debug)]
pub struct WasmImage {
    path: PathBuf,
    bytes: Arc<[u8]>,
    exports: HashMap<String, u32>,
}

impl LoadedImage for WasmImage {
    fn path(&self) -> &Path {
        &self.path
    }

    fn symbol(&self, name: &str) -> Option<Symbol> {
        self.exports.get(name).map(|index| Symbol {
            name: name.to_string(),
            index: *index,
        })
    }

    /// Out of line, the module is reopened by a worker process when one
    /// is configured; the worker checks it still has the verified digest.
    fn construct(
        &self,
        context: &SandboxContext,
        metadata: &PluginMetadata,
    ) -> Result<Box<dyn Plugin>, PluginError> {
        if let Some(command) = &context.process {
            let module = ModuleSource {
                path: std::fs::canonicalize(&self.path)?,
                digest: signed_digest(&self.bytes)?,
                size: self.bytes.len() as u64,
            };
            let plugin = ProcessPlugin::spawn(
                command,
                module,
                &context.policy,
                metadata.clone(),
                context.call_timeout(),
            )?;
            return Ok(Box::new(plugin));
        }

        let bytes = Arc::clone(&self.bytes);
        let policy = context.policy.clone();
        let metadata = metadata.clone();
        context.construct(Box::new(move || {
            let plugin = WasmPlugin::instantiate(&bytes, &policy, metadata)?;
            Ok(Box::new(plugin) as Box<dyn Plugin>)
        }))
    }
}

// ─── WASM plugin ────────────────────────────────────────────────────────

/// A WASM module instance speaking the plugin contract.
///
/// `warden_construct` runs on instantiation and `warden_destroy` on drop.
#[derive(Debug)]
pub struct WasmPlugin {
    sandbox: PluginSandbox,
    metadata: PluginMetadata,
}

impl WasmPlugin {
    pub fn instantiate(
        wasm_bytes: &[u8],
        policy: &SandboxPolicy,
        metadata: PluginMetadata,
    ) -> Result<Self, PluginError> {
        let mut sandbox = PluginSandbox::build(wasm_bytes, policy, &metadata.name)?;
        sandbox.call(CONSTRUCT_SYMBOL, &[])?;
        Ok(Self { sandbox, metadata })
    }
}

impl Plugin for WasmPlugin {
    fn initialize(&mut self) -> bool {
        if !self.sandbox.has_function(INITIALIZE_EXPORT) {
            return true;
        }
        match self.sandbox.call(INITIALIZE_EXPORT, &[]) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(plugin = %self.metadata.name, "initialize failed: {e}");
                false
            }
        }
    }

    fn shutdown(&mut self) {
        if !self.sandbox.has_function(SHUTDOWN_EXPORT) {
            return;
        }
        if let Err(e) = self.sandbox.call(SHUTDOWN_EXPORT, &[]) {
            tracing::warn!(plugin = %self.metadata.name, "shutdown failed: {e}");
        }
    }

    fn name(&self) -> &str {
        &self.metadata.name
    }

    fn version(&self) -> &str {
        &self.metadata.version
    }

    fn metadata(&self) -> PluginMetadata {
        self.metadata.clone()
    }

    fn execute_operation(&mut self, operation: &str, params: &str) -> Option<String> {
        if !is_valid_operation_name(operation) {
            return None;
        }
        if serde_json::from_str::<serde_json::Value>(params).is_err() {
            return None;
        }

        let export = format!("{OPERATION_PREFIX}{operation}");
        if !self.sandbox.has_function(&export) {
            return None;
        }

        let output = match self.sandbox.call(&export, params.as_bytes()) {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(
                    plugin = %self.metadata.name,
                    operation = %operation,
                    "operation failed: {e}"
                );
                return None;
            }
        };

        if output.is_empty() {
            return Some("null".to_string());
        }
        String::from_utf8(output).ok()
    }
}

impl Drop for WasmPlugin {
    fn drop(&mut self) {
        if let Err(e) = self.sandbox.call(DESTROY_SYMBOL, &[]) {
            tracing::warn!(plugin = %self.metadata.name, "destroy failed: {e}");
        }
    }
}
