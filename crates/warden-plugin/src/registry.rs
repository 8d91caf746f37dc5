//! Plugin registry: owns loaded plugins and runs the load pipeline.
//!
//! The `PluginRegistry` is the central orchestrator of the plugin host.
//! A load walks `Extracting → Verifying → Sandboxing → Loading →
//! Initializing → Active`; any failure rolls back every resource acquired
//! so far in reverse order, and only `Active` plugins are ever visible.
//!
//! Load, unload and reset are serialized by one admin mutex held across
//! the whole pipeline. Queries take the slot table's read lock just long
//! enough to copy what they need. Listeners and the event publisher run
//! after every lock has been released.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::HostConfig;
use crate::contract::{is_valid_operation_name, Plugin, PluginMetadata, HOST_API_VERSION};
use crate::error::PluginError;
use crate::events::{CallbackId, CallbackList, EventPublisher, LifecycleEvent, SecurityEvent};
use crate::isolation::{IsolationBackend, RuntimeIsolation, SandboxController};
use crate::loader::{ImageLoader, LibraryHandle, WasmImageLoader, REQUIRED_SYMBOLS};
use crate::metadata::MetadataExtractor;
use crate::package::PluginImage;
use crate::sandbox::SandboxLevel;
use crate::signature::{SignatureVerifier, TrustStore};

type InstanceCell = Arc<Mutex<Option<Box<dyn Plugin>>>>;

// ─── Stages ─────────────────────────────────────────────────────────────

/// Pipeline stage a load was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStage {
    Extracting,
    Verifying,
    Sandboxing,
    Loading,
    Initializing,
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Extracting => "extracting",
            Self::Verifying => "verifying",
            Self::Sandboxing => "sandboxing",
            Self::Loading => "loading",
            Self::Initializing => "initializing",
        };
        f.write_str(name)
    }
}

/// A failed load: where it failed and why.
struct Rejection {
    stage: LoadStage,
    plugin: Option<String>,
    error: PluginError,
}

/// Run plugin code with panics contained.
fn contained<R>(plugin: &str, during: &'static str, f: impl FnOnce() -> R) -> Result<R, PluginError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|_| PluginError::Panicked {
        plugin: plugin.to_string(),
        during,
    })
}

// ─── Records ────────────────────────────────────────────────────────────

/// The registry's unit of ownership for one active plugin.
///
/// Fields drop in declaration order: the instance cell goes before the
/// library handle. [`PluginRecord::teardown`] is the normal release path
/// and makes the full order explicit.
struct PluginRecord {
    instance: InstanceCell,
    library: LibraryHandle,
    sandbox_level: SandboxLevel,
    metadata: PluginMetadata,
    path: PathBuf,
    initialized: bool,
    sequence: u64,
    loaded_at: DateTime<Utc>,
}

impl PluginRecord {
    /// shutdown → destroy instance → destroy sandbox → unload library.
    ///
    /// Returns the reason if `shutdown` panicked. Release continues
    /// regardless.
    fn teardown(self, sandboxes: &SandboxController) -> Option<String> {
        let PluginRecord {
            instance,
            library,
            metadata,
            ..
        } = self;
        let name = metadata.name;

        let taken = instance.lock().unwrap_or_else(PoisonError::into_inner).take();
        let mut fault = None;

        if let Some(mut plugin) = taken {
            if let Err(e) = contained(&name, "shutdown", || plugin.shutdown()) {
                tracing::warn!(plugin = %name, "{e}; releasing resources anyway");
                fault = Some(e.to_string());
            }
            if let Err(e) = contained(&name, "destroy", || library.destroy(plugin)) {
                tracing::warn!(plugin = %name, "{e}");
            }
        }

        sandboxes.destroy_sandbox(&name);
        library.unload();
        fault
    }
}

/// Point-in-time view of one active plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginStatus {
    pub name: String,
    pub version: String,
    pub sandbox_level: SandboxLevel,
    pub path: PathBuf,
    pub initialized: bool,
    pub loaded_at: DateTime<Utc>,
}

// ─── Rollback ───────────────────────────────────────────────────────────

/// Resources acquired by an in-flight load.
///
/// Dropping an uncommitted transaction releases them in reverse order of
/// acquisition.
struct LoadTransaction<'a> {
    sandboxes: &'a SandboxController,
    plugin: Option<String>,
    sandbox: bool,
    library: Option<LibraryHandle>,
    instance: Option<Box<dyn Plugin>>,
}

impl<'a> LoadTransaction<'a> {
    fn new(sandboxes: &'a SandboxController) -> Self {
        Self {
            sandboxes,
            plugin: None,
            sandbox: false,
            library: None,
            instance: None,
        }
    }

    fn commit(mut self) -> Option<(Box<dyn Plugin>, LibraryHandle)> {
        self.sandbox = false;
        match (self.instance.take(), self.library.take()) {
            (Some(instance), Some(library)) => Some((instance, library)),
            _ => None,
        }
    }
}

impl Drop for LoadTransaction<'_> {
    fn drop(&mut self) {
        let name = self.plugin.clone().unwrap_or_default();

        if let Some(mut instance) = self.instance.take() {
            if let Err(e) = contained(&name, "shutdown", || instance.shutdown()) {
                tracing::warn!(plugin = %name, "{e} during rollback");
            }
            let library = self.library.as_ref();
            let destroyed = contained(&name, "destroy", move || match library {
                Some(library) => library.destroy(instance),
                None => drop(instance),
            });
            if let Err(e) = destroyed {
                tracing::warn!(plugin = %name, "{e} during rollback");
            }
        }

        if self.sandbox {
            self.sandboxes.destroy_sandbox(&name);
        }

        if let Some(library) = self.library.take() {
            library.unload();
        }
    }
}

// ─── Plugin references ──────────────────────────────────────────────────

/// Non-owning reference to an active plugin.
///
/// Every call returns `None` once the plugin has been unloaded; a
/// `PluginRef` never keeps an instance alive.
#[derive(Clone)]
pub struct PluginRef {
    name: String,
    instance: Weak<Mutex<Option<Box<dyn Plugin>>>>,
}

impl fmt::Debug for PluginRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRef")
            .field("name", &self.name)
            .field("active", &self.is_active())
            .finish()
    }
}

impl PluginRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.with_plugin(|_| ()).is_some()
    }

    pub fn version(&self) -> Option<String> {
        self.with_plugin(|plugin| plugin.version().to_string())
    }

    pub fn metadata(&self) -> Option<PluginMetadata> {
        self.with_plugin(|plugin| plugin.metadata())
    }

    pub fn execute_operation(&self, operation: &str, params: &str) -> Option<String> {
        let cell = self.instance.upgrade()?;
        invoke(&self.name, &cell, operation, params)
    }

    fn with_plugin<R>(&self, f: impl FnOnce(&mut dyn Plugin) -> R) -> Option<R> {
        let cell = self.instance.upgrade()?;
        let mut guard = cell.lock().unwrap_or_else(PoisonError::into_inner);
        let plugin = guard.as_mut()?;
        contained(&self.name, "metadata", || f(&mut **plugin)).ok()
    }
}

/// Dispatch an operation to an instance cell.
fn invoke(name: &str, cell: &Mutex<Option<Box<dyn Plugin>>>, operation: &str, params: &str) -> Option<String> {
    if !is_valid_operation_name(operation) {
        tracing::debug!(plugin = %name, operation = %operation, "invalid operation name");
        return None;
    }
    if serde_json::from_str::<serde_json::Value>(params).is_err() {
        tracing::debug!(plugin = %name, operation = %operation, "params are not valid JSON");
        return None;
    }

    let mut guard = cell.lock().unwrap_or_else(PoisonError::into_inner);
    let plugin = guard.as_mut()?;
    match contained(name, "execute_operation", || {
        plugin.execute_operation(operation, params)
    }) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(plugin = %name, operation = %operation, "{e}");
            None
        }
    }
}

// ─── Registry ───────────────────────────────────────────────────────────

/// Builder for a [`PluginRegistry`] with injected collaborators.
pub struct RegistryBuilder {
    config: HostConfig,
    loader: Arc<dyn ImageLoader>,
    isolation: Arc<dyn IsolationBackend>,
    trust_store: Option<TrustStore>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl RegistryBuilder {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            loader: Arc::new(WasmImageLoader),
            isolation: Arc::new(RuntimeIsolation),
            trust_store: None,
            publisher: None,
        }
    }

    pub fn loader(mut self, loader: Arc<dyn ImageLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn isolation(mut self, isolation: Arc<dyn IsolationBackend>) -> Self {
        self.isolation = isolation;
        self
    }

    /// Use this trust store instead of the one named in the config.
    pub fn trust_store(mut self, store: TrustStore) -> Self {
        self.trust_store = Some(store);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn build(self) -> Result<PluginRegistry, PluginError> {
        let store = match (self.trust_store, &self.config.trust_store) {
            (Some(store), _) => store,
            (None, Some(path)) => TrustStore::load(path)?,
            (None, None) => TrustStore::new(),
        };

        Ok(PluginRegistry {
            admin: Mutex::new(()),
            slots: RwLock::new(HashMap::new()),
            search_paths: RwLock::new(self.config.search_paths.clone()),
            recursive_discovery: self.config.recursive_discovery,
            default_sandbox: self.config.default_sandbox,
            next_sequence: AtomicU64::new(0),
            extractor: MetadataExtractor::new(self.config.max_image_size),
            verifier: SignatureVerifier::new(store),
            sandboxes: SandboxController::new(self.config.sandbox, self.isolation),
            loader: self.loader,
            publisher: self.publisher,
            next_callback_id: AtomicU64::new(1),
            loaded_callbacks: CallbackList::new(),
            unloading_callbacks: CallbackList::new(),
            unloaded_callbacks: CallbackList::new(),
            security_callbacks: CallbackList::new(),
        })
    }
}

/// Central plugin registry.
///
/// Owns every active plugin: at most one per name. Thread-safe; all
/// operations are synchronous.
pub struct PluginRegistry {
    /// Serializes load, unload and reset.
    admin: Mutex<()>,
    /// Active plugins by name.
    slots: RwLock<HashMap<String, PluginRecord>>,
    search_paths: RwLock<Vec<PathBuf>>,
    recursive_discovery: bool,
    default_sandbox: SandboxLevel,
    next_sequence: AtomicU64,
    extractor: MetadataExtractor,
    verifier: SignatureVerifier,
    sandboxes: SandboxController,
    loader: Arc<dyn ImageLoader>,
    publisher: Option<Arc<dyn EventPublisher>>,
    next_callback_id: AtomicU64,
    loaded_callbacks: CallbackList<str>,
    unloading_callbacks: CallbackList<str>,
    unloaded_callbacks: CallbackList<str>,
    security_callbacks: CallbackList<SecurityEvent>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("loaded", &self.get_loaded_plugins())
            .field("default_sandbox", &self.default_sandbox)
            .finish_non_exhaustive()
    }
}

impl PluginRegistry {
    /// Create a registry with the WASM loader and runtime isolation.
    ///
    /// Loads the trust store named in `config`, if any. Does NOT load
    /// plugins.
    pub fn new(config: HostConfig) -> Result<Self, PluginError> {
        RegistryBuilder::new(config).build()
    }

    pub fn builder(config: HostConfig) -> RegistryBuilder {
        RegistryBuilder::new(config)
    }

    fn admin_lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.admin.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_slots(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, PluginRecord>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slots(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, PluginRecord>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Load ─────────────────────────────────────────────────────────

    /// Load the plugin at `path` under `level`. Returns `true` on success.
    pub fn load_plugin(&self, path: impl AsRef<Path>, level: SandboxLevel) -> bool {
        self.try_load_plugin(path, level).is_ok()
    }

    /// Load the plugin at `path` under `level`.
    ///
    /// On success the plugin is active, `PluginLoaded` has been published
    /// and load callbacks have run. On failure the registry is exactly as
    /// it was before the call.
    pub fn try_load_plugin(
        &self,
        path: impl AsRef<Path>,
        level: SandboxLevel,
    ) -> Result<PluginMetadata, PluginError> {
        let path = path.as_ref();

        let outcome = {
            let _admin = self.admin_lock();
            self.run_load_pipeline(path, level)
        };

        match outcome {
            Ok(metadata) => {
                tracing::info!(
                    plugin = %metadata.name,
                    version = %metadata.version,
                    level = %level,
                    "plugin loaded"
                );
                self.publish(LifecycleEvent::PluginLoaded {
                    name: metadata.name.clone(),
                    version: metadata.version.clone(),
                });
                self.loaded_callbacks.notify(&metadata.name);
                Ok(metadata)
            }
            Err(rejection) => {
                tracing::warn!(
                    path = %path.display(),
                    plugin = ?rejection.plugin,
                    stage = %rejection.stage,
                    kind = ?rejection.error.kind(),
                    "plugin load rejected: {}",
                    rejection.error
                );
                self.security_callbacks.notify(&SecurityEvent::LoadRejected {
                    path: path.to_path_buf(),
                    plugin: rejection.plugin,
                    stage: rejection.stage,
                    kind: rejection.error.kind(),
                    reason: rejection.error.to_string(),
                });
                Err(rejection.error)
            }
        }
    }

    /// Extracting → Verifying → Sandboxing → Loading → Initializing.
    ///
    /// Must be called with the admin lock held.
    fn run_load_pipeline(&self, path: &Path, level: SandboxLevel) -> Result<PluginMetadata, Rejection> {
        let mut stage = LoadStage::Extracting;
        let mut plugin: Option<String> = None;
        let reject = |stage: LoadStage, plugin: &Option<String>| {
            let plugin = plugin.clone();
            move |error: PluginError| Rejection {
                stage,
                plugin,
                error,
            }
        };

        // ── Extracting ───────────────────────────────────────────────
        tracing::debug!(path = %path.display(), "extracting plugin metadata");
        let image = PluginImage::read(path, self.extractor.max_image_size())
            .map_err(reject(stage, &plugin))?;
        let metadata = self
            .extractor
            .extract_image(&image)
            .map_err(reject(stage, &plugin))?;
        let name = metadata.name.clone();
        plugin = Some(name.clone());
        self.check_admissible(&metadata)
            .map_err(reject(stage, &plugin))?;

        // ── Verifying ────────────────────────────────────────────────
        stage = LoadStage::Verifying;
        tracing::debug!(plugin = %name, "verifying signature");
        let metadata = self
            .verifier
            .verify(&image, metadata)
            .map_err(reject(stage, &plugin))?;

        // ── Sandboxing ───────────────────────────────────────────────
        stage = LoadStage::Sandboxing;
        tracing::debug!(plugin = %name, level = %level, "creating sandbox");
        let mut txn = LoadTransaction::new(&self.sandboxes);
        txn.plugin = Some(name.clone());
        self.sandboxes
            .create_sandbox(&name, level)
            .map_err(reject(stage, &plugin))?;
        txn.sandbox = true;
        let context = self.sandboxes.context(&name).ok_or_else(|| {
            reject(stage, &plugin)(PluginError::Sandbox(format!(
                "sandbox for {name} vanished"
            )))
        })?;

        // ── Loading ──────────────────────────────────────────────────
        stage = LoadStage::Loading;
        tracing::debug!(plugin = %name, "mapping image");
        let library = self.loader.map_image(&image).map_err(reject(stage, &plugin))?;
        let library = txn.library.insert(library);
        for symbol in REQUIRED_SYMBOLS {
            if library.symbol(symbol).is_none() {
                return Err(reject(stage, &plugin)(PluginError::MissingSymbol {
                    path: path.display().to_string(),
                    symbol: symbol.to_string(),
                }));
            }
        }

        let instance = contained(&name, "construct", || library.construct(&context, &metadata))
            .and_then(|built| built)
            .map_err(reject(stage, &plugin))?;
        let instance = txn.instance.insert(instance);

        let reported = contained(&name, "name", || instance.name().to_string())
            .map_err(reject(stage, &plugin))?;
        if reported != name {
            return Err(reject(stage, &plugin)(PluginError::MalformedMetadata(format!(
                "plugin reports name '{reported}' but its descriptor declares '{name}'"
            ))));
        }

        // ── Initializing ─────────────────────────────────────────────
        stage = LoadStage::Initializing;
        tracing::debug!(plugin = %name, "initializing");
        let initialized = contained(&name, "initialize", || instance.initialize())
            .map_err(reject(stage, &plugin))?;
        if !initialized {
            return Err(reject(stage, &plugin)(PluginError::InitializationFailed(
                name.clone(),
            )));
        }

        // ── Active ───────────────────────────────────────────────────
        let Some((instance, library)) = txn.commit() else {
            return Err(reject(stage, &plugin)(PluginError::Runtime(
                "load transaction lost its resources".into(),
            )));
        };

        let record = PluginRecord {
            instance: Arc::new(Mutex::new(Some(instance))),
            library,
            sandbox_level: level,
            metadata: metadata.clone(),
            path: path.to_path_buf(),
            initialized: true,
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            loaded_at: Utc::now(),
        };
        self.write_slots().insert(name, record);

        Ok(metadata)
    }

    /// Duplicate name, API compatibility and dependency checks.
    fn check_admissible(&self, metadata: &PluginMetadata) -> Result<(), PluginError> {
        let slots = self.read_slots();

        if slots.contains_key(&metadata.name) {
            return Err(PluginError::AlreadyLoaded(metadata.name.clone()));
        }

        if !metadata.is_api_compatible() {
            return Err(PluginError::IncompatibleApi {
                plugin: metadata.name.clone(),
                required: metadata.api_version.clone(),
                provided: HOST_API_VERSION.to_string(),
            });
        }

        if let Some(missing) = metadata
            .dependencies
            .iter()
            .find(|dependency| !slots.contains_key(dependency.as_str()))
        {
            return Err(PluginError::MissingDependency {
                plugin: metadata.name.clone(),
                dependency: missing.clone(),
            });
        }

        Ok(())
    }

    // ── Unload ───────────────────────────────────────────────────────

    /// Unload an active plugin. Returns `false` if it was not loaded.
    pub fn unload_plugin(&self, name: &str) -> bool {
        self.try_unload_plugin(name).is_ok()
    }

    /// Unload an active plugin.
    ///
    /// Order: unloading callbacks (the plugin is still active and
    /// callable), shutdown, destroy instance, destroy sandbox, unload
    /// library, publish `PluginUnloaded`, unloaded callbacks. A panicking
    /// `shutdown` is reported but never stops the release.
    pub fn try_unload_plugin(&self, name: &str) -> Result<(), PluginError> {
        if !self.is_plugin_loaded(name) {
            return Err(PluginError::NotFound(name.to_string()));
        }
        self.unloading_callbacks.notify(name);

        let fault = {
            let _admin = self.admin_lock();
            let record = self
                .write_slots()
                .remove(name)
                .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
            record.teardown(&self.sandboxes)
        };

        tracing::info!(plugin = %name, "plugin unloaded");
        self.announce_unloaded(name, fault);
        Ok(())
    }

    fn announce_unloaded(&self, name: &str, fault: Option<String>) {
        if let Some(reason) = fault {
            self.security_callbacks.notify(&SecurityEvent::ShutdownFault {
                plugin: name.to_string(),
                reason,
            });
        }
        self.publish(LifecycleEvent::PluginUnloaded {
            name: name.to_string(),
        });
        self.unloaded_callbacks.notify(name);
    }

    /// Unload every plugin in reverse load order.
    ///
    /// Unloading callbacks run first for every plugin active when the
    /// reset started, in the same order.
    pub fn reset(&self) {
        let mut active: Vec<(u64, String)> = self
            .read_slots()
            .values()
            .map(|record| (record.sequence, record.metadata.name.clone()))
            .collect();
        active.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, name) in &active {
            self.unloading_callbacks.notify(name);
        }

        let unloaded: Vec<(String, Option<String>)> = {
            let _admin = self.admin_lock();
            let mut records: Vec<PluginRecord> =
                self.write_slots().drain().map(|(_, record)| record).collect();
            records.sort_by(|a, b| b.sequence.cmp(&a.sequence));

            records
                .into_iter()
                .map(|record| {
                    let name = record.metadata.name.clone();
                    let fault = record.teardown(&self.sandboxes);
                    (name, fault)
                })
                .collect()
        };

        if !unloaded.is_empty() {
            tracing::info!(count = unloaded.len(), "registry reset");
        }
        for (name, fault) in unloaded {
            self.announce_unloaded(&name, fault);
        }
    }

    fn publish(&self, event: LifecycleEvent) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        let name = event.plugin_name().to_string();
        match contained(&name, "publish", || publisher.publish(event)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) | Err(e) => {
                tracing::warn!(plugin = %name, "lifecycle event not delivered: {e}");
            }
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn is_plugin_loaded(&self, name: &str) -> bool {
        self.read_slots().contains_key(name)
    }

    pub fn get_plugin(&self, name: &str) -> Option<PluginRef> {
        self.read_slots().get(name).map(|record| PluginRef {
            name: name.to_string(),
            instance: Arc::downgrade(&record.instance),
        })
    }

    pub fn get_plugin_metadata(&self, name: &str) -> Option<PluginMetadata> {
        self.read_slots().get(name).map(|record| record.metadata.clone())
    }

    /// Names of active plugins in load order.
    pub fn get_loaded_plugins(&self) -> Vec<String> {
        let slots = self.read_slots();
        let mut entries: Vec<(u64, &String)> =
            slots.iter().map(|(name, record)| (record.sequence, name)).collect();
        entries.sort_by_key(|(sequence, _)| *sequence);
        entries.into_iter().map(|(_, name)| name.clone()).collect()
    }

    /// Status of active plugins in load order.
    pub fn plugin_statuses(&self) -> Vec<PluginStatus> {
        let slots = self.read_slots();
        let mut records: Vec<&PluginRecord> = slots.values().collect();
        records.sort_by_key(|record| record.sequence);
        records
            .into_iter()
            .map(|record| PluginStatus {
                name: record.metadata.name.clone(),
                version: record.metadata.version.clone(),
                sandbox_level: record.sandbox_level,
                path: record.path.clone(),
                initialized: record.initialized,
                loaded_at: record.loaded_at,
            })
            .collect()
    }

    /// Run an operation on an active plugin.
    ///
    /// `None` when the plugin is not active or the operation failed.
    pub fn execute_plugin_operation(
        &self,
        name: &str,
        operation: &str,
        params: &str,
    ) -> Option<String> {
        let cell = {
            let slots = self.read_slots();
            Arc::clone(&slots.get(name)?.instance)
        };
        invoke(name, &cell, operation, params)
    }

    pub fn default_sandbox_level(&self) -> SandboxLevel {
        self.default_sandbox
    }

    // ── Discovery ────────────────────────────────────────────────────

    /// Metadata of every readable plugin on the search path.
    ///
    /// Only reads descriptors: nothing is verified, loaded or run.
    pub fn discover_plugins(&self) -> Vec<PluginMetadata> {
        let search_paths = self
            .search_paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut found = Vec::new();
        for dir in &search_paths {
            for path in collect_candidates(dir, self.recursive_discovery) {
                match self.extractor.extract(&path) {
                    Ok(metadata) => found.push(metadata),
                    Err(e) => {
                        tracing::debug!(path = %path.display(), "skipping: {e}");
                    }
                }
            }
        }
        found
    }

    pub fn set_plugin_search_path(&self, path: impl Into<PathBuf>) {
        self.set_plugin_search_paths(vec![path.into()]);
    }

    pub fn set_plugin_search_paths(&self, paths: Vec<PathBuf>) {
        *self
            .search_paths
            .write()
            .unwrap_or_else(PoisonError::into_inner) = paths;
    }

    pub fn plugin_search_paths(&self) -> Vec<PathBuf> {
        self.search_paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ── Callbacks ────────────────────────────────────────────────────

    fn next_callback_id(&self) -> CallbackId {
        self.next_callback_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Called with the plugin name after every successful load.
    pub fn register_plugin_loaded_callback(
        &self,
        callback: impl Fn(&str) + Send + Sync + 'static,
    ) -> CallbackId {
        let id = self.next_callback_id();
        self.loaded_callbacks.register(id, Arc::new(callback));
        id
    }

    /// Called with the plugin name right before an unload starts, while
    /// the plugin is still queryable and callable.
    pub fn register_plugin_unloading_callback(
        &self,
        callback: impl Fn(&str) + Send + Sync + 'static,
    ) -> CallbackId {
        let id = self.next_callback_id();
        self.unloading_callbacks.register(id, Arc::new(callback));
        id
    }

    /// Called with the plugin name after every unload.
    pub fn register_plugin_unloaded_callback(
        &self,
        callback: impl Fn(&str) + Send + Sync + 'static,
    ) -> CallbackId {
        let id = self.next_callback_id();
        self.unloaded_callbacks.register(id, Arc::new(callback));
        id
    }

    /// Called with diagnostics for rejected loads and shutdown faults.
    pub fn register_security_event_callback(
        &self,
        callback: impl Fn(&SecurityEvent) + Send + Sync + 'static,
    ) -> CallbackId {
        let id = self.next_callback_id();
        self.security_callbacks.register(id, Arc::new(callback));
        id
    }

    /// Remove a listener from whichever list holds it.
    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        self.loaded_callbacks.remove(id)
            | self.unloading_callbacks.remove(id)
            | self.unloaded_callbacks.remove(id)
            | self.security_callbacks.remove(id)
    }

    // ── Trust ────────────────────────────────────────────────────────

    /// Whether the file at `path` carries a valid, trusted signature.
    /// Nothing is loaded.
    pub fn verify_plugin_signature(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let verified = PluginImage::read(path, self.extractor.max_image_size()).and_then(|image| {
            let metadata = self.extractor.extract_image(&image)?;
            self.verifier.verify(&image, metadata)
        });
        match verified {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(path = %path.display(), "signature check failed: {e}");
                false
            }
        }
    }

    pub fn trust_digest(&self, digest: &str, label: Option<String>) -> Result<(), PluginError> {
        self.verifier.trust(digest, label)
    }

    pub fn revoke_digest(&self, digest: &str) -> bool {
        self.verifier.revoke(digest)
    }

    pub fn trust_store(&self) -> TrustStore {
        self.verifier.snapshot()
    }

    /// Number of live isolation contexts.
    pub fn active_sandboxes(&self) -> usize {
        self.sandboxes.active_count()
    }
}

impl Drop for PluginRegistry {
    fn drop(&mut self) {
        self.reset();
    }
}

/// `.wasm` files in `dir`, sorted; subdirectories only when `recursive`.
fn collect_candidates(dir: &Path, recursive: bool) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(path = %current.display(), "cannot read search directory: {e}");
                continue;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                if recursive {
                    pending.push(path);
                }
            } else if path.extension().is_some_and(|ext| ext == "wasm") {
                candidates.push(path);
            }
        }
    }

    candidates.sort();
    candidates
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_stage_display_and_serde() {
        assert_eq!(LoadStage::Sandboxing.to_string(), "sandboxing");
        assert_eq!(
            serde_json::to_value(LoadStage::Initializing).unwrap(),
            "initializing"
        );
    }

    #[test]
    fn test_collect_candidates_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.wasm"), b"").unwrap();
        std::fs::write(dir.path().join("a.wasm"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("c.wasm"), b"").unwrap();

        let flat = collect_candidates(dir.path(), false);
        assert_eq!(
            flat,
            vec![dir.path().join("a.wasm"), dir.path().join("b.wasm")]
        );

        let deep = collect_candidates(dir.path(), true);
        assert_eq!(deep.len(), 3);
        assert!(deep.contains(&dir.path().join("nested").join("c.wasm")));
    }

    #[test]
    fn test_collect_candidates_missing_directory() {
        assert!(collect_candidates(Path::new("/nonexistent/plugins"), false).is_empty());
    }

    #[test]
    fn test_contained_reports_panics() {
        let err = contained("sample", "initialize", || panic!("boom")).unwrap_err();
        assert!(matches!(
            err,
            PluginError::Panicked {
                during: "initialize",
                ..
            }
        ));
        assert_eq!(contained("sample", "initialize", || 7).unwrap(), 7);
    }

    #[test]
    fn test_empty_registry_queries() {
        let registry = PluginRegistry::new(HostConfig::default()).unwrap();
        assert!(!registry.is_plugin_loaded("sample"));
        assert!(registry.get_plugin("sample").is_none());
        assert!(registry.get_plugin_metadata("sample").is_none());
        assert!(registry.get_loaded_plugins().is_empty());
        assert!(registry.plugin_statuses().is_empty());
        assert_eq!(
            registry.execute_plugin_operation("sample", "echo", "{}"),
            None
        );
        assert!(!registry.unload_plugin("sample"));
        assert!(matches!(
            registry.try_unload_plugin("sample"),
            Err(PluginError::NotFound(_))
        ));
    }

    #[test]
    fn test_callback_ids_are_unique_and_removable() {
        let registry = PluginRegistry::new(HostConfig::default()).unwrap();
        let a = registry.register_plugin_loaded_callback(|_| {});
        let b = registry.register_plugin_unloaded_callback(|_| {});
        let c = registry.register_security_event_callback(|_| {});
        assert!(a != b && b != c && a != c);
        assert!(registry.unregister_callback(b));
        assert!(!registry.unregister_callback(b));
        assert!(registry.unregister_callback(a));
        assert!(registry.unregister_callback(c));
    }

    #[test]
    fn test_search_path_setters() {
        let registry = PluginRegistry::new(HostConfig::default()).unwrap();
        registry.set_plugin_search_path("/opt/plugins");
        assert_eq!(
            registry.plugin_search_paths(),
            vec![PathBuf::from("/opt/plugins")]
        );
        registry.set_plugin_search_paths(vec!["/a".into(), "/b".into()]);
        assert_eq!(registry.plugin_search_paths().len(), 2);
    }

    #[test]
    fn test_missing_trust_store_file_fails_build() {
        let config = HostConfig {
            trust_store: Some(PathBuf::from("/nonexistent/trust.toml")),
            ..HostConfig::default()
        };
        assert!(PluginRegistry::new(config).is_err());
    }
}
