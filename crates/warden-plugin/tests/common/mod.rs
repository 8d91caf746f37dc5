// Shared test utilities for integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use warden_plugin::loader::Symbol;
use warden_plugin::{
    embed_descriptor, seal, HostConfig, ImageLoader, IsolationBackend, LibraryHandle,
    LoadedImage, MetadataExtractor, Plugin, PluginError, PluginImage, PluginMetadata,
    PluginRegistry, SandboxContext, SecurityEvent,
};

/// Ordered record of everything the mocks saw, e.g. `"shutdown:echo"`.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn entries(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn entries_for(log: &CallLog, plugin: &str) -> Vec<String> {
    let suffix = format!(":{plugin}");
    entries(log)
        .into_iter()
        .filter(|entry| entry.ends_with(&suffix))
        .collect()
}

// ─── Module fixtures ────────────────────────────────────────────────────

pub fn descriptor(name: &str) -> String {
    descriptor_with(name, "1.0.0", &[], "^1")
}

pub fn descriptor_with(name: &str, version: &str, dependencies: &[&str], api: &str) -> String {
    let deps = dependencies
        .iter()
        .map(|d| format!("\"{d}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "[plugin]\nname = \"{name}\"\nversion = \"{version}\"\nauthor = \"Test Author\"\n\
         description = \"Test plugin\"\ndependencies = [{deps}]\napi_version = \"{api}\"\n"
    )
}

pub fn unsigned_module(descriptor: &str) -> Vec<u8> {
    embed_descriptor(&wasm_encoder::Module::new().finish(), descriptor).unwrap()
}

/// Returns the sealed module bytes and its digest.
pub fn sealed_module(descriptor: &str) -> (Vec<u8>, String) {
    let sealed = seal(&unsigned_module(descriptor)).unwrap();
    (sealed.bytes, sealed.digest)
}

/// Flip one byte of the descriptor so the signature no longer matches.
pub fn tamper(mut bytes: Vec<u8>) -> Vec<u8> {
    let pos = bytes
        .windows(11)
        .position(|w| w == b"Test Author")
        .expect("descriptor present");
    bytes[pos] = b'B';
    bytes
}

// ─── Recording loader ───────────────────────────────────────────────────

/// How a mock plugin behaves, keyed by plugin name.
#[derive(Debug, Clone)]
pub struct Behavior {
    pub initialize: bool,
    pub panic_on_initialize: bool,
    pub panic_on_shutdown: bool,
    /// Block inside `shutdown` for this long.
    pub hang_on_shutdown: Option<Duration>,
    pub fail_construct: bool,
    pub reported_name: Option<String>,
    pub missing_symbol: Option<&'static str>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            initialize: true,
            panic_on_initialize: false,
            panic_on_shutdown: false,
            hang_on_shutdown: None,
            fail_construct: false,
            reported_name: None,
            missing_symbol: None,
        }
    }
}

#[derive(Default)]
pub struct RecordingLoader {
    pub log: CallLog,
    behaviors: Mutex<HashMap<String, Behavior>>,
    pub live_images: Arc<AtomicUsize>,
    pub live_instances: Arc<AtomicUsize>,
}

impl RecordingLoader {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    pub fn set_behavior(&self, plugin: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(plugin.to_string(), behavior);
    }

    fn behavior(&self, plugin: &str) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(plugin)
            .cloned()
            .unwrap_or_default()
    }
}

impl ImageLoader for RecordingLoader {
    fn map_image(&self, image: &PluginImage) -> Result<LibraryHandle, PluginError> {
        let metadata = MetadataExtractor::default().extract_image(image)?;
        self.log.lock().unwrap().push(format!("map:{}", metadata.name));
        self.live_images.fetch_add(1, Ordering::SeqCst);
        Ok(LibraryHandle::new(Box::new(MockImage {
            path: image.path().to_path_buf(),
            name: metadata.name.clone(),
            behavior: self.behavior(&metadata.name),
            log: Arc::clone(&self.log),
            live_images: Arc::clone(&self.live_images),
            live_instances: Arc::clone(&self.live_instances),
        })))
    }
}

struct MockImage {
    path: PathBuf,
    name: String,
    behavior: Behavior,
    log: CallLog,
    live_images: Arc<AtomicUsize>,
    live_instances: Arc<AtomicUsize>,
}

impl LoadedImage for MockImage {
    fn path(&self) -> &Path {
        &self.path
    }

    fn symbol(&self, name: &str) -> Option<Symbol> {
        if self.behavior.missing_symbol == Some(name) {
            return None;
        }
        Some(Symbol {
            name: name.to_string(),
            index: 0,
        })
    }

    fn construct(
        &self,
        context: &SandboxContext,
        metadata: &PluginMetadata,
    ) -> Result<Box<dyn Plugin>, PluginError> {
        let behavior = self.behavior.clone();
        let metadata = metadata.clone();
        let log = Arc::clone(&self.log);
        let live = Arc::clone(&self.live_instances);
        context.construct(Box::new(move || {
            if behavior.fail_construct {
                return Err(PluginError::Runtime("construct returned 1".into()));
            }
            log.lock().unwrap().push(format!("construct:{}", metadata.name));
            live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockPlugin {
                metadata,
                behavior,
                log,
                live,
            }) as Box<dyn Plugin>)
        }))
    }

    fn destroy(&self, instance: Box<dyn Plugin>) {
        self.log.lock().unwrap().push(format!("destroy:{}", self.name));
        drop(instance);
    }
}

impl Drop for MockImage {
    fn drop(&mut self) {
        self.log.lock().unwrap().push(format!("unload:{}", self.name));
        self.live_images.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockPlugin {
    metadata: PluginMetadata,
    behavior: Behavior,
    log: CallLog,
    live: Arc<AtomicUsize>,
}

impl MockPlugin {
    fn record(&self, what: &str) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{what}:{}", self.metadata.name));
    }
}

impl Plugin for MockPlugin {
    fn initialize(&mut self) -> bool {
        self.record("initialize");
        if self.behavior.panic_on_initialize {
            panic!("initialize exploded");
        }
        self.behavior.initialize
    }

    fn shutdown(&mut self) {
        self.record("shutdown");
        if let Some(delay) = self.behavior.hang_on_shutdown {
            std::thread::sleep(delay);
        }
        if self.behavior.panic_on_shutdown {
            panic!("shutdown exploded");
        }
    }

    fn name(&self) -> &str {
        self.behavior
            .reported_name
            .as_deref()
            .unwrap_or(&self.metadata.name)
    }

    fn version(&self) -> &str {
        &self.metadata.version
    }

    fn metadata(&self) -> PluginMetadata {
        self.metadata.clone()
    }

    fn execute_operation(&mut self, operation: &str, params: &str) -> Option<String> {
        self.record("execute");
        match operation {
            "echo" => Some(params.to_string()),
            "version" => Some(format!("\"{}\"", self.metadata.version)),
            "explode" => panic!("operation exploded"),
            _ => None,
        }
    }
}

impl Drop for MockPlugin {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

// ─── Recording isolation ────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingIsolation {
    pub log: CallLog,
    pub fail: AtomicBool,
}

impl RecordingIsolation {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            fail: AtomicBool::new(false),
        }
    }
}

impl IsolationBackend for RecordingIsolation {
    fn establish(&self, context: &SandboxContext) -> Result<(), PluginError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PluginError::Sandbox("namespace setup refused".into()));
        }
        self.log
            .lock()
            .unwrap()
            .push(format!("establish:{}", context.plugin_name));
        Ok(())
    }

    fn release(&self, context: &SandboxContext) {
        self.log
            .lock()
            .unwrap()
            .push(format!("release:{}", context.plugin_name));
    }
}

// ─── Harness ────────────────────────────────────────────────────────────

/// A registry wired to the recording mocks, with a temporary plugin
/// directory as its search path.
pub struct Harness {
    pub registry: PluginRegistry,
    pub loader: Arc<RecordingLoader>,
    pub isolation: Arc<RecordingIsolation>,
    pub log: CallLog,
    pub security: Arc<Mutex<Vec<SecurityEvent>>>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(HostConfig::default())
    }

    /// The search path is always replaced with the temporary directory.
    pub fn with_config(config: HostConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let log: CallLog = Arc::default();
        let loader = Arc::new(RecordingLoader::new(Arc::clone(&log)));
        let isolation = Arc::new(RecordingIsolation::new(Arc::clone(&log)));

        let config = HostConfig {
            search_paths: vec![dir.path().to_path_buf()],
            ..config
        };
        let registry = PluginRegistry::builder(config)
            .loader(loader.clone())
            .isolation(isolation.clone())
            .build()
            .unwrap();

        let security: Arc<Mutex<Vec<SecurityEvent>>> = Arc::default();
        let sink = Arc::clone(&security);
        registry.register_security_event_callback(move |event| {
            sink.lock().unwrap().push(event.clone());
        });

        Self {
            registry,
            loader,
            isolation,
            log,
            security,
            dir,
        }
    }

    pub fn write(&self, file: &str, bytes: &[u8]) -> PathBuf {
        let path = self.dir.path().join(file);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    /// Write a sealed module and trust its digest.
    pub fn trusted(&self, file: &str, descriptor: &str) -> PathBuf {
        let (bytes, digest) = sealed_module(descriptor);
        self.registry.trust_digest(&digest, Some(file.to_string())).unwrap();
        self.write(file, &bytes)
    }

    /// Sealed, trusted module for a plugin with default descriptor fields.
    pub fn plugin(&self, name: &str) -> PathBuf {
        self.trusted(&format!("{name}.wasm"), &descriptor(name))
    }

    pub fn security_events(&self) -> Vec<SecurityEvent> {
        self.security.lock().unwrap().clone()
    }

    pub fn live_images(&self) -> usize {
        self.loader.live_images.load(Ordering::SeqCst)
    }

    pub fn live_instances(&self) -> usize {
        self.loader.live_instances.load(Ordering::SeqCst)
    }
}
