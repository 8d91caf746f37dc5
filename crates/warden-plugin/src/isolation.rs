//! Sandbox controller and isolation backends.
//!
//! The controller owns one isolation context per plugin name. At
//! `process` and above a plugin runs out of line: modules the loader can
//! reopen by path go to a worker process (see [`crate::process`]), and
//! anything built from an in-memory factory runs on a dedicated worker
//! thread. Either way every call crosses a message-passing shim and is
//! bounded by the policy's call timeout.
//!
//! The worker thread is the in-process fallback. It contains panics and
//! hangs but shares the host's address space.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::contract::{Plugin, PluginMetadata};
use crate::error::PluginError;
use crate::process::WorkerCommand;
use crate::sandbox::{
    FsAccess, SandboxConfig, SandboxLevel, SandboxPolicy, DEFAULT_CALL_TIMEOUT_SECS,
};

/// Builds a plugin instance inside its isolation context.
pub type PluginFactory = Box<dyn FnOnce() -> Result<Box<dyn Plugin>, PluginError> + Send>;

// ─── Backends ───────────────────────────────────────────────────────────

/// Establishes and releases the OS- or runtime-level side of a sandbox.
pub trait IsolationBackend: Send + Sync {
    fn establish(&self, context: &SandboxContext) -> Result<(), PluginError>;

    /// Must tolerate being called for a context whose establishment
    /// partially failed.
    fn release(&self, context: &SandboxContext);
}

/// Default backend: the WASM runtime enforces the policy; this backend
/// checks the policy can be honored before anything is instantiated.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuntimeIsolation;

impl IsolationBackend for RuntimeIsolation {
    fn establish(&self, context: &SandboxContext) -> Result<(), PluginError> {
        if let FsAccess::AllowList(paths) = &context.policy.filesystem {
            for path in paths {
                if !path.is_dir() {
                    return Err(PluginError::Sandbox(format!(
                        "allow-listed path is not a directory: {}",
                        path.display()
                    )));
                }
            }
        }

        tracing::debug!(
            plugin = %context.plugin_name,
            level = %context.level,
            out_of_line = context.policy.out_of_line,
            "sandbox established"
        );
        Ok(())
    }

    fn release(&self, context: &SandboxContext) {
        tracing::debug!(plugin = %context.plugin_name, "sandbox released");
    }
}

// ─── Context ────────────────────────────────────────────────────────────

/// Isolation context handed to the loader when constructing an instance.
#[derive(Debug, Clone)]
pub struct SandboxContext {
    pub plugin_name: String,
    pub level: SandboxLevel,
    pub policy: SandboxPolicy,
    /// Present when the policy runs the plugin out of line.
    pub worker: Option<WorkerClient>,
    /// Worker process for out-of-line modules, when one is configured.
    pub process: Option<WorkerCommand>,
}

impl SandboxContext {
    /// Bound on every out-of-line call.
    pub fn call_timeout(&self) -> Duration {
        self.policy
            .call_timeout
            .unwrap_or(Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS))
    }

    /// Construct an instance inside this context.
    ///
    /// With an isolation worker the factory runs on the worker thread and
    /// the caller gets an [`IsolatedPlugin`] proxy; otherwise it runs
    /// here.
    pub fn construct(&self, factory: PluginFactory) -> Result<Box<dyn Plugin>, PluginError> {
        match &self.worker {
            Some(worker) => Ok(Box::new(IsolatedPlugin::construct(worker.clone(), factory)?)),
            None => factory(),
        }
    }
}

// ─── Worker ─────────────────────────────────────────────────────────────

enum Request {
    Construct {
        factory: PluginFactory,
        reply: mpsc::Sender<Result<PluginMetadata, PluginError>>,
    },
    Initialize {
        reply: mpsc::Sender<bool>,
    },
    Shutdown {
        reply: mpsc::Sender<Result<(), PluginError>>,
    },
    Execute {
        operation: String,
        params: String,
        reply: mpsc::Sender<Option<String>>,
    },
    Destroy {
        reply: mpsc::Sender<()>,
    },
    Stop,
}

/// Sending side of an isolation worker.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    plugin_name: String,
    sender: mpsc::Sender<Request>,
    timeout: Duration,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Construct { .. } => "Construct",
            Self::Initialize { .. } => "Initialize",
            Self::Shutdown { .. } => "Shutdown",
            Self::Execute { .. } => "Execute",
            Self::Destroy { .. } => "Destroy",
            Self::Stop => "Stop",
        };
        f.write_str(name)
    }
}

impl WorkerClient {
    /// Send a request and wait for its reply, up to the call timeout.
    fn request<T>(
        &self,
        make: impl FnOnce(mpsc::Sender<T>) -> Request,
    ) -> Result<T, PluginError> {
        let (reply, response) = mpsc::channel();
        self.sender.send(make(reply)).map_err(|_| {
            PluginError::Sandbox(format!("isolation worker for {} is gone", self.plugin_name))
        })?;

        response.recv_timeout(self.timeout).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => PluginError::Timeout(self.plugin_name.clone()),
            mpsc::RecvTimeoutError::Disconnected => PluginError::Sandbox(format!(
                "isolation worker for {} stopped before replying",
                self.plugin_name
            )),
        })
    }

    fn stop(&self) {
        let _ = self.sender.send(Request::Stop);
    }
}

/// Host-side ownership of a worker thread.
struct WorkerThread {
    handle: JoinHandle<()>,
    /// Signalled, or disconnected, once the worker loop has exited.
    done: mpsc::Receiver<()>,
}

fn spawn_worker(
    plugin_name: &str,
    timeout: Duration,
) -> Result<(WorkerClient, WorkerThread), PluginError> {
    let (sender, requests) = mpsc::channel();
    let (finished, done) = mpsc::channel();
    let name = plugin_name.to_string();
    let handle = std::thread::Builder::new()
        .name(format!("warden-sandbox-{plugin_name}"))
        .spawn(move || run_worker(&name, requests, finished))
        .map_err(|e| PluginError::Sandbox(format!("failed to spawn isolation worker: {e}")))?;

    Ok((
        WorkerClient {
            plugin_name: plugin_name.to_string(),
            sender,
            timeout,
        },
        WorkerThread { handle, done },
    ))
}

fn run_worker(plugin_name: &str, requests: mpsc::Receiver<Request>, finished: mpsc::Sender<()>) {
    let mut instance: Option<Box<dyn Plugin>> = None;
    tracing::trace!(plugin = %plugin_name, "isolation worker started");

    while let Ok(request) = requests.recv() {
        match request {
            Request::Construct { factory, reply } => {
                let built = catch_unwind(AssertUnwindSafe(factory)).unwrap_or_else(|_| {
                    Err(PluginError::Panicked {
                        plugin: plugin_name.to_string(),
                        during: "construct",
                    })
                });
                let outcome = built.map(|plugin| {
                    let metadata = plugin.metadata();
                    instance = Some(plugin);
                    metadata
                });
                let _ = reply.send(outcome);
            }
            Request::Initialize { reply } => {
                let ok = match instance.as_mut() {
                    Some(plugin) => {
                        catch_unwind(AssertUnwindSafe(|| plugin.initialize())).unwrap_or(false)
                    }
                    None => false,
                };
                let _ = reply.send(ok);
            }
            Request::Shutdown { reply } => {
                let outcome = match instance.as_mut() {
                    Some(plugin) => catch_unwind(AssertUnwindSafe(|| plugin.shutdown())).map_err(
                        |_| PluginError::Panicked {
                            plugin: plugin_name.to_string(),
                            during: "shutdown",
                        },
                    ),
                    None => Ok(()),
                };
                let _ = reply.send(outcome);
            }
            Request::Execute {
                operation,
                params,
                reply,
            } => {
                let result = instance.as_mut().and_then(|plugin| {
                    catch_unwind(AssertUnwindSafe(|| {
                        plugin.execute_operation(&operation, &params)
                    }))
                    .unwrap_or(None)
                });
                let _ = reply.send(result);
            }
            Request::Destroy { reply } => {
                if let Some(plugin) = instance.take() {
                    if catch_unwind(AssertUnwindSafe(move || drop(plugin))).is_err() {
                        tracing::warn!(plugin = %plugin_name, "plugin panicked while being destroyed");
                    }
                }
                let _ = reply.send(());
            }
            Request::Stop => break,
        }
    }

    if let Some(plugin) = instance.take() {
        let _ = catch_unwind(AssertUnwindSafe(move || drop(plugin)));
    }
    tracing::trace!(plugin = %plugin_name, "isolation worker stopped");
    let _ = finished.send(());
}

// ─── Proxy ──────────────────────────────────────────────────────────────

/// Host-side proxy for a plugin living on an isolation worker.
///
/// Dropping the proxy destroys the remote instance.
#[derive(Debug)]
pub struct IsolatedPlugin {
    worker: WorkerClient,
    metadata: PluginMetadata,
}

impl IsolatedPlugin {
    pub fn construct(worker: WorkerClient, factory: PluginFactory) -> Result<Self, PluginError> {
        let metadata =
            worker.request(|reply| Request::Construct { factory, reply })??;
        Ok(Self { worker, metadata })
    }
}

impl Plugin for IsolatedPlugin {
    fn initialize(&mut self) -> bool {
        self.worker
            .request(|reply| Request::Initialize { reply })
            .unwrap_or_else(|e| {
                tracing::warn!(plugin = %self.metadata.name, "initialize failed: {e}");
                false
            })
    }

    fn shutdown(&mut self) {
        match self.worker.request(|reply| Request::Shutdown { reply }) {
            Ok(Ok(())) => {}
            // Contained on the worker; surface it to the host's own guard.
            Ok(Err(PluginError::Panicked { plugin, during })) => std::panic::resume_unwind(
                Box::new(format!("plugin {plugin} panicked during {during}")),
            ),
            Ok(Err(e)) | Err(e) => {
                tracing::warn!(plugin = %self.metadata.name, "shutdown failed: {e}");
            }
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
        let operation = operation.to_string();
        let params = params.to_string();
        self.worker
            .request(|reply| Request::Execute {
                operation,
                params,
                reply,
            })
            .unwrap_or_else(|e| {
                tracing::warn!(plugin = %self.metadata.name, "operation failed: {e}");
                None
            })
    }
}

impl Drop for IsolatedPlugin {
    fn drop(&mut self) {
        if let Err(e) = self.worker.request(|reply| Request::Destroy { reply }) {
            tracing::warn!(plugin = %self.metadata.name, "remote destroy failed: {e}");
        }
    }
}

// ─── Controller ─────────────────────────────────────────────────────────

struct SandboxEntry {
    context: SandboxContext,
    worker: Option<WorkerThread>,
}

/// Owns the isolation contexts of every plugin, keyed by name.
pub struct SandboxController {
    config: SandboxConfig,
    backend: Arc<dyn IsolationBackend>,
    sandboxes: Mutex<HashMap<String, SandboxEntry>>,
}

impl std::fmt::Debug for SandboxController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxController")
            .field("config", &self.config)
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

impl SandboxController {
    pub fn new(config: SandboxConfig, backend: Arc<dyn IsolationBackend>) -> Self {
        Self {
            config,
            backend,
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Establish an isolation context for `plugin_name` at `level`.
    pub fn create_sandbox(&self, plugin_name: &str, level: SandboxLevel) -> Result<(), PluginError> {
        let mut sandboxes = self.sandboxes.lock().unwrap_or_else(PoisonError::into_inner);
        if sandboxes.contains_key(plugin_name) {
            return Err(PluginError::Sandbox(format!(
                "sandbox for {plugin_name} already exists"
            )));
        }

        let policy = SandboxPolicy::for_level(level, &self.config);
        let (worker, handle) = if policy.out_of_line {
            let timeout = policy
                .call_timeout
                .unwrap_or(Duration::from_secs(self.config.call_timeout_secs));
            let (client, handle) = spawn_worker(plugin_name, timeout)?;
            (Some(client), Some(handle))
        } else {
            (None, None)
        };

        let process = if policy.out_of_line {
            if self.config.worker.is_none() {
                tracing::warn!(
                    plugin = %plugin_name,
                    level = %level,
                    "no worker process configured; plugin runs on an in-process worker thread"
                );
            }
            self.config.worker.clone()
        } else {
            None
        };

        let context = SandboxContext {
            plugin_name: plugin_name.to_string(),
            level,
            policy,
            worker,
            process,
        };

        if let Err(e) = self.backend.establish(&context) {
            self.backend.release(&context);
            stop_worker(&context, handle);
            return Err(e);
        }

        sandboxes.insert(
            plugin_name.to_string(),
            SandboxEntry {
                context,
                worker: handle,
            },
        );
        Ok(())
    }

    /// Tear down the context for `plugin_name`. Unknown names are ignored.
    pub fn destroy_sandbox(&self, plugin_name: &str) {
        let entry = self
            .sandboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(plugin_name);

        if let Some(entry) = entry {
            self.backend.release(&entry.context);
            stop_worker(&entry.context, entry.worker);
        }
    }

    /// Clone of the context for `plugin_name`.
    pub fn context(&self, plugin_name: &str) -> Option<SandboxContext> {
        self.sandboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin_name)
            .map(|entry| entry.context.clone())
    }

    pub fn active_count(&self) -> usize {
        self.sandboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Ask the worker to exit and wait up to one call timeout for it. A
/// worker stuck inside plugin code is detached rather than joined.
fn stop_worker(context: &SandboxContext, thread: Option<WorkerThread>) {
    let (Some(worker), Some(thread)) = (&context.worker, thread) else {
        return;
    };
    worker.stop();

    match thread.done.recv_timeout(worker.timeout) {
        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
            if thread.handle.join().is_err() {
                tracing::warn!(plugin = %context.plugin_name, "isolation worker panicked");
            }
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            tracing::warn!(
                plugin = %context.plugin_name,
                timeout_ms = worker.timeout.as_millis() as u64,
                "isolation worker did not stop in time; detaching it"
            );
        }
    }
}

impl Drop for SandboxController {
    fn drop(&mut self) {
        let entries: Vec<SandboxEntry> = self
            .sandboxes
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            self.backend.release(&entry.context);
            stop_worker(&entry.context, entry.worker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct Echo {
        metadata: PluginMetadata,
        drops: Arc<AtomicUsize>,
    }

    impl Plugin for Echo {
        fn initialize(&mut self) -> bool {
            true
        }
        fn shutdown(&mut self) {}
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
            match operation {
                "echo" => Some(params.to_string()),
                "thread" => Some(format!("{:?}", std::thread::current().name())),
                "sleep" => {
                    std::thread::sleep(Duration::from_millis(300));
                    Some("late".into())
                }
                "hang" => {
                    std::thread::sleep(Duration::from_secs(20));
                    None
                }
                "panic" => panic!("operation failure"),
                _ => None,
            }
        }
    }

    impl Drop for Echo {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn echo_factory(drops: &Arc<AtomicUsize>) -> PluginFactory {
        let drops = Arc::clone(drops);
        Box::new(move || {
            Ok(Box::new(Echo {
                metadata: PluginMetadata::new("echo", "1.0.0", "^1"),
                drops,
            }) as Box<dyn Plugin>)
        })
    }

    fn controller() -> SandboxController {
        SandboxController::new(SandboxConfig::default(), Arc::new(RuntimeIsolation))
    }

    struct FailingBackend;

    impl IsolationBackend for FailingBackend {
        fn establish(&self, _context: &SandboxContext) -> Result<(), PluginError> {
            Err(PluginError::Sandbox("denied".into()))
        }
        fn release(&self, _context: &SandboxContext) {}
    }

    #[test]
    fn test_create_and_destroy_sandbox() {
        let controller = controller();
        controller.create_sandbox("echo", SandboxLevel::Memory).unwrap();
        let context = controller.context("echo").unwrap();
        assert_eq!(context.level, SandboxLevel::Memory);
        assert!(context.worker.is_none());
        assert_eq!(controller.active_count(), 1);

        controller.destroy_sandbox("echo");
        assert!(controller.context("echo").is_none());
        assert_eq!(controller.active_count(), 0);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let controller = controller();
        controller.destroy_sandbox("never-created");
        controller.create_sandbox("echo", SandboxLevel::Process).unwrap();
        controller.destroy_sandbox("echo");
        controller.destroy_sandbox("echo");
        assert_eq!(controller.active_count(), 0);
    }

    #[test]
    fn test_duplicate_sandbox_rejected() {
        let controller = controller();
        controller.create_sandbox("echo", SandboxLevel::Memory).unwrap();
        assert!(controller.create_sandbox("echo", SandboxLevel::Full).is_err());
    }

    #[test]
    fn test_backend_failure_leaves_nothing_behind() {
        let controller =
            SandboxController::new(SandboxConfig::default(), Arc::new(FailingBackend));
        assert!(controller.create_sandbox("echo", SandboxLevel::Process).is_err());
        assert_eq!(controller.active_count(), 0);
    }

    #[test]
    fn test_missing_allow_listed_path_rejected() {
        let config = SandboxConfig {
            allowed_paths: vec!["/nonexistent/plugin-data".into()],
            ..SandboxConfig::default()
        };
        let controller = SandboxController::new(config, Arc::new(RuntimeIsolation));
        assert!(controller.create_sandbox("echo", SandboxLevel::File).is_err());
        // Full drops the path allow-list entirely.
        assert!(controller.create_sandbox("echo", SandboxLevel::Full).is_ok());
    }

    #[test]
    fn test_in_line_construct_runs_factory_here() {
        let controller = controller();
        controller.create_sandbox("echo", SandboxLevel::Memory).unwrap();
        let drops = Arc::new(AtomicUsize::new(0));
        let mut plugin = controller
            .context("echo")
            .unwrap()
            .construct(echo_factory(&drops))
            .unwrap();
        assert_eq!(plugin.execute_operation("echo", "{}").as_deref(), Some("{}"));
        drop(plugin);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_out_of_line_plugin_runs_on_worker() {
        let controller = controller();
        controller.create_sandbox("echo", SandboxLevel::Process).unwrap();
        let drops = Arc::new(AtomicUsize::new(0));
        let mut plugin = controller
            .context("echo")
            .unwrap()
            .construct(echo_factory(&drops))
            .unwrap();

        assert_eq!(plugin.name(), "echo");
        assert!(plugin.initialize());
        assert_eq!(
            plugin.execute_operation("echo", "{\"a\":1}").as_deref(),
            Some("{\"a\":1}")
        );
        let thread = plugin.execute_operation("thread", "{}").unwrap();
        assert!(thread.contains("warden-sandbox-echo"));
        assert_eq!(plugin.execute_operation("panic", "{}"), None);

        drop(plugin);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        controller.destroy_sandbox("echo");
    }

    #[test]
    fn test_out_of_line_call_times_out() {
        let (worker, thread) = spawn_worker("echo", Duration::from_secs(5)).unwrap();
        let drops = Arc::new(AtomicUsize::new(0));
        let plugin = IsolatedPlugin::construct(worker.clone(), echo_factory(&drops)).unwrap();

        let impatient = WorkerClient {
            timeout: Duration::from_millis(50),
            ..worker.clone()
        };
        let result = impatient.request(|reply| Request::Execute {
            operation: "sleep".into(),
            params: "{}".into(),
            reply,
        });
        assert!(matches!(result, Err(PluginError::Timeout(_))));

        // The worker finishes the slow call, then destroys the instance.
        drop(plugin);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        worker.stop();
        thread.handle.join().unwrap();
    }

    #[test]
    fn test_stuck_worker_is_detached_on_destroy() {
        let config = SandboxConfig {
            call_timeout_secs: 1,
            ..SandboxConfig::default()
        };
        let controller = SandboxController::new(config, Arc::new(RuntimeIsolation));
        controller.create_sandbox("echo", SandboxLevel::Process).unwrap();
        let drops = Arc::new(AtomicUsize::new(0));
        let mut plugin = controller
            .context("echo")
            .unwrap()
            .construct(echo_factory(&drops))
            .unwrap();

        // The worker stays busy well past every timeout below.
        assert_eq!(plugin.execute_operation("hang", "{}"), None);
        drop(plugin);

        let started = Instant::now();
        controller.destroy_sandbox("echo");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(controller.active_count(), 0);
    }

    #[test]
    fn test_failing_factory_reports_error() {
        let controller = controller();
        controller.create_sandbox("echo", SandboxLevel::Full).unwrap();
        let context = controller.context("echo").unwrap();
        let err = context
            .construct(Box::new(|| Err(PluginError::Runtime("boom".into()))))
            .err()
            .unwrap();
        assert!(matches!(err, PluginError::Runtime(_)));

        let err = context
            .construct(Box::new(|| panic!("constructor failure")))
            .err()
            .unwrap();
        assert!(matches!(err, PluginError::Panicked { .. }));
    }
}
