//! Out-of-process plugin hosting.
//!
//! At `process` and above a WASM module runs inside a child worker
//! process. Host and worker exchange one JSON object per line over the
//! worker's stdin and stdout. The worker re-reads the module from disk and
//! refuses it unless its signed-region digest matches the one the host
//! verified, so the child never runs bytes the host did not approve.
//!
//! A worker that stops answering within the call timeout is killed. A
//! worker that crashes only takes its own plugin down.

use std::io::{BufRead, BufReader, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::contract::{Plugin, PluginMetadata};
use crate::error::PluginError;
use crate::loader::WasmPlugin;
use crate::package::{signed_digest, PluginImage};
use crate::sandbox::SandboxPolicy;

/// Worker executable looked up next to the running binary.
pub const WORKER_BINARY: &str = "warden-worker";

/// Environment variables a worker process inherits. Everything else is
/// cleared.
const INHERITED_ENV: &[&str] = &["RUST_LOG", "RUST_BACKTRACE"];

/// How to start a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `PLUGIN_WORKER_PROGRAM`, else a `warden-worker` binary next to the
    /// running executable.
    pub fn from_env() -> Option<Self> {
        if let Some(program) = std::env::var_os("PLUGIN_WORKER_PROGRAM").filter(|v| !v.is_empty())
        {
            return Some(Self::new(program));
        }
        let sibling = std::env::current_exe()
            .ok()?
            .with_file_name(format!("{WORKER_BINARY}{}", std::env::consts::EXE_SUFFIX));
        sibling.is_file().then(|| Self::new(sibling))
    }

    fn spawn(&self) -> Result<Child, PluginError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        for key in INHERITED_ENV {
            if let Some(value) = std::env::var_os(key) {
                command.env(key, value);
            }
        }

        command.spawn().map_err(|e| {
            PluginError::Sandbox(format!(
                "failed to start worker process {}: {e}",
                self.program.display()
            ))
        })
    }
}

// ─── Protocol ───────────────────────────────────────────────────────────

/// A module the host has verified, identified by location and digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSource {
    pub path: PathBuf,
    /// Signed-region digest the worker must see.
    pub digest: String,
    /// Exact size of the verified image.
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum WorkerRequest {
    Construct {
        module: ModuleSource,
        policy: SandboxPolicy,
        metadata: PluginMetadata,
    },
    Initialize,
    Shutdown,
    Execute {
        operation: String,
        params: String,
    },
    /// Destroy the instance and exit.
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum WorkerReply {
    Constructed,
    Initialized { ok: bool },
    ShutDown,
    Output { output: Option<String> },
    Destroyed,
    Panicked { during: String },
    Failed { message: String },
}

fn stage(during: &str) -> &'static str {
    match during {
        "construct" => "construct",
        "initialize" => "initialize",
        "shutdown" => "shutdown",
        "execute" => "execute",
        "destroy" => "destroy",
        _ => "worker call",
    }
}

// ─── Worker side ────────────────────────────────────────────────────────

/// Run the worker loop until `Destroy` or end of input.
///
/// Every plugin call is wrapped in `catch_unwind`; a panic becomes a
/// `Panicked` reply and the worker keeps serving.
pub fn serve(input: impl BufRead, mut output: impl Write) -> Result<(), PluginError> {
    let mut instance: Option<WasmPlugin> = None;

    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: WorkerRequest = serde_json::from_str(&line)?;
        let last = matches!(request, WorkerRequest::Destroy);
        let reply = handle(&mut instance, request);

        serde_json::to_writer(&mut output, &reply)?;
        output.write_all(b"\n")?;
        output.flush()?;
        if last {
            break;
        }
    }

    if let Some(plugin) = instance.take() {
        let _ = catch_unwind(AssertUnwindSafe(move || drop(plugin)));
    }
    Ok(())
}

fn handle(instance: &mut Option<WasmPlugin>, request: WorkerRequest) -> WorkerReply {
    let panicked = |during: &str| WorkerReply::Panicked {
        during: during.to_string(),
    };

    match request {
        WorkerRequest::Construct {
            module,
            policy,
            metadata,
        } => {
            if instance.is_some() {
                return WorkerReply::Failed {
                    message: "an instance is already constructed".into(),
                };
            }
            match catch_unwind(AssertUnwindSafe(|| open_module(&module, &policy, metadata))) {
                Ok(Ok(plugin)) => {
                    *instance = Some(plugin);
                    WorkerReply::Constructed
                }
                Ok(Err(e)) => WorkerReply::Failed {
                    message: e.to_string(),
                },
                Err(_) => panicked("construct"),
            }
        }
        WorkerRequest::Initialize => match instance.as_mut() {
            Some(plugin) => catch_unwind(AssertUnwindSafe(|| plugin.initialize()))
                .map_or_else(|_| panicked("initialize"), |ok| WorkerReply::Initialized { ok }),
            None => WorkerReply::Initialized { ok: false },
        },
        WorkerRequest::Shutdown => match instance.as_mut() {
            Some(plugin) => catch_unwind(AssertUnwindSafe(|| plugin.shutdown()))
                .map_or_else(|_| panicked("shutdown"), |()| WorkerReply::ShutDown),
            None => WorkerReply::ShutDown,
        },
        WorkerRequest::Execute { operation, params } => {
            let output = match instance.as_mut() {
                Some(plugin) => {
                    match catch_unwind(AssertUnwindSafe(|| {
                        plugin.execute_operation(&operation, &params)
                    })) {
                        Ok(output) => output,
                        Err(_) => return panicked("execute"),
                    }
                }
                None => None,
            };
            WorkerReply::Output { output }
        }
        WorkerRequest::Destroy => match instance.take() {
            Some(plugin) => catch_unwind(AssertUnwindSafe(move || drop(plugin)))
                .map_or_else(|_| panicked("destroy"), |()| WorkerReply::Destroyed),
            None => WorkerReply::Destroyed,
        },
    }
}

fn open_module(
    module: &ModuleSource,
    policy: &SandboxPolicy,
    metadata: PluginMetadata,
) -> Result<WasmPlugin, PluginError> {
    let image = PluginImage::read(&module.path, module.size)?;
    let computed = signed_digest(image.bytes())?;
    if computed != module.digest {
        return Err(PluginError::SignatureMismatch {
            declared: module.digest.clone(),
            computed,
        });
    }
    WasmPlugin::instantiate(image.bytes(), policy, metadata)
}

// ─── Host side ──────────────────────────────────────────────────────────

/// Host-side proxy for a plugin living in a worker process.
///
/// Dropping the proxy destroys the remote instance and reaps the process,
/// killing it if it does not exit within the call timeout.
pub struct ProcessPlugin {
    child: Child,
    stdin: ChildStdin,
    replies: mpsc::Receiver<String>,
    timeout: Duration,
    metadata: PluginMetadata,
    alive: bool,
}

impl std::fmt::Debug for ProcessPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPlugin")
            .field("plugin", &self.metadata.name)
            .field("pid", &self.child.id())
            .field("alive", &self.alive)
            .finish_non_exhaustive()
    }
}

impl ProcessPlugin {
    /// Start a worker and construct the plugin inside it.
    pub fn spawn(
        command: &WorkerCommand,
        module: ModuleSource,
        policy: &SandboxPolicy,
        metadata: PluginMetadata,
        timeout: Duration,
    ) -> Result<Self, PluginError> {
        let mut child = command.spawn()?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PluginError::Sandbox("worker process has no pipes".into()));
        };

        let (lines, replies) = mpsc::channel();
        let reader = std::thread::Builder::new()
            .name(format!("warden-ipc-{}", metadata.name))
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if lines.send(line).is_err() {
                        break;
                    }
                }
            });
        if let Err(e) = reader {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PluginError::Sandbox(format!(
                "failed to start worker reader: {e}"
            )));
        }

        tracing::debug!(
            plugin = %metadata.name,
            pid = child.id(),
            "worker process started"
        );

        let mut plugin = Self {
            child,
            stdin,
            replies,
            timeout,
            metadata: metadata.clone(),
            alive: true,
        };
        match plugin.request(&WorkerRequest::Construct {
            module,
            policy: policy.clone(),
            metadata,
        })? {
            WorkerReply::Constructed => Ok(plugin),
            other => Err(plugin.failure("construct", other)),
        }
    }

    /// OS process id of the worker.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    fn request(&mut self, request: &WorkerRequest) -> Result<WorkerReply, PluginError> {
        if !self.alive {
            return Err(PluginError::Sandbox(format!(
                "worker process for {} is gone",
                self.metadata.name
            )));
        }

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        let written = self
            .stdin
            .write_all(line.as_bytes())
            .and_then(|()| self.stdin.flush());
        if let Err(e) = written {
            self.terminate();
            return Err(PluginError::Sandbox(format!(
                "worker process for {} stopped reading: {e}",
                self.metadata.name
            )));
        }

        match self.replies.recv_timeout(self.timeout) {
            Ok(line) => serde_json::from_str(&line).map_err(|e| {
                self.terminate();
                PluginError::from(e)
            }),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    plugin = %self.metadata.name,
                    pid = self.child.id(),
                    "worker process did not answer in time; killing it"
                );
                self.terminate();
                Err(PluginError::Timeout(self.metadata.name.clone()))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                self.terminate();
                Err(PluginError::Sandbox(format!(
                    "worker process for {} exited",
                    self.metadata.name
                )))
            }
        }
    }

    fn failure(&self, during: &'static str, reply: WorkerReply) -> PluginError {
        match reply {
            WorkerReply::Failed { message } => PluginError::Runtime(message),
            WorkerReply::Panicked { during: remote } => PluginError::Panicked {
                plugin: self.metadata.name.clone(),
                during: stage(&remote),
            },
            other => PluginError::Sandbox(format!(
                "worker process for {} answered {during} with {other:?}",
                self.metadata.name
            )),
        }
    }

    /// Kill and reap the worker. Idempotent.
    fn terminate(&mut self) {
        if !self.alive {
            return;
        }
        self.alive = false;
        let _ = self.child.kill();
        match self.child.wait() {
            Ok(status) => {
                tracing::debug!(plugin = %self.metadata.name, %status, "worker process reaped");
            }
            Err(e) => tracing::warn!(plugin = %self.metadata.name, "failed to reap worker: {e}"),
        }
    }

    /// Wait for a worker that was told to exit, up to the call timeout.
    fn reap(&mut self) {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    self.alive = false;
                    tracing::debug!(plugin = %self.metadata.name, %status, "worker process exited");
                    return;
                }
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                _ => {
                    self.terminate();
                    return;
                }
            }
        }
    }
}

impl Plugin for ProcessPlugin {
    fn initialize(&mut self) -> bool {
        match self.request(&WorkerRequest::Initialize) {
            Ok(WorkerReply::Initialized { ok }) => ok,
            Ok(other) => {
                let e = self.failure("initialize", other);
                tracing::warn!(plugin = %self.metadata.name, "initialize failed: {e}");
                false
            }
            Err(e) => {
                tracing::warn!(plugin = %self.metadata.name, "initialize failed: {e}");
                false
            }
        }
    }

    fn shutdown(&mut self) {
        match self.request(&WorkerRequest::Shutdown) {
            Ok(WorkerReply::ShutDown) => {}
            // Contained in the worker; surface it to the host's own guard.
            Ok(WorkerReply::Panicked { .. }) => std::panic::resume_unwind(Box::new(format!(
                "plugin {} panicked during shutdown",
                self.metadata.name
            ))),
            Ok(other) => {
                let e = self.failure("shutdown", other);
                tracing::warn!(plugin = %self.metadata.name, "shutdown failed: {e}");
            }
            Err(e) => tracing::warn!(plugin = %self.metadata.name, "shutdown failed: {e}"),
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
        let request = WorkerRequest::Execute {
            operation: operation.to_string(),
            params: params.to_string(),
        };
        match self.request(&request) {
            Ok(WorkerReply::Output { output }) => output,
            Ok(other) => {
                let e = self.failure("execute", other);
                tracing::warn!(plugin = %self.metadata.name, operation = %operation, "{e}");
                None
            }
            Err(e) => {
                tracing::warn!(plugin = %self.metadata.name, operation = %operation, "{e}");
                None
            }
        }
    }
}

impl Drop for ProcessPlugin {
    fn drop(&mut self) {
        if !self.alive {
            return;
        }
        match self.request(&WorkerRequest::Destroy) {
            Ok(WorkerReply::Destroyed) => {}
            Ok(other) => {
                let e = self.failure("destroy", other);
                tracing::warn!(plugin = %self.metadata.name, "remote destroy failed: {e}");
            }
            Err(e) => {
                tracing::warn!(plugin = %self.metadata.name, "remote destroy failed: {e}");
            }
        }
        self.reap();
    }
}
