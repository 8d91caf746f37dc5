//! Host event system: lifecycle and security events, the publisher seam,
//! and listener lists.
//!
//! Listeners are always invoked over a snapshot taken after every registry
//! lock has been released, so a listener may register or unregister
//! listeners, or call back into the registry.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{ErrorKind, PluginError};
use crate::registry::LoadStage;

/// Opaque handle identifying a registered listener.
pub type CallbackId = u64;

// ─── Events ─────────────────────────────────────────────────────────────

/// A plugin entered or left the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    PluginLoaded { name: String, version: String },
    PluginUnloaded { name: String },
}

impl LifecycleEvent {
    pub fn plugin_name(&self) -> &str {
        match self {
            Self::PluginLoaded { name, .. } | Self::PluginUnloaded { name } => name,
        }
    }
}

/// Diagnostics about rejected or misbehaving plugins.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SecurityEvent {
    /// A load failed and was rolled back.
    LoadRejected {
        path: PathBuf,
        /// Known once the descriptor has been read.
        plugin: Option<String>,
        stage: LoadStage,
        kind: ErrorKind,
        reason: String,
    },
    /// `shutdown` panicked during unload; resources were released anyway.
    ShutdownFault { plugin: String, reason: String },
}

// ─── Publisher ──────────────────────────────────────────────────────────

/// Outbound seam for lifecycle events.
///
/// Failures are logged by the registry and never undo the load or
/// unload being announced.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: LifecycleEvent) -> Result<(), PluginError>;
}

/// Publisher backed by a `tokio` broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<LifecycleEvent>) {
        let (sender, receiver) = broadcast::channel(capacity);
        (Self { sender }, receiver)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: LifecycleEvent) -> Result<(), PluginError> {
        self.sender
            .send(event)
            .map(|_| ())
            .map_err(|e| PluginError::Delivery(format!("no subscribers for {:?}", e.0)))
    }
}

// ─── Listener lists ─────────────────────────────────────────────────────

pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered listeners, notified in registration order.
pub struct CallbackList<T: ?Sized> {
    listeners: Mutex<Vec<(CallbackId, Listener<T>)>>,
}

impl<T: ?Sized> Default for CallbackList<T> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for CallbackList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackList")
            .field("len", &self.len())
            .finish()
    }
}

impl<T: ?Sized> CallbackList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: CallbackId, listener: Listener<T>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
    }

    /// Returns `true` if a listener with this id was removed.
    pub fn remove(&self, id: CallbackId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every listener registered at the time of the call.
    ///
    /// A panicking listener is logged and does not stop the others.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<(CallbackId, Listener<T>)> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (id, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
                tracing::warn!(callback = id, "listener panicked");
            }
        }
    }
}
