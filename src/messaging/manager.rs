//! Per-transport message manager.
//!
//! One [`MessageManager`] owns one transport. Devices register a callback under
//! a response key before writing their request; a dedicated receive thread
//! reads every incoming message, derives its key through the [`Correlator`]
//! and fires the matching callbacks.
//!
//! # Matching rules
//!
//! For each key there are two callback lists:
//!
//! - **grouped** (`coalesce = true`): a response fires *every* grouped callback
//!   for its key. One-shot entries are then removed; persistent ones (event
//!   handlers) stay registered.
//! - **standalone** (`coalesce = false`): a response fires only the *oldest*
//!   standalone callback, which is then removed. Some hardware answers N
//!   identical requests with N identical responses, so each response must be
//!   paired with exactly one of them.
//!
//! A message with no match goes to the unexpected-message handler.
//!
//! # Lifecycle
//!
//! `Idle → Running → Stopping → Stopped`. When the receive thread exits, for a
//! stop request or a fatal transport error, every registered callback receives
//! `on_shutdown` so nobody stays blocked on a response that cannot arrive.
//!
//! Callbacks run on the receive thread while the pending table is locked. They
//! must be quick and must not call back into the same manager.

use crate::error::{AppResult, ScopeError};
use crate::messaging::correlator::{Correlator, ResponseKey};
use crate::messaging::transport::{MessageSink, MessageSource, Transport};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Receiver of the response to one registration.
pub trait ResponseCallback: Send + Sync {
    /// Called on the receive thread with the matching message.
    fn on_response(&self, response: &Bytes) -> AppResult<()>;

    /// Called once if the manager shuts down while this callback is registered.
    fn on_shutdown(&self, _reason: &str) {}
}

impl<F> ResponseCallback for F
where
    F: Fn(&Bytes) + Send + Sync,
{
    fn on_response(&self, response: &Bytes) -> AppResult<()> {
        self(response);
        Ok(())
    }
}

type SharedCallback = Arc<dyn ResponseCallback>;
type UnexpectedHandler = Arc<dyn Fn(&Bytes, &ResponseKey) + Send + Sync>;

/// How a callback participates in matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// Remove the callback after its first match.
    pub one_shot: bool,
    /// Share responses with every other grouped callback on the key.
    pub coalesce: bool,
}

impl Default for Registration {
    fn default() -> Self {
        Self {
            one_shot: true,
            coalesce: true,
        }
    }
}

impl Registration {
    /// Never removed; for device-initiated event streams.
    pub fn persistent() -> Self {
        Self {
            one_shot: false,
            coalesce: true,
        }
    }

    /// Consumes exactly one response in FIFO order.
    pub fn standalone() -> Self {
        Self {
            one_shot: true,
            coalesce: false,
        }
    }

    fn validate(self) -> AppResult<()> {
        if !self.coalesce && !self.one_shot {
            return Err(ScopeError::InvalidOptions(
                "standalone callbacks must be one-shot".to_string(),
            ));
        }
        Ok(())
    }
}

/// Handle for removing a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Lifecycle of a manager's receive thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Created but not started.
    Idle,
    /// Receive thread is reading messages.
    Running,
    /// Stop requested, thread not yet joined.
    Stopping,
    /// Receive thread has exited.
    Stopped,
}

struct Entry {
    id: CallbackId,
    callback: SharedCallback,
    one_shot: bool,
}

#[derive(Default)]
struct KeyedCallbacks {
    grouped: Vec<Entry>,
    standalone: VecDeque<Entry>,
}

impl KeyedCallbacks {
    fn is_empty(&self) -> bool {
        self.grouped.is_empty() && self.standalone.is_empty()
    }

    fn len(&self) -> usize {
        self.grouped.len() + self.standalone.len()
    }
}

#[derive(Default)]
struct PendingResponses {
    by_key: HashMap<ResponseKey, KeyedCallbacks>,
}

impl PendingResponses {
    fn insert(&mut self, key: ResponseKey, entry: Entry, coalesce: bool) {
        let slot = self.by_key.entry(key).or_default();
        if coalesce {
            slot.grouped.push(entry);
        } else {
            slot.standalone.push_back(entry);
        }
    }

    /// Callbacks to fire for `key`, with one-shot entries already removed.
    fn take_matches(&mut self, key: &ResponseKey) -> Vec<SharedCallback> {
        let Some(slot) = self.by_key.get_mut(key) else {
            return Vec::new();
        };
        let mut fire: Vec<SharedCallback> = slot
            .grouped
            .iter()
            .map(|entry| Arc::clone(&entry.callback))
            .collect();
        slot.grouped.retain(|entry| !entry.one_shot);
        if let Some(entry) = slot.standalone.pop_front() {
            fire.push(entry.callback);
        }
        if slot.is_empty() {
            self.by_key.remove(key);
        }
        fire
    }

    fn remove(&mut self, key: &ResponseKey, id: CallbackId) -> bool {
        let Some(slot) = self.by_key.get_mut(key) else {
            return false;
        };
        let before = slot.len();
        slot.grouped.retain(|entry| entry.id != id);
        slot.standalone.retain(|entry| entry.id != id);
        let removed = slot.len() != before;
        if slot.is_empty() {
            self.by_key.remove(key);
        }
        removed
    }

    fn drain(&mut self) -> Vec<SharedCallback> {
        self.by_key
            .drain()
            .flat_map(|(_, slot)| {
                slot.grouped
                    .into_iter()
                    .chain(slot.standalone)
                    .map(|entry| entry.callback)
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.by_key.values().map(KeyedCallbacks::len).sum()
    }
}

struct Inner {
    name: String,
    correlator: Arc<dyn Correlator>,
    pending: Mutex<PendingResponses>,
    sink: Mutex<Box<dyn MessageSink>>,
    state: Mutex<ManagerState>,
    unexpected: RwLock<UnexpectedHandler>,
    next_id: AtomicU64,
}

impl Inner {
    fn state(&self) -> ManagerState {
        *self.state.lock()
    }

    fn dispatch(&self, response: Bytes) {
        let key = self.correlator.response_key(&response);
        let mut pending = self.pending.lock();
        let fire = pending.take_matches(&key);
        if fire.is_empty() {
            drop(pending);
            let handler = Arc::clone(&*self.unexpected.read());
            handler(&response, &key);
            return;
        }
        debug!(
            "[{}] response for key {} fires {} callback(s)",
            self.name,
            key,
            fire.len()
        );
        for callback in fire {
            match catch_unwind(AssertUnwindSafe(|| callback.on_response(&response))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("[{}] response callback for {} failed: {}", self.name, key, e),
                Err(_) => error!("[{}] response callback for {} panicked", self.name, key),
            }
        }
    }

    /// Move to `Stopped` and release every registered callback. Idempotent.
    fn shutdown(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if *state == ManagerState::Stopped {
                return;
            }
            *state = ManagerState::Stopped;
        }
        let abandoned = self.pending.lock().drain();
        if !abandoned.is_empty() {
            warn!(
                "[{}] abandoning {} pending response(s): {}",
                self.name,
                abandoned.len(),
                reason
            );
        }
        for callback in abandoned {
            callback.on_shutdown(reason);
        }
        info!("[{}] message manager stopped", self.name);
    }
}

fn receive_loop(inner: Arc<Inner>, mut source: Box<dyn MessageSource>) {
    let reason = loop {
        if inner.state() != ManagerState::Running {
            break format!("message manager '{}' stopped", inner.name);
        }
        match source.receive() {
            Ok(Some(response)) => inner.dispatch(response),
            Ok(None) => continue,
            Err(e) => {
                error!("[{}] transport failed: {}", inner.name, e);
                break format!("transport for '{}' failed: {}", inner.name, e);
            }
        }
    };
    inner.shutdown(&reason);
}

/// Routes messages between devices and one shared transport.
pub struct MessageManager {
    inner: Arc<Inner>,
    description: String,
    source: Mutex<Option<Box<dyn MessageSource>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MessageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageManager")
            .field("name", &self.inner.name)
            .field("transport", &self.description)
            .field("state", &self.state())
            .finish()
    }
}

impl MessageManager {
    /// Wrap a transport. The receive thread is not started until [`start`](Self::start).
    pub fn new(
        name: impl Into<String>,
        transport: Transport,
        correlator: Arc<dyn Correlator>,
    ) -> Self {
        let name = name.into();
        let (description, source, sink) = transport.into_parts();
        let unexpected = default_unexpected_handler(name.clone(), Arc::clone(&correlator));
        Self {
            inner: Arc::new(Inner {
                name,
                correlator,
                pending: Mutex::new(PendingResponses::default()),
                sink: Mutex::new(sink),
                state: Mutex::new(ManagerState::Idle),
                unexpected: RwLock::new(unexpected),
                next_id: AtomicU64::new(1),
            }),
            description,
            source: Mutex::new(Some(source)),
            thread: Mutex::new(None),
        }
    }

    /// Construct and start in one step.
    pub fn spawn(
        name: impl Into<String>,
        transport: Transport,
        correlator: Arc<dyn Correlator>,
    ) -> AppResult<Arc<Self>> {
        let manager = Arc::new(Self::new(name, transport, correlator));
        manager.start()?;
        Ok(manager)
    }

    /// Launch the receive thread.
    pub fn start(&self) -> AppResult<()> {
        let mut state = self.inner.state.lock();
        if *state != ManagerState::Idle {
            return Err(ScopeError::ManagerStopped(self.inner.name.clone()));
        }
        let source = self
            .source
            .lock()
            .take()
            .ok_or_else(|| ScopeError::ManagerStopped(self.inner.name.clone()))?;
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(format!("messages-{}", self.inner.name))
            .spawn(move || receive_loop(inner, source))?;
        *state = ManagerState::Running;
        *self.thread.lock() = Some(handle);
        info!(
            "[{}] message manager running on {}",
            self.inner.name, self.description
        );
        Ok(())
    }

    /// Ask the receive thread to exit. It notices within one read timeout.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        match *state {
            ManagerState::Running => *state = ManagerState::Stopping,
            ManagerState::Idle => {
                drop(state);
                self.source.lock().take();
                self.inner
                    .shutdown(&format!("message manager '{}' stopped", self.inner.name));
            }
            ManagerState::Stopping | ManagerState::Stopped => {}
        }
    }

    /// Wait for the receive thread to finish.
    pub fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("[{}] receive thread panicked", self.inner.name);
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        self.inner.state()
    }

    /// Name used in log lines and thread names.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Description of the underlying transport, e.g. `tcp://127.0.0.1:4001`.
    pub fn transport_description(&self) -> &str {
        &self.description
    }

    /// Correlator shared by every device on this manager.
    pub fn correlator(&self) -> Arc<dyn Correlator> {
        Arc::clone(&self.inner.correlator)
    }

    /// Write a message without expecting any response.
    pub fn send(&self, message: &[u8]) -> AppResult<()> {
        self.ensure_accepting()?;
        self.write(message)
    }

    /// Register `callback` under `key`, then write `message`.
    ///
    /// Registration happens first so a fast response cannot be missed.
    pub fn send_expecting(
        &self,
        message: &[u8],
        key: ResponseKey,
        callback: Arc<dyn ResponseCallback>,
        registration: Registration,
    ) -> AppResult<CallbackId> {
        let id = self.register(key.clone(), callback, registration)?;
        if let Err(e) = self.write(message) {
            self.inner.pending.lock().remove(&key, id);
            return Err(e);
        }
        Ok(id)
    }

    /// Register a callback that fires for every message under `key`.
    pub fn register_persistent(
        &self,
        key: ResponseKey,
        callback: Arc<dyn ResponseCallback>,
    ) -> AppResult<CallbackId> {
        self.register(key, callback, Registration::persistent())
    }

    /// Remove a callback. Returns whether it was still registered.
    pub fn unregister(&self, key: &ResponseKey, id: CallbackId) -> bool {
        self.inner.pending.lock().remove(key, id)
    }

    /// Replace the handler for messages nobody is waiting for.
    pub fn set_unexpected_handler<F>(&self, handler: F)
    where
        F: Fn(&Bytes, &ResponseKey) + Send + Sync + 'static,
    {
        *self.inner.unexpected.write() = Arc::new(handler);
    }

    /// Number of registered callbacks, persistent ones included.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Keys that currently have a callback registered.
    pub fn pending_keys(&self) -> Vec<ResponseKey> {
        self.inner.pending.lock().by_key.keys().cloned().collect()
    }

    fn register(
        &self,
        key: ResponseKey,
        callback: Arc<dyn ResponseCallback>,
        registration: Registration,
    ) -> AppResult<CallbackId> {
        registration.validate()?;
        let id = CallbackId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut pending = self.inner.pending.lock();
        // Checked under the pending lock so shutdown cannot drain in between.
        self.ensure_accepting()?;
        pending.insert(
            key,
            Entry {
                id,
                callback,
                one_shot: registration.one_shot,
            },
            registration.coalesce,
        );
        Ok(id)
    }

    fn ensure_accepting(&self) -> AppResult<()> {
        match self.state() {
            ManagerState::Idle | ManagerState::Running => Ok(()),
            ManagerState::Stopping | ManagerState::Stopped => {
                Err(ScopeError::ManagerStopped(self.inner.name.clone()))
            }
        }
    }

    fn write(&self, message: &[u8]) -> AppResult<()> {
        debug!(
            "[{}] -> {}",
            self.inner.name,
            String::from_utf8_lossy(message)
        );
        let result = self.inner.sink.lock().send(message);
        if let Err(e) = &result {
            error!("[{}] write failed: {}", self.inner.name, e);
            self.stop();
        }
        result
    }
}

impl Drop for MessageManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn default_unexpected_handler(name: String, correlator: Arc<dyn Correlator>) -> UnexpectedHandler {
    Arc::new(move |response: &Bytes, key: &ResponseKey| {
        let text = String::from_utf8_lossy(response);
        if correlator.is_unsolicited(response) {
            debug!("[{}] unhandled event {:?} (key {})", name, text, key);
        } else {
            warn!("[{}] unexpected response {:?} (key {})", name, text, key);
        }
    })
}
