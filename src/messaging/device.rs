//! Logical devices on top of a shared message manager.

use crate::error::{AppResult, ResponseFailure, ScopeError};
use crate::messaging::correlator::{Correlator, ResponseKey};
use crate::messaging::manager::{CallbackId, MessageManager, Registration, ResponseCallback};
use crate::messaging::response::{InterruptFlag, ResponseFuture};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-call overrides for [`AsyncDevice::send_message_with`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// `None` uses the device's current mode.
    pub async_mode: Option<bool>,
    /// What the caller was trying to do, quoted in protocol error messages.
    pub intent: Option<String>,
    /// Pair this request with exactly one response in FIFO order instead of
    /// sharing responses with other callers waiting on the same key.
    pub standalone: bool,
    /// Abandon a synchronous wait once this flag is raised.
    pub interrupt: Option<InterruptFlag>,
}

impl SendOptions {
    /// Return immediately; the response is collected by `wait()`.
    pub fn asynchronous(mut self) -> Self {
        self.async_mode = Some(true);
        self
    }

    /// Block until the response arrives.
    pub fn synchronous(mut self) -> Self {
        self.async_mode = Some(false);
        self
    }

    /// Describe the request for error messages, e.g. `"move the stage"`.
    pub fn intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }

    /// See [`SendOptions::standalone`](#structfield.standalone).
    pub fn standalone(mut self) -> Self {
        self.standalone = true;
        self
    }

    /// Let `interrupt` cut a synchronous wait short.
    pub fn interruptible(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = Some(interrupt);
        self
    }
}

/// Resolves a device's future from the receive thread.
struct DeviceReply {
    future: ResponseFuture<Bytes>,
    correlator: Arc<dyn Correlator>,
    intent: Option<String>,
}

impl ResponseCallback for DeviceReply {
    fn on_response(&self, response: &Bytes) -> AppResult<()> {
        if !self.correlator.is_error(response) {
            return self.future.resolve(response.clone());
        }
        let text = String::from_utf8_lossy(response);
        let message = match &self.intent {
            Some(intent) => format!("Could not {intent} (error response \"{text}\")"),
            None => format!("Error from device: \"{text}\""),
        };
        self.future.fail(ResponseFailure::Protocol {
            message,
            response: response.clone(),
        })
    }

    fn on_shutdown(&self, reason: &str) {
        let _ = self
            .future
            .fail(ResponseFailure::TransportClosed(reason.to_string()));
    }
}

/// Anything that can be synchronised as a unit: a device or a namespace of them.
pub trait AsyncCapable: Send + Sync {
    /// Block until every outstanding response has arrived.
    fn wait(&self) -> AppResult<()>;

    /// Change the default mode for subsequent calls.
    fn set_async(&self, async_mode: bool) -> AppResult<()>;

    /// `Some(mode)` if all members agree, `None` if they differ.
    fn async_status(&self) -> Option<bool>;

    /// Like [`wait`](Self::wait), but gives up with
    /// [`ScopeError::Interrupted`] once `interrupt` is raised.
    fn wait_interruptible(&self, interrupt: &InterruptFlag) -> AppResult<()> {
        let _ = interrupt;
        self.wait()
    }
}

/// A logical device sharing a [`MessageManager`] with others.
///
/// In synchronous mode `send_message` blocks and returns the response. In
/// asynchronous mode it returns `None` immediately, and errors surface later
/// from [`wait`](Self::wait).
pub struct AsyncDevice {
    name: String,
    manager: Arc<MessageManager>,
    correlator: Arc<dyn Correlator>,
    async_mode: AtomicBool,
    outstanding: Mutex<Vec<ResponseFuture<Bytes>>>,
}

impl std::fmt::Debug for AsyncDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncDevice")
            .field("name", &self.name)
            .field("manager", &self.manager.name())
            .field("async", &self.get_async())
            .field("outstanding", &self.outstanding.lock().len())
            .finish()
    }
}

impl AsyncDevice {
    /// Create a synchronous device using the manager's correlator.
    pub fn new(name: impl Into<String>, manager: Arc<MessageManager>) -> Self {
        let correlator = manager.correlator();
        Self::with_correlator(name, manager, correlator)
    }

    /// Create a device with its own pairing rules.
    pub fn with_correlator(
        name: impl Into<String>,
        manager: Arc<MessageManager>,
        correlator: Arc<dyn Correlator>,
    ) -> Self {
        Self {
            name: name.into(),
            manager,
            correlator,
            async_mode: AtomicBool::new(false),
            outstanding: Mutex::new(Vec::new()),
        }
    }

    /// Name used in logs and command paths.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The manager owning this device's port.
    pub fn manager(&self) -> &Arc<MessageManager> {
        &self.manager
    }

    /// Send a command. `async_mode = None` uses the device default.
    pub fn send_message(
        &self,
        message: impl AsRef<[u8]>,
        async_mode: Option<bool>,
    ) -> AppResult<Option<Bytes>> {
        self.send_message_with(
            message,
            SendOptions {
                async_mode,
                ..SendOptions::default()
            },
        )
    }

    /// Send a command with full control over matching and error text.
    pub fn send_message_with(
        &self,
        message: impl AsRef<[u8]>,
        options: SendOptions,
    ) -> AppResult<Option<Bytes>> {
        let message = message.as_ref();
        let key = self.correlator.request_key(message);
        let future = ResponseFuture::new();
        let reply = DeviceReply {
            future: future.clone(),
            correlator: Arc::clone(&self.correlator),
            intent: options.intent,
        };
        let registration = if options.standalone {
            Registration::standalone()
        } else {
            Registration::default()
        };
        self.manager
            .send_expecting(message, key, Arc::new(reply), registration)?;

        if options.async_mode.unwrap_or_else(|| self.get_async()) {
            self.outstanding.lock().push(future);
            return Ok(None);
        }
        match &options.interrupt {
            Some(interrupt) => future.wait_interruptible(interrupt).map(Some),
            None => future.wait().map(Some),
        }
    }

    /// Wait for all outstanding responses, then report the first failure.
    ///
    /// Every future is waited on even after a failure, so the outstanding set
    /// is always empty afterwards.
    pub fn wait(&self) -> AppResult<()> {
        self.wait_with(None)
    }

    /// Like [`wait`](Self::wait) but stops early once `interrupt` is raised.
    /// Futures not yet settled stay outstanding for a later `wait()`.
    pub fn wait_interruptible(&self, interrupt: &InterruptFlag) -> AppResult<()> {
        self.wait_with(Some(interrupt))
    }

    fn wait_with(&self, interrupt: Option<&InterruptFlag>) -> AppResult<()> {
        let mut first_error = None;
        loop {
            let batch = std::mem::take(&mut *self.outstanding.lock());
            if batch.is_empty() {
                break;
            }
            debug!("[{}] waiting on {} response(s)", self.name, batch.len());
            let mut remaining = batch.into_iter();
            while let Some(future) = remaining.next() {
                let outcome = match interrupt {
                    Some(flag) => future.wait_interruptible(flag),
                    None => future.wait(),
                };
                match outcome {
                    Ok(_) => {}
                    Err(ScopeError::Interrupted) => {
                        let mut outstanding = self.outstanding.lock();
                        let newer = std::mem::take(&mut *outstanding);
                        outstanding.push(future);
                        outstanding.extend(remaining);
                        outstanding.extend(newer);
                        warn!(
                            "[{}] wait interrupted with {} response(s) outstanding",
                            self.name,
                            outstanding.len()
                        );
                        return Err(ScopeError::Interrupted);
                    }
                    Err(e) => {
                        warn!("[{}] {}", self.name, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Switch modes. Leaving asynchronous mode first waits for outstanding responses.
    pub fn set_async(&self, async_mode: bool) -> AppResult<()> {
        if self.get_async() && !async_mode {
            self.wait()?;
        }
        self.async_mode.store(async_mode, Ordering::SeqCst);
        Ok(())
    }

    /// The default mode for calls that do not override it.
    pub fn get_async(&self) -> bool {
        self.async_mode.load(Ordering::SeqCst)
    }

    /// Whether any asynchronous response is still unresolved.
    pub fn has_pending(&self) -> bool {
        self.outstanding
            .lock()
            .iter()
            .any(|future| !future.is_resolved())
    }

    /// Number of futures awaiting a `wait()`, resolved or not.
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Receive every device-initiated message under `key`.
    ///
    /// The callback runs on the manager's receive thread.
    pub fn register_event_callback<F>(&self, key: impl Into<ResponseKey>, callback: F) -> AppResult<CallbackId>
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        self.manager
            .register_persistent(key.into(), Arc::new(callback))
    }

    /// Remove a callback added by
    /// [`register_event_callback`](Self::register_event_callback).
    pub fn unregister_event_callback(&self, key: impl Into<ResponseKey>, id: CallbackId) -> bool {
        self.manager.unregister(&key.into(), id)
    }
}

impl AsyncCapable for AsyncDevice {
    fn wait(&self) -> AppResult<()> {
        AsyncDevice::wait(self)
    }

    fn set_async(&self, async_mode: bool) -> AppResult<()> {
        AsyncDevice::set_async(self, async_mode)
    }

    fn async_status(&self) -> Option<bool> {
        Some(self.get_async())
    }

    fn wait_interruptible(&self, interrupt: &InterruptFlag) -> AppResult<()> {
        AsyncDevice::wait_interruptible(self, interrupt)
    }
}

/// Named, ordered collection of devices and nested namespaces.
#[derive(Default)]
pub struct DeviceNamespace {
    children: RwLock<Vec<(String, Arc<dyn AsyncCapable>)>>,
}

impl std::fmt::Debug for DeviceNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceNamespace")
            .field("children", &self.names())
            .finish()
    }
}

impl DeviceNamespace {
    /// An empty namespace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a member.
    pub fn insert(&self, name: impl Into<String>, member: Arc<dyn AsyncCapable>) {
        let name = name.into();
        let mut children = self.children.write();
        match children.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = member,
            None => children.push((name, member)),
        }
    }

    /// Take a member out, returning it.
    pub fn remove(&self, name: &str) -> Option<Arc<dyn AsyncCapable>> {
        let mut children = self.children.write();
        let index = children.iter().position(|(existing, _)| existing == name)?;
        Some(children.remove(index).1)
    }

    /// Look a member up by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn AsyncCapable>> {
        self.children
            .read()
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, member)| Arc::clone(member))
    }

    /// Member names in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.children.read().iter().map(|(name, _)| name.clone()).collect()
    }

    /// Number of direct members.
    pub fn len(&self) -> usize {
        self.children.read().len()
    }

    /// True if there are no members.
    pub fn is_empty(&self) -> bool {
        self.children.read().is_empty()
    }

    fn members(&self) -> Vec<(String, Arc<dyn AsyncCapable>)> {
        self.children.read().clone()
    }

    fn wait_with(&self, interrupt: Option<&InterruptFlag>) -> AppResult<()> {
        let mut first_error: Option<ScopeError> = None;
        for (name, member) in self.members() {
            let outcome = match interrupt {
                Some(flag) => member.wait_interruptible(flag),
                None => member.wait(),
            };
            match outcome {
                Ok(()) => {}
                Err(ScopeError::Interrupted) => return Err(ScopeError::Interrupted),
                Err(e) => {
                    warn!("wait on '{}' failed: {}", name, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl AsyncCapable for DeviceNamespace {
    /// Waits on every member; the first failure is reported after all have settled.
    fn wait(&self) -> AppResult<()> {
        self.wait_with(None)
    }

    /// Stops at the first member whose wait is interrupted.
    fn wait_interruptible(&self, interrupt: &InterruptFlag) -> AppResult<()> {
        self.wait_with(Some(interrupt))
    }

    fn set_async(&self, async_mode: bool) -> AppResult<()> {
        let mut first_error: Option<ScopeError> = None;
        for (name, member) in self.members() {
            if let Err(e) = member.set_async(async_mode) {
                warn!("set_async on '{}' failed: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// An empty namespace reports synchronous.
    fn async_status(&self) -> Option<bool> {
        let mut statuses = self.members().into_iter().map(|(_, m)| m.async_status());
        let Some(first) = statuses.next() else {
            return Some(false);
        };
        let first = first?;
        for status in statuses {
            if status != Some(first) {
                return None;
            }
        }
        Some(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::correlator::{EchoCorrelator, FunctionUnitCorrelator};
    use crate::messaging::transport::{MessageSink, MessageSource, Transport};
    use std::sync::mpsc;
    use std::time::Duration;

    /// Replies with whatever the test scripts for each written request.
    struct ScriptedSource(mpsc::Receiver<Bytes>);

    impl MessageSource for ScriptedSource {
        fn receive(&mut self) -> AppResult<Option<Bytes>> {
            match self.0.recv_timeout(Duration::from_millis(10)) {
                Ok(message) => Ok(Some(message)),
                Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    Err(ScopeError::TransportClosed("closed".into()))
                }
            }
        }
    }

    struct Loopback {
        replies: mpsc::Sender<Bytes>,
        respond: Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>,
    }

    impl MessageSink for Loopback {
        fn send(&mut self, message: &[u8]) -> AppResult<()> {
            if let Some(reply) = (self.respond)(message) {
                let _ = self.replies.send(Bytes::from(reply));
            }
            Ok(())
        }
    }

    fn device_with<F>(correlator: Arc<dyn Correlator>, respond: F) -> AsyncDevice
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let transport = Transport::new(
            "loopback",
            Box::new(ScriptedSource(rx)),
            Box::new(Loopback {
                replies: tx,
                respond: Arc::new(respond),
            }),
        );
        let manager = MessageManager::spawn("loop", transport, correlator).unwrap();
        AsyncDevice::new("dev", manager)
    }

    #[test]
    fn test_sync_send_returns_response() {
        let device = device_with(Arc::new(EchoCorrelator), |m| Some(m.to_vec()));
        let response = device.send_message("HELLO", None).unwrap();
        assert_eq!(response.as_deref(), Some(&b"HELLO"[..]));
        assert!(!device.has_pending());
    }

    #[test]
    fn test_async_sends_then_wait() {
        let device = device_with(Arc::new(EchoCorrelator), |m| Some(m.to_vec()));
        device.set_async(true).unwrap();
        for i in 0..5 {
            assert!(device.send_message(format!("CMD{i}"), None).unwrap().is_none());
        }
        assert_eq!(device.outstanding_count(), 5);
        device.wait().unwrap();
        assert_eq!(device.outstanding_count(), 0);
        assert!(!device.has_pending());
    }

    #[test]
    fn test_protocol_error_mentions_intent() {
        let device = device_with(Arc::new(FunctionUnitCorrelator), |m| {
            let mut reply = m.to_vec();
            reply[2] = b'5';
            Some(reply)
        });
        let err = device
            .send_message_with("71023 9", SendOptions::default().intent("move the stage"))
            .unwrap_err();
        match err {
            ScopeError::Protocol { message, response } => {
                assert_eq!(message, "Could not move the stage (error response \"71523 9\")");
                assert_eq!(&response[..], b"71523 9");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = device.send_message("71024", None).unwrap_err();
        assert_eq!(err.to_string(), "Error from device: \"71524\"");
    }

    #[test]
    fn test_async_error_surfaces_at_wait_after_draining() {
        let device = device_with(Arc::new(FunctionUnitCorrelator), |m| {
            let mut reply = m.to_vec();
            if m.starts_with(b"72") {
                reply[2] = b'1';
            }
            Some(reply)
        });
        device.set_async(true).unwrap();
        device.send_message("71001", None).unwrap();
        device.send_message("72001", None).unwrap();
        device.send_message("73001", None).unwrap();
        assert!(matches!(device.wait(), Err(ScopeError::Protocol { .. })));
        assert_eq!(device.outstanding_count(), 0);
        device.wait().unwrap();
    }

    #[test]
    fn test_leaving_async_mode_waits_first() {
        let device = device_with(Arc::new(EchoCorrelator), |m| Some(m.to_vec()));
        device.set_async(true).unwrap();
        device.send_message("A", None).unwrap();
        device.set_async(false).unwrap();
        assert_eq!(device.outstanding_count(), 0);
        assert!(!device.get_async());
    }

    #[test]
    fn test_per_call_mode_override() {
        let device = device_with(Arc::new(EchoCorrelator), |m| Some(m.to_vec()));
        assert!(device.send_message("A", Some(true)).unwrap().is_none());
        assert_eq!(device.outstanding_count(), 1);
        device.set_async(true).unwrap();
        assert!(device.send_message("B", Some(false)).unwrap().is_some());
        device.wait().unwrap();
    }

    #[test]
    fn test_interrupt_releases_sync_send_to_silent_device() {
        let device = device_with(Arc::new(EchoCorrelator), |_| None);
        let interrupt = InterruptFlag::default();
        let raiser = interrupt.clone();
        let trigger = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            raiser.set();
        });
        let err = device
            .send_message_with("HOME", SendOptions::default().interruptible(interrupt))
            .unwrap_err();
        assert!(matches!(err, ScopeError::Interrupted));
        trigger.join().unwrap();
    }

    #[test]
    fn test_interrupted_wait_keeps_futures_outstanding() {
        let device = device_with(Arc::new(EchoCorrelator), |m| {
            (m != b"SILENT").then(|| m.to_vec())
        });
        device.set_async(true).unwrap();
        device.send_message("SILENT", None).unwrap();
        device.send_message("LOUD", None).unwrap();
        let interrupt = InterruptFlag::default();
        interrupt.set();
        assert!(matches!(
            device.wait_interruptible(&interrupt),
            Err(ScopeError::Interrupted)
        ));
        assert_eq!(device.outstanding_count(), 2);
        assert!(device.has_pending());

        let namespace = DeviceNamespace::new();
        namespace.insert("dev", Arc::new(device) as Arc<dyn AsyncCapable>);
        assert!(matches!(
            namespace.wait_interruptible(&interrupt),
            Err(ScopeError::Interrupted)
        ));
    }

    #[test]
    fn test_stopped_manager_fails_waiters() {
        let device = device_with(Arc::new(EchoCorrelator), |_| None);
        device.set_async(true).unwrap();
        device.send_message("never answered", None).unwrap();
        assert!(device.has_pending());
        device.manager().stop();
        assert!(matches!(device.wait(), Err(ScopeError::TransportClosed(_))));
    }

    struct Stub {
        mode: AtomicBool,
        waits: std::sync::atomic::AtomicUsize,
    }

    impl AsyncCapable for Stub {
        fn wait(&self) -> AppResult<()> {
            self.waits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn set_async(&self, async_mode: bool) -> AppResult<()> {
            self.mode.store(async_mode, Ordering::SeqCst);
            Ok(())
        }
        fn async_status(&self) -> Option<bool> {
            Some(self.mode.load(Ordering::SeqCst))
        }
    }

    fn stub() -> Arc<Stub> {
        Arc::new(Stub {
            mode: AtomicBool::new(false),
            waits: Default::default(),
        })
    }

    #[test]
    fn test_namespace_fans_out_and_reports_mixed() {
        let a = stub();
        let b = stub();
        let inner = Arc::new(DeviceNamespace::new());
        inner.insert("b", b.clone());
        let root = DeviceNamespace::new();
        root.insert("a", a.clone());
        root.insert("inner", inner);

        assert_eq!(root.async_status(), Some(false));
        root.set_async(true).unwrap();
        assert_eq!(root.async_status(), Some(true));
        b.set_async(false).unwrap();
        assert_eq!(root.async_status(), None);

        root.wait().unwrap();
        assert_eq!(a.waits.load(Ordering::SeqCst), 1);
        assert_eq!(b.waits.load(Ordering::SeqCst), 1);
        assert_eq!(root.names(), vec!["a", "inner"]);
    }

    #[test]
    fn test_empty_namespace_is_synchronous() {
        assert_eq!(DeviceNamespace::new().async_status(), Some(false));
    }
}
