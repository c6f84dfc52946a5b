//! Property broadcast server.
//!
//! Keeps the latest value of every named property and pushes each update to
//! all connected subscribers as two frames: the property name, then its JSON
//! value. Updates go through a single FIFO queue drained by one publisher
//! thread, so subscribers see updates to any one property in publish order.
//!
//! Declaring a property records its initial value without broadcasting it. A
//! subscriber therefore only sees later updates until
//! [`PropertyServer::rebroadcast_all`] replays the whole table.

use crate::error::{AppResult, ScopeError};
use crate::net::encode_frame;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

struct Subscriber {
    stream: TcpStream,
    peer: SocketAddr,
}

struct ServerInner {
    properties: Mutex<BTreeMap<String, Value>>,
    queue: Mutex<mpsc::Sender<(String, Value)>>,
    subscribers: Mutex<Vec<Subscriber>>,
    running: AtomicBool,
}

impl ServerInner {
    fn record(&self, name: &str, value: Value) {
        self.properties.lock().insert(name.to_string(), value);
    }

    fn update(&self, name: &str, value: Value) {
        self.record(name, value.clone());
        if self.queue.lock().send((name.to_string(), value)).is_err() {
            debug!("property '{}' updated after the publisher stopped", name);
        }
    }

    fn publish(&self, name: &str, value: &Value) {
        let mut message = Vec::new();
        let encoded = serde_json::to_vec(value)
            .map_err(ScopeError::from)
            .and_then(|payload| {
                encode_frame(&mut message, name.as_bytes())?;
                encode_frame(&mut message, &payload)
            });
        if let Err(e) = encoded {
            error!("could not encode property '{}': {}", name, e);
            return;
        }
        self.subscribers.lock().retain_mut(|subscriber| {
            match subscriber.stream.write_all(&message) {
                Ok(()) => true,
                Err(e) => {
                    info!("dropping property subscriber {}: {}", subscriber.peer, e);
                    false
                }
            }
        });
    }
}

/// Publishes property updates to any number of [`PropertyClient`](crate::properties::PropertyClient)s.
pub struct PropertyServer {
    inner: Arc<ServerInner>,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for PropertyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyServer")
            .field("local_addr", &self.local_addr)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl PropertyServer {
    /// Listen for subscribers on `addr` and start publishing.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> AppResult<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let (queue, updates) = mpsc::channel::<(String, Value)>();
        let inner = Arc::new(ServerInner {
            properties: Mutex::new(BTreeMap::new()),
            queue: Mutex::new(queue),
            subscribers: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        });

        let acceptor = Arc::clone(&inner);
        thread::Builder::new()
            .name("property-accept".to_string())
            .spawn(move || accept_subscribers(&listener, &acceptor))?;

        let publisher = Arc::clone(&inner);
        thread::Builder::new()
            .name("property-publish".to_string())
            .spawn(move || {
                while publisher.running.load(Ordering::SeqCst) {
                    match updates.recv_timeout(POLL_INTERVAL) {
                        Ok((name, value)) => publisher.publish(&name, &value),
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        info!("property server listening on {}", local_addr);
        Ok(Self { inner, local_addr })
    }

    /// Address subscribers connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Declare a property with its initial value and get an updater for it.
    /// The initial value is recorded, not broadcast.
    pub fn add_property(&self, name: impl Into<String>, initial: Value) -> PropertyUpdater {
        let name = name.into();
        self.inner.record(&name, initial);
        PropertyUpdater {
            name,
            server: Some(Arc::downgrade(&self.inner)),
        }
    }

    /// Store and broadcast a new value.
    pub fn update_property(&self, name: &str, value: Value) {
        self.inner.update(name, value);
    }

    /// Re-send every current value, e.g. after a client connects late.
    pub fn rebroadcast_all(&self) {
        let snapshot = self.inner.properties.lock().clone();
        debug!("rebroadcasting {} properties", snapshot.len());
        for (name, value) in snapshot {
            if self.inner.queue.lock().send((name, value)).is_err() {
                break;
            }
        }
    }

    /// Current value of `name`.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.properties.lock().get(name).cloned()
    }

    /// Every known property name, sorted.
    pub fn property_names(&self) -> Vec<String> {
        self.inner.properties.lock().keys().cloned().collect()
    }

    /// Number of connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Stop accepting and publishing. Connected subscribers are closed.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            self.inner.subscribers.lock().clear();
            info!("property server on {} stopped", self.local_addr);
        }
    }
}

impl Drop for PropertyServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_subscribers(listener: &TcpListener, inner: &ServerInner) {
    while inner.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let configured = stream
                    .set_nonblocking(false)
                    .and_then(|()| stream.set_nodelay(true))
                    .and_then(|()| stream.set_write_timeout(Some(WRITE_TIMEOUT)));
                match configured {
                    Ok(()) => {
                        debug!("property subscriber {} connected", peer);
                        inner.subscribers.lock().push(Subscriber { stream, peer });
                    }
                    Err(e) => warn!("could not configure subscriber {}: {}", peer, e),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                warn!("property accept failed: {}", e);
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

/// Updates one property. Does nothing once the server is gone, or if it was
/// created without a server.
#[derive(Debug, Clone)]
pub struct PropertyUpdater {
    name: String,
    server: Option<Weak<ServerInner>>,
}

impl PropertyUpdater {
    /// An updater not attached to any server.
    pub fn detached(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server: None,
        }
    }

    /// Fully qualified property name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store and broadcast a new value.
    pub fn update(&self, value: Value) {
        if let Some(server) = self.server.as_ref().and_then(Weak::upgrade) {
            server.update(&self.name, value);
        }
    }

    /// Serialize `value` and publish it.
    pub fn update_with<T: Serialize>(&self, value: &T) -> AppResult<()> {
        self.update(serde_json::to_value(value)?);
        Ok(())
    }
}

/// Publishes properties under a fixed name prefix, e.g. `scope.stage.`.
///
/// Built without a server, every operation is a no-op, so devices can publish
/// unconditionally.
#[derive(Debug, Clone)]
pub struct PropertyDevice {
    server: Option<Arc<PropertyServer>>,
    prefix: String,
}

impl PropertyDevice {
    /// Publish under `prefix`; a missing trailing `.` is added.
    pub fn new(server: Option<Arc<PropertyServer>>, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with('.') {
            prefix.push('.');
        }
        Self { server, prefix }
    }

    /// The prefix, ending in `.` unless empty.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// A device for a nested prefix on the same server.
    pub fn child(&self, name: &str) -> Self {
        Self::new(self.server.clone(), format!("{}{}", self.prefix, name))
    }

    /// [`PropertyServer::add_property`] under this prefix.
    pub fn add_property(&self, name: &str, initial: Value) -> PropertyUpdater {
        let qualified = format!("{}{}", self.prefix, name);
        match &self.server {
            Some(server) => server.add_property(qualified, initial),
            None => PropertyUpdater::detached(qualified),
        }
    }

    /// [`PropertyServer::update_property`] under this prefix.
    pub fn update_property(&self, name: &str, value: Value) {
        if let Some(server) = &self.server {
            server.update_property(&format!("{}{}", self.prefix, name), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_tracks_latest_value() {
        let server = PropertyServer::bind("127.0.0.1:0").unwrap();
        let updater = server.add_property("scope.stage.x", json!(0.0));
        updater.update(json!(5.5));
        assert_eq!(server.get("scope.stage.x"), Some(json!(5.5)));
        assert_eq!(server.property_names(), vec!["scope.stage.x"]);
    }

    #[test]
    fn test_property_device_prefixes_names() {
        let server = Arc::new(PropertyServer::bind("127.0.0.1:0").unwrap());
        let device = PropertyDevice::new(Some(Arc::clone(&server)), "scope");
        let stage = device.child("stage");
        stage.add_property("x", json!(1));
        stage.update_property("x", json!(2));
        assert_eq!(stage.prefix(), "scope.stage.");
        assert_eq!(server.get("scope.stage.x"), Some(json!(2)));
    }

    #[test]
    fn test_property_device_without_server_is_noop() {
        let device = PropertyDevice::new(None, "scope.stage");
        let updater = device.add_property("x", json!(1));
        updater.update(json!(2));
        device.update_property("x", json!(3));
        assert_eq!(updater.name(), "scope.stage.x");
    }

    #[test]
    fn test_updater_outliving_server_is_harmless() {
        let server = PropertyServer::bind("127.0.0.1:0").unwrap();
        let updater = server.add_property("a", json!(null));
        drop(server);
        updater.update(json!(1));
    }
}
