//! Property subscriber.
//!
//! A background thread receives `(name, value)` updates, stores the latest
//! value of every property locally and invokes the matching callbacks.
//! Callbacks run on that thread; a panicking callback is logged and does not
//! stop delivery to the others.
//!
//! Subscriptions and cached values belong to the client, not the connection:
//! [`PropertyClient::reconnect`] opens a fresh connection and keeps both.

use crate::error::{AppResult, ScopeError};
use crate::net::{FrameEvent, FrameReader};
use crate::properties::trie::PrefixTrie;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Handle for removing a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
enum Callback {
    Named(Arc<dyn Fn(&str, &Value) + Send + Sync>),
    ValueOnly(Arc<dyn Fn(&Value) + Send + Sync>),
}

impl Callback {
    fn invoke(&self, name: &str, value: &Value) {
        match self {
            Callback::Named(callback) => callback(name, value),
            Callback::ValueOnly(callback) => callback(value),
        }
    }
}

#[derive(Default)]
struct ClientInner {
    values: Mutex<HashMap<String, Value>>,
    exact: Mutex<HashMap<String, Vec<(SubscriptionId, Callback)>>>,
    prefixes: Mutex<PrefixTrie<(SubscriptionId, Callback)>>,
    next_id: AtomicU64,
    running: AtomicBool,
}

impl ClientInner {
    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn deliver(&self, name: &str, value: Value) {
        self.values.lock().insert(name.to_string(), value.clone());

        let mut callbacks: Vec<Callback> = self
            .exact
            .lock()
            .get(name)
            .map(|subscribed| subscribed.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        callbacks.extend(
            self.prefixes
                .lock()
                .matches(name)
                .into_iter()
                .map(|(_, cb)| cb.clone()),
        );

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback.invoke(name, &value))).is_err() {
                error!("callback for property '{}' panicked", name);
            }
        }
    }
}

/// Connection to a [`PropertyServer`](crate::properties::PropertyServer).
pub struct PropertyClient {
    inner: Arc<ClientInner>,
    server: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PropertyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyClient")
            .field("server", &self.server)
            .field("known_properties", &self.inner.values.lock().len())
            .finish()
    }
}

impl PropertyClient {
    /// Connect and start receiving updates.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> AppResult<Self> {
        let inner = Arc::new(ClientInner::default());
        let (server, thread) = spawn_receiver(addr, &inner)?;
        Ok(Self {
            inner,
            server,
            thread: Some(thread),
        })
    }

    /// Drop the current connection and open a new one to the same server.
    /// Subscriptions and cached values are kept.
    pub fn reconnect(&mut self) -> AppResult<()> {
        self.stop();
        let (server, thread) = spawn_receiver(self.server, &self.inner)?;
        self.server = server;
        self.thread = Some(thread);
        Ok(())
    }

    /// Address of the property server.
    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    /// Call `callback(name, value)` on every update of exactly `name`.
    pub fn subscribe<F>(&self, name: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.add_exact(name, Callback::Named(Arc::new(callback)))
    }

    /// Call `callback(value)` on every update of exactly `name`.
    pub fn subscribe_value<F>(&self, name: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.add_exact(name, Callback::ValueOnly(Arc::new(callback)))
    }

    /// Call `callback(name, value)` for every property under `prefix`.
    /// The empty prefix matches everything.
    pub fn subscribe_prefix<F>(&self, prefix: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.add_prefix(prefix, Callback::Named(Arc::new(callback)))
    }

    fn add_prefix(&self, prefix: &str, callback: Callback) -> SubscriptionId {
        let id = self.inner.next_id();
        self.inner.prefixes.lock().insert(prefix, (id, callback));
        id
    }

    fn add_exact(&self, name: &str, callback: Callback) -> SubscriptionId {
        let id = self.inner.next_id();
        self.inner
            .exact
            .lock()
            .entry(name.to_string())
            .or_default()
            .push((id, callback));
        id
    }

    /// Register copies of every subscription held by `other`.
    ///
    /// The copies get new ids on this client. Returns how many were copied.
    pub fn subscribe_from(&self, other: &PropertyClient) -> usize {
        let exact: Vec<(String, Callback)> = other
            .inner
            .exact
            .lock()
            .iter()
            .flat_map(|(name, subscribed)| {
                subscribed
                    .iter()
                    .map(move |(_, callback)| (name.clone(), callback.clone()))
            })
            .collect();
        let prefixes: Vec<(String, Callback)> = other
            .inner
            .prefixes
            .lock()
            .entries()
            .into_iter()
            .map(|(prefix, (_, callback))| (prefix, callback.clone()))
            .collect();

        let copied = exact.len() + prefixes.len();
        for (name, callback) in exact {
            self.add_exact(&name, callback);
        }
        for (prefix, callback) in prefixes {
            self.add_prefix(&prefix, callback);
        }
        debug!("copied {} subscription(s) from {}", copied, other.server);
        copied
    }

    /// Remove one exact-name subscription.
    pub fn unsubscribe(&self, name: &str, id: SubscriptionId) -> AppResult<()> {
        let mut exact = self.inner.exact.lock();
        let subscribed = exact
            .get_mut(name)
            .ok_or_else(|| not_subscribed(name))?;
        let index = subscribed
            .iter()
            .position(|(existing, _)| *existing == id)
            .ok_or_else(|| not_subscribed(name))?;
        subscribed.remove(index);
        if subscribed.is_empty() {
            exact.remove(name);
        }
        Ok(())
    }

    /// Remove one prefix subscription.
    pub fn unsubscribe_prefix(&self, prefix: &str, id: SubscriptionId) -> AppResult<()> {
        self.inner
            .prefixes
            .lock()
            .remove_first(prefix, |(existing, _)| *existing == id)
            .map(drop)
            .ok_or_else(|| not_subscribed(prefix))
    }

    /// Latest value received for `name`.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.values.lock().get(name).cloned()
    }

    /// Snapshot of every value received so far.
    pub fn properties(&self) -> HashMap<String, Value> {
        self.inner.values.lock().clone()
    }

    /// False once the connection is lost or the client is stopped.
    pub fn is_connected(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Close the connection and join the receive thread.
    pub fn stop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("property receive thread panicked");
            }
        }
    }
}

impl Drop for PropertyClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_receiver<A: ToSocketAddrs>(
    addr: A,
    inner: &Arc<ClientInner>,
) -> AppResult<(SocketAddr, JoinHandle<()>)> {
    let stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    let peer = stream.peer_addr()?;
    inner.running.store(true, Ordering::SeqCst);
    let receiver = Arc::clone(inner);
    let thread = thread::Builder::new()
        .name("property-client".to_string())
        .spawn(move || receive_loop(FrameReader::new(stream), &receiver))?;
    info!("subscribed to properties at {}", peer);
    Ok((peer, thread))
}

fn not_subscribed(name: &str) -> ScopeError {
    ScopeError::Property(format!("no such subscription for '{name}'"))
}

fn receive_loop(mut reader: FrameReader<TcpStream>, inner: &ClientInner) {
    let mut topic: Option<String> = None;
    while inner.running.load(Ordering::SeqCst) {
        let frame = match reader.next_frame() {
            Ok(FrameEvent::Frame(frame)) => frame,
            Ok(FrameEvent::Idle) => continue,
            Ok(FrameEvent::Closed) => {
                info!("property server closed the connection");
                break;
            }
            Err(e) => {
                warn!("property stream failed: {}", e);
                break;
            }
        };
        match topic.take() {
            None => topic = Some(String::from_utf8_lossy(&frame).into_owned()),
            Some(name) => match serde_json::from_slice::<Value>(&frame) {
                Ok(value) => {
                    debug!("property {} = {}", name, value);
                    inner.deliver(&name, value);
                }
                Err(e) => warn!("undecodable value for property '{}': {}", name, e),
            },
        }
    }
    inner.running.store(false, Ordering::SeqCst);
}
