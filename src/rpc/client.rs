//! RPC client and the proxy namespace built from a server's describe listing.

use crate::error::{AppResult, ScopeError};
use crate::net::{decode_json, write_frame, FrameEvent, FrameReader};
use crate::rpc::describe::{CommandDescriptor, ParamSpec};
use crate::rpc::{RpcReply, RpcRequest, INTERRUPT_MESSAGE};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Channel {
    reader: FrameReader<TcpStream>,
    writer: TcpStream,
}

struct ClientInner {
    channel: Mutex<Channel>,
    interrupt_socket: Mutex<Option<TcpStream>>,
    interrupt_requested: AtomicBool,
}

/// Connection to an [`RpcServer`](crate::rpc::RpcServer).
///
/// Calls are strictly request/reply: concurrent callers on a shared client are
/// serialized. Cloning shares the connection.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient").finish_non_exhaustive()
    }
}

/// Requests an interrupt of whatever call the client is blocked on.
#[derive(Clone)]
pub struct InterruptHandle {
    inner: Arc<ClientInner>,
}

impl InterruptHandle {
    /// The client forwards the interrupt to the server at its next poll, then
    /// keeps waiting for the call's reply.
    pub fn interrupt(&self) {
        self.inner.interrupt_requested.store(true, Ordering::SeqCst);
    }
}

impl RpcClient {
    /// Connect without an interrupt channel.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> AppResult<Self> {
        Self::build(addr, None)
    }

    /// Connect to both the request socket and the interrupt socket.
    pub fn connect_with_interrupt<A, B>(addr: A, interrupt_addr: B) -> AppResult<Self>
    where
        A: ToSocketAddrs,
        B: ToSocketAddrs,
    {
        let interrupt = TcpStream::connect(interrupt_addr)?;
        interrupt.set_nodelay(true)?;
        Self::build(addr, Some(interrupt))
    }

    fn build<A: ToSocketAddrs>(addr: A, interrupt: Option<TcpStream>) -> AppResult<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        let writer = stream.try_clone()?;
        debug!("connected to RPC server at {}", stream.peer_addr()?);
        Ok(Self {
            inner: Arc::new(ClientInner {
                channel: Mutex::new(Channel {
                    reader: FrameReader::new(stream),
                    writer,
                }),
                interrupt_socket: Mutex::new(interrupt),
                interrupt_requested: AtomicBool::new(false),
            }),
        })
    }

    /// Handle that can interrupt this client's calls from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Call a command and wait for its reply.
    ///
    /// Arguments are forwarded exactly as given; the server fills defaults.
    /// An error reply becomes [`ScopeError::Remote`].
    pub fn call(&self, command: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> AppResult<Value> {
        let payload = serde_json::to_vec(&RpcRequest::new(command, args, kwargs))?;
        let mut channel = self.inner.channel.lock();
        self.inner.interrupt_requested.store(false, Ordering::SeqCst);
        write_frame(&mut channel.writer, &payload)?;

        let frame = loop {
            match channel.reader.next_frame()? {
                FrameEvent::Frame(frame) => break frame,
                FrameEvent::Idle => {
                    if self.inner.interrupt_requested.swap(false, Ordering::SeqCst) {
                        self.send_interrupt(command);
                    }
                }
                FrameEvent::Closed => {
                    return Err(ScopeError::TransportClosed(
                        "RPC server closed the connection".to_string(),
                    ))
                }
            }
        };
        let reply: RpcReply = decode_json(&frame)?;
        match reply.error {
            Some(error) => Err(ScopeError::Remote(error)),
            None => Ok(reply.retval),
        }
    }

    /// Calls `command` with positional arguments only.
    pub fn call_positional(&self, command: &str, args: Vec<Value>) -> AppResult<Value> {
        self.call(command, args, Map::new())
    }

    fn send_interrupt(&self, command: &str) {
        let mut socket = self.inner.interrupt_socket.lock();
        match socket.as_mut() {
            Some(stream) => {
                debug!("interrupting '{}'", command);
                if let Err(e) = write_frame(stream, INTERRUPT_MESSAGE) {
                    warn!("could not send interrupt: {}", e);
                }
            }
            None => warn!("interrupt requested but no interrupt channel is connected"),
        }
    }

    /// Fetch the server's command listing.
    pub fn describe(&self) -> AppResult<Vec<CommandDescriptor>> {
        let listing = self.call(crate::rpc::DESCRIBE, Vec::new(), Map::new())?;
        Ok(serde_json::from_value(listing)?)
    }

    /// A callable for one command, without consulting the server.
    pub fn proxy_function(&self, command: &str) -> ProxyFunction {
        ProxyFunction {
            client: self.clone(),
            descriptor: CommandDescriptor {
                name: command.to_string(),
                doc: String::new(),
                params: ParamSpec::default(),
            },
        }
    }

    /// Mirror the server's whole command tree.
    pub fn proxy_namespace(&self) -> AppResult<ProxyNamespace> {
        Ok(ProxyNamespace::from_descriptors(self, self.describe()?))
    }
}

/// A remote command.
#[derive(Clone, Debug)]
pub struct ProxyFunction {
    client: RpcClient,
    descriptor: CommandDescriptor,
}

impl ProxyFunction {
    /// Fully qualified name.
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Docstring reported by the server.
    pub fn doc(&self) -> &str {
        &self.descriptor.doc
    }

    /// Parameter layout used to bind arguments.
    pub fn params(&self) -> &ParamSpec {
        &self.descriptor.params
    }

    /// e.g. `set_position(x, speed=1.0)`.
    pub fn signature(&self) -> String {
        let short = self.name().rsplit('.').next().unwrap_or_default();
        format!("{}{}", short, self.params().signature())
    }

    /// Invokes the remote command.
    pub fn call(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> AppResult<Value> {
        self.client.call(self.name(), args, kwargs)
    }

    /// Invokes the remote command with positional arguments only.
    pub fn call_positional(&self, args: Vec<Value>) -> AppResult<Value> {
        self.call(args, Map::new())
    }
}

/// A `get_x`/`set_x` pair presented as one attribute `x`.
#[derive(Clone, Debug, Default)]
pub struct ProxyProperty {
    getter: Option<ProxyFunction>,
    setter: Option<ProxyFunction>,
}

impl ProxyProperty {
    /// Whether the server exposes a getter.
    pub fn is_readable(&self) -> bool {
        self.getter.is_some()
    }

    /// Whether the server exposes a setter.
    pub fn is_writable(&self) -> bool {
        self.setter.is_some()
    }

    /// Reads the value through the remote getter.
    pub fn get(&self) -> AppResult<Value> {
        let getter = self
            .getter
            .as_ref()
            .ok_or_else(|| ScopeError::Property("attribute is write-only".to_string()))?;
        getter.call(Vec::new(), Map::new())
    }

    /// Writes the value through the remote setter.
    pub fn set(&self, value: Value) -> AppResult<()> {
        let setter = self
            .setter
            .as_ref()
            .ok_or_else(|| ScopeError::Property("attribute is read-only".to_string()))?;
        setter.call(vec![value], Map::new()).map(drop)
    }

    /// The getter's documentation, or the setter's if there is no getter.
    pub fn doc(&self) -> &str {
        self.getter
            .as_ref()
            .or(self.setter.as_ref())
            .map_or("", ProxyFunction::doc)
    }
}

/// Client-side mirror of a server's command tree.
#[derive(Clone, Debug, Default)]
pub struct ProxyNamespace {
    path: String,
    functions: BTreeMap<String, ProxyFunction>,
    properties: BTreeMap<String, ProxyProperty>,
    children: BTreeMap<String, ProxyNamespace>,
}

impl ProxyNamespace {
    /// Build the tree, folding accessor pairs into properties at every level.
    /// The raw `get_`/`set_` functions remain callable.
    pub fn from_descriptors(client: &RpcClient, descriptors: Vec<CommandDescriptor>) -> Self {
        let mut root = ProxyNamespace::default();
        for descriptor in descriptors {
            let segments: Vec<String> = descriptor.name.split('.').map(str::to_string).collect();
            let Some((leaf, parents)) = segments.split_last() else {
                continue;
            };
            let mut node = &mut root;
            for segment in parents {
                let path = node.qualify(segment);
                node = node
                    .children
                    .entry(segment.clone())
                    .or_insert_with(|| ProxyNamespace {
                        path,
                        ..ProxyNamespace::default()
                    });
            }
            node.functions.insert(
                leaf.clone(),
                ProxyFunction {
                    client: client.clone(),
                    descriptor,
                },
            );
        }
        root.fold_accessors();
        root
    }

    fn qualify(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.path, name)
        }
    }

    fn fold_accessors(&mut self) {
        for (name, function) in &self.functions {
            if let Some(attribute) = name.strip_prefix("get_").filter(|a| !a.is_empty()) {
                self.properties
                    .entry(attribute.to_string())
                    .or_default()
                    .getter = Some(function.clone());
            } else if let Some(attribute) = name.strip_prefix("set_").filter(|a| !a.is_empty()) {
                self.properties
                    .entry(attribute.to_string())
                    .or_default()
                    .setter = Some(function.clone());
            }
        }
        for child in self.children.values_mut() {
            child.fold_accessors();
        }
    }

    /// Dotted path of this namespace; empty at the root.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Nested namespace called `name`.
    pub fn child(&self, name: &str) -> Option<&ProxyNamespace> {
        self.children.get(name)
    }

    /// Function called `name` at this level.
    pub fn function(&self, name: &str) -> Option<&ProxyFunction> {
        self.functions.get(name)
    }

    /// Property called `name` at this level.
    pub fn property(&self, name: &str) -> Option<&ProxyProperty> {
        self.properties.get(name)
    }

    /// Walk a relative dotted path to a namespace.
    pub fn namespace(&self, path: &str) -> Option<&ProxyNamespace> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('.')
            .try_fold(self, |node, segment| node.children.get(segment))
    }

    /// Walk a relative dotted path to a function.
    pub fn resolve(&self, path: &str) -> Option<&ProxyFunction> {
        let (parent, leaf) = split_path(path);
        self.namespace(parent)?.function(leaf)
    }

    /// Call a function by relative dotted path.
    pub fn call(&self, path: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> AppResult<Value> {
        let function = self
            .resolve(path)
            .ok_or_else(|| ScopeError::NoSuchCommand(self.qualify(path)))?;
        function.call(args, kwargs)
    }

    /// Read a folded property by relative dotted path.
    pub fn get(&self, path: &str) -> AppResult<Value> {
        self.resolve_property(path)?.get()
    }

    /// Write a folded property by relative dotted path.
    pub fn set(&self, path: &str, value: Value) -> AppResult<()> {
        self.resolve_property(path)?.set(value)
    }

    fn resolve_property(&self, path: &str) -> AppResult<&ProxyProperty> {
        let (parent, leaf) = split_path(path);
        self.namespace(parent)
            .and_then(|node| node.property(leaf))
            .ok_or_else(|| ScopeError::Property(format!("no attribute '{}'", self.qualify(path))))
    }

    /// Names of the functions at this level, sorted.
    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Names of the properties at this level, sorted.
    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    /// Names of the nested namespaces, sorted.
    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }
}

fn split_path(path: &str) -> (&str, &str) {
    path.rsplit_once('.').unwrap_or(("", path))
}
