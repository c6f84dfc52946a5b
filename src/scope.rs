//! Wiring of configured devices into managers, namespaces and RPC commands.
//!
//! One [`MessageManager`] is opened per distinct port; every device on that
//! port gets its own [`AsyncDevice`] on the shared manager. All devices are
//! collected in a [`DeviceNamespace`] and exposed over RPC as
//! `<app>.<device>.<command>`:
//!
//! | command                      | effect                                   |
//! |------------------------------|------------------------------------------|
//! | `<app>.wait()`               | wait on every device                     |
//! | `<app>.set_async(async_mode)`| switch every device                      |
//! | `<app>.get_async()`          | `true`/`false`, or `null` if mixed       |
//! | `<app>.rebroadcast_properties()` | replay every property value          |
//! | `<app>.<dev>.send_message(message, async_mode=null)` | raw command      |
//! | `<app>.<dev>.wait()` / `set_async` / `get_async` / `has_pending` |      |
//!
//! Configured event keys are published as properties named
//! `<app>.<device>.events.<key>`.
//!
//! Every command that blocks on a device honours the RPC interrupt, so an
//! `interrupt` releases a call stuck on hardware that never answers.

use crate::config::{CorrelatorKind, DeviceDefinition, ScopeConfig, TransportKind};
use crate::error::{AppResult, ScopeError};
use crate::messaging::{
    AsyncCapable, AsyncDevice, Correlator, DeviceNamespace, EchoCorrelator,
    FunctionUnitCorrelator, MessageManager, SendOptions, Transport,
};
use crate::properties::{PropertyDevice, PropertyServer};
use crate::rpc::{
    CommandTree, CommandTreeBuilder, HeartbeatServer, Interrupter, ParamSpec, RpcServer,
    ServerHandle,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Build the correlator named in a device definition.
pub fn correlator_for(kind: CorrelatorKind) -> Arc<dyn Correlator> {
    match kind {
        CorrelatorKind::Echo => Arc::new(EchoCorrelator),
        CorrelatorKind::FunctionUnit => Arc::new(FunctionUnitCorrelator),
    }
}

/// Open the transport described by a device definition.
pub fn open_transport(definition: &DeviceDefinition, read_timeout: Duration) -> AppResult<Transport> {
    let terminator = definition.terminator.as_bytes();
    match definition.transport {
        TransportKind::Tcp => Transport::tcp(definition.port.as_str(), terminator, read_timeout),
        #[cfg(feature = "instrument_serial")]
        TransportKind::Serial => Transport::serial(
            &definition.port,
            definition.baud_rate,
            terminator,
            read_timeout,
        ),
        #[cfg(not(feature = "instrument_serial"))]
        TransportKind::Serial => Err(ScopeError::Configuration(format!(
            "device '{}' needs a serial port, but serial support is not compiled in \
             (enable the instrument_serial feature)",
            definition.name
        ))),
    }
}

/// The rig: every configured device, reachable by name.
pub struct Scope {
    name: String,
    managers: BTreeMap<String, Arc<MessageManager>>,
    devices: BTreeMap<String, Arc<AsyncDevice>>,
    namespace: Arc<DeviceNamespace>,
    properties: PropertyDevice,
    property_server: Option<Arc<PropertyServer>>,
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.name)
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Scope {
    /// An empty rig. Properties are published only if a server is given.
    pub fn new(name: impl Into<String>, property_server: Option<Arc<PropertyServer>>) -> Self {
        let name = name.into();
        Self {
            properties: PropertyDevice::new(property_server.clone(), name.clone()),
            name,
            managers: BTreeMap::new(),
            devices: BTreeMap::new(),
            namespace: Arc::new(DeviceNamespace::new()),
            property_server,
        }
    }

    /// Open every configured device. A device whose port cannot be opened is
    /// logged and left out; the rest of the rig still comes up.
    pub fn from_config(config: &ScopeConfig, property_server: Option<Arc<PropertyServer>>) -> AppResult<Self> {
        let mut scope = Self::new(&config.application.name, property_server);
        for definition in &config.devices {
            let manager = match scope.manager_for(definition, config.messaging.read_timeout()) {
                Ok(manager) => manager,
                Err(e) => {
                    warn!("device '{}' unavailable: {}", definition.name, e);
                    continue;
                }
            };
            let device = Arc::new(AsyncDevice::new(&definition.name, manager));
            scope.add_device(device, &definition.event_keys)?;
        }
        info!(
            "scope '{}' up with {} device(s) on {} port(s)",
            scope.name,
            scope.devices.len(),
            scope.managers.len()
        );
        Ok(scope)
    }

    fn manager_for(&mut self, definition: &DeviceDefinition, read_timeout: Duration) -> AppResult<Arc<MessageManager>> {
        if let Some(manager) = self.managers.get(&definition.port) {
            return Ok(Arc::clone(manager));
        }
        let transport = open_transport(definition, read_timeout)?;
        let manager = MessageManager::spawn(
            definition.port.clone(),
            transport,
            correlator_for(definition.correlator),
        )?;
        self.managers
            .insert(definition.port.clone(), Arc::clone(&manager));
        Ok(manager)
    }

    /// Register a device and publish its event keys as properties.
    pub fn add_device(&mut self, device: Arc<AsyncDevice>, event_keys: &[String]) -> AppResult<()> {
        let name = device.name().to_string();
        if self.devices.contains_key(&name) {
            return Err(ScopeError::Configuration(format!(
                "device '{name}' registered twice"
            )));
        }
        let events = self.properties.child(&name).child("events");
        for key in event_keys {
            let updater = events.add_property(key, Value::Null);
            device.register_event_callback(key.clone(), move |message| {
                updater.update(Value::String(String::from_utf8_lossy(message).into_owned()));
            })?;
        }
        self.managers
            .entry(device.manager().name().to_string())
            .or_insert_with(|| Arc::clone(device.manager()));
        self.namespace.insert(name.clone(), Arc::clone(&device) as Arc<dyn AsyncCapable>);
        self.devices.insert(name, device);
        Ok(())
    }

    /// Application name, the root of every command and property path.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A device by name.
    pub fn device(&self, name: &str) -> Option<&Arc<AsyncDevice>> {
        self.devices.get(name)
    }

    /// Device names, sorted.
    pub fn device_names(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    /// Every device as one [`AsyncCapable`] unit.
    pub fn namespace(&self) -> &Arc<DeviceNamespace> {
        &self.namespace
    }

    /// Commands exposing the rig, rooted at the application name.
    pub fn command_tree(&self) -> AppResult<CommandTree> {
        let mut builder = CommandTree::builder();
        builder.namespace(&self.name, |root| {
            self.register_root_commands(root);
            for (name, device) in &self.devices {
                root.namespace(name, |ns| register_device_commands(ns, device));
            }
        });
        builder.build()
    }

    fn register_root_commands(&self, root: &mut CommandTreeBuilder) {
        let namespace = Arc::clone(&self.namespace);
        root.command(
            "wait",
            "Wait until every device has received all outstanding responses.",
            ParamSpec::new(),
            move |ctx| {
                namespace.wait_interruptible(ctx.interrupt())?;
                Ok(Value::Null)
            },
        );

        let namespace = Arc::clone(&self.namespace);
        root.command(
            "set_async",
            "Put every device in asynchronous (true) or synchronous (false) mode.",
            ParamSpec::new().arg("async_mode"),
            move |ctx| {
                let async_mode: bool = ctx.get("async_mode")?;
                if !async_mode {
                    namespace.wait_interruptible(ctx.interrupt())?;
                }
                namespace.set_async(async_mode)?;
                Ok(Value::Null)
            },
        );

        let namespace = Arc::clone(&self.namespace);
        root.command(
            "get_async",
            "True if every device is asynchronous, false if none is, null if mixed.",
            ParamSpec::new(),
            move |_| Ok(json!(namespace.async_status())),
        );

        let server = self.property_server.clone();
        root.command(
            "rebroadcast_properties",
            "Re-send every property value to all subscribers.",
            ParamSpec::new(),
            move |_| {
                if let Some(server) = &server {
                    server.rebroadcast_all();
                }
                Ok(Value::Null)
            },
        );
    }

    /// Stop every message manager and wait for their receive threads.
    pub fn shutdown(&self) {
        for manager in self.managers.values() {
            manager.stop();
        }
        for manager in self.managers.values() {
            manager.join();
        }
        info!("scope '{}' shut down", self.name);
    }
}

fn register_device_commands(ns: &mut CommandTreeBuilder, device: &Arc<AsyncDevice>) {
    let d = Arc::clone(device);
    ns.command(
        "send_message",
        "Send a raw command. Returns the response, or null in asynchronous mode.",
        ParamSpec::new()
            .arg("message")
            .arg_default("async_mode", Value::Null),
        move |ctx| {
            let message: String = ctx.get("message")?;
            let options = SendOptions {
                async_mode: ctx.get("async_mode")?,
                ..SendOptions::default()
            }
            .interruptible(ctx.interrupt().clone());
            let response = d.send_message_with(message, options)?;
            Ok(response.map_or(Value::Null, |r| {
                Value::String(String::from_utf8_lossy(&r).into_owned())
            }))
        },
    );

    let d = Arc::clone(device);
    ns.command(
        "wait",
        "Wait for all outstanding responses; reports the first error.",
        ParamSpec::new(),
        move |ctx| {
            d.wait_interruptible(ctx.interrupt())?;
            Ok(Value::Null)
        },
    );

    let d = Arc::clone(device);
    ns.command(
        "set_async",
        "Switch between asynchronous (true) and synchronous (false) mode.",
        ParamSpec::new().arg("async_mode"),
        move |ctx| {
            let async_mode: bool = ctx.get("async_mode")?;
            if !async_mode {
                d.wait_interruptible(ctx.interrupt())?;
            }
            d.set_async(async_mode)?;
            Ok(Value::Null)
        },
    );

    let d = Arc::clone(device);
    ns.command(
        "get_async",
        "Whether the device is in asynchronous mode.",
        ParamSpec::new(),
        move |_| Ok(json!(d.get_async())),
    );

    let d = Arc::clone(device);
    ns.command(
        "has_pending",
        "Whether any asynchronous response is still outstanding.",
        ParamSpec::new(),
        move |_| Ok(json!(d.has_pending())),
    );
}

/// Everything `rust_scope serve` runs: devices, RPC, interrupts, properties
/// and heartbeat.
pub struct ScopeServer {
    scope: Scope,
    rpc: RpcServer,
    listener: TcpListener,
    properties: Arc<PropertyServer>,
    heartbeat: HeartbeatServer,
}

impl ScopeServer {
    /// Bind every socket named in the configuration and open all devices.
    pub fn bind(config: &ScopeConfig) -> AppResult<Self> {
        let properties = Arc::new(PropertyServer::bind(config.server.property_addr())?);
        let scope = Scope::from_config(config, Some(Arc::clone(&properties)))?;
        let tree = scope.command_tree()?;
        let interrupter = Interrupter::bind(config.server.interrupt_addr())?;
        let listener = TcpListener::bind(config.server.rpc_addr())?;
        let heartbeat = HeartbeatServer::bind(
            config.server.heartbeat_addr(),
            config.server.heartbeat_interval(),
        )?;
        Ok(Self {
            rpc: RpcServer::new(tree, interrupter),
            scope,
            listener,
            properties,
            heartbeat,
        })
    }

    /// Stops [`run`](Self::run) from another thread.
    pub fn handle(&self) -> ServerHandle {
        self.rpc.handle()
    }

    /// Bound RPC address; useful when configured with port 0.
    pub fn rpc_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Bound heartbeat address.
    pub fn heartbeat_addr(&self) -> SocketAddr {
        self.heartbeat.local_addr()
    }

    /// The rig being served.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Serve until the handle is stopped, then shut everything down.
    pub fn run(self) -> AppResult<()> {
        let result = self.rpc.serve(self.listener);
        self.heartbeat.stop();
        self.scope.shutdown();
        self.properties.stop();
        result
    }
}
