//! A whole rig assembled from configuration, driven over RPC and watched
//! through properties.

use rust_scope::config::ScopeConfig;
use rust_scope::messaging::{EchoDevice, EchoServer};
use rust_scope::properties::{PropertyClient, PropertyServer};
use rust_scope::rpc::{Interrupter, RpcClient, RpcServer, ServerHandle};
use rust_scope::scope::Scope;
use serde_json::{json, Value};
use std::net::{SocketAddr, TcpListener};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

fn rig_config(echo: &EchoServer) -> ScopeConfig {
    let source = format!(
        r#"
[application]
name = "scope"
log_level = "debug"

[messaging]
read_timeout_ms = 20

[[devices]]
name = "stage"
transport = "tcp"
port = "{port}"
event_keys = ["LIMIT"]

[[devices]]
name = "lamp"
transport = "tcp"
port = "{port}"
"#,
        port = echo.local_addr()
    );
    ScopeConfig::from_toml_str(&source).expect("rig config should parse")
}

struct Rig {
    _echo: EchoServer,
    scope: Arc<Scope>,
    properties: Arc<PropertyServer>,
    rpc_addr: SocketAddr,
    handle: ServerHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.scope.shutdown();
    }
}

fn start_rig() -> Rig {
    let echo = EchoDevice::new(b"\r")
        .with_max_delay(Duration::from_millis(20))
        .listen("127.0.0.1:0")
        .unwrap();
    let config = rig_config(&echo);
    let properties = Arc::new(PropertyServer::bind("127.0.0.1:0").unwrap());
    let scope = Arc::new(Scope::from_config(&config, Some(Arc::clone(&properties))).unwrap());

    let server = RpcServer::new(scope.command_tree().unwrap(), Interrupter::detached());
    let handle = server.handle();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let rpc_addr = listener.local_addr().unwrap();
    let thread = thread::spawn(move || server.serve(listener).unwrap());

    Rig {
        _echo: echo,
        scope,
        properties,
        rpc_addr,
        handle,
        thread: Some(thread),
    }
}

#[test]
fn test_devices_on_one_port_share_a_manager() {
    let rig = start_rig();
    assert_eq!(rig.scope.device_names(), vec!["lamp", "stage"]);
    let stage = rig.scope.device("stage").unwrap();
    let lamp = rig.scope.device("lamp").unwrap();
    assert!(Arc::ptr_eq(stage.manager(), lamp.manager()));
}

#[test]
fn test_rpc_drives_devices() {
    let rig = start_rig();
    let client = RpcClient::connect(rig.rpc_addr).unwrap();

    let reply = client
        .call_positional("scope.stage.send_message", vec![json!("MOVE 5")])
        .unwrap();
    assert_eq!(reply, json!("MOVE 5"));

    client.call_positional("scope.set_async", vec![json!(true)]).unwrap();
    assert_eq!(client.call_positional("scope.get_async", vec![]).unwrap(), json!(true));
    for i in 0..5 {
        let reply = client
            .call_positional("scope.lamp.send_message", vec![json!(format!("LEVEL {i}"))])
            .unwrap();
        assert_eq!(reply, Value::Null);
    }
    client.call_positional("scope.wait", vec![]).unwrap();
    assert_eq!(client.call_positional("scope.lamp.has_pending", vec![]).unwrap(), json!(false));

    client.call_positional("scope.lamp.set_async", vec![json!(false)]).unwrap();
    assert_eq!(client.call_positional("scope.get_async", vec![]).unwrap(), Value::Null);
}

#[test]
fn test_device_events_become_properties() {
    let rig = start_rig();
    let watcher = PropertyClient::connect(rig.properties.local_addr()).unwrap();
    let (tx, rx) = mpsc::channel();
    let tx = parking_lot::Mutex::new(tx);
    watcher.subscribe("scope.stage.events.LIMIT", move |_, value| {
        let _ = tx.lock().send(value.clone());
    });
    let deadline = Instant::now() + TIMEOUT;
    while rig.properties.subscriber_count() < 1 {
        assert!(Instant::now() < deadline, "watcher never connected");
        thread::sleep(Duration::from_millis(10));
    }

    // The echo of an unawaited "LIMIT" is indistinguishable from the device
    // raising the event itself.
    let stage = rig.scope.device("stage").unwrap();
    stage.manager().send(b"LIMIT").unwrap();
    let event = std::iter::from_fn(|| rx.recv_timeout(TIMEOUT).ok())
        .find(|value| !value.is_null())
        .expect("event should be published");
    assert_eq!(event, json!("LIMIT"));
    assert_eq!(rig.properties.get("scope.stage.events.LIMIT"), Some(json!("LIMIT")));
}

#[test]
fn test_rebroadcast_command_resends_properties() {
    let rig = start_rig();
    let watcher = PropertyClient::connect(rig.properties.local_addr()).unwrap();
    let (tx, rx) = mpsc::channel();
    let tx = parking_lot::Mutex::new(tx);
    watcher.subscribe_prefix("scope", move |name, _| {
        let _ = tx.lock().send(name.to_string());
    });
    let deadline = Instant::now() + TIMEOUT;
    while rig.properties.subscriber_count() < 1 {
        assert!(Instant::now() < deadline, "watcher never connected");
        thread::sleep(Duration::from_millis(10));
    }

    let client = RpcClient::connect(rig.rpc_addr).unwrap();
    client.call_positional("scope.rebroadcast_properties", vec![]).unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "scope.stage.events.LIMIT");
}

/// Accepts connections and never answers; keeps them open until dropped.
struct SilentDevice {
    addr: SocketAddr,
    _done: mpsc::Sender<()>,
}

fn silent_device() -> SilentDevice {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (done, wait_done) = mpsc::channel::<()>();
    thread::spawn(move || {
        let (_stream, _) = listener.accept().unwrap();
        let _ = wait_done.recv();
    });
    SilentDevice { addr, _done: done }
}

#[test]
fn test_interrupt_releases_call_blocked_on_silent_device() {
    let device = silent_device();
    let source = format!(
        r#"
[messaging]
read_timeout_ms = 20

[[devices]]
name = "stage"
transport = "tcp"
port = "{}"
"#,
        device.addr
    );
    let config = ScopeConfig::from_toml_str(&source).unwrap();
    let scope = Scope::from_config(&config, None).unwrap();
    let interrupter = Interrupter::bind("127.0.0.1:0").unwrap();
    let interrupt_addr = interrupter.local_addr().unwrap();
    let server = RpcServer::new(scope.command_tree().unwrap(), interrupter);
    let handle = server.handle();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let rpc_addr = listener.local_addr().unwrap();
    let serving = thread::spawn(move || server.serve(listener).unwrap());

    let client = RpcClient::connect_with_interrupt(rpc_addr, interrupt_addr).unwrap();
    let interrupt = client.interrupt_handle();
    let trigger = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        interrupt.interrupt();
    });

    let started = Instant::now();
    match client.call_positional("scope.stage.send_message", vec![json!("HOME")]) {
        Err(rust_scope::ScopeError::Remote(message)) => assert!(message.contains("interrupted")),
        other => panic!("expected an interrupted call, got {other:?}"),
    }
    assert!(started.elapsed() < TIMEOUT);
    trigger.join().unwrap();

    // The server is free again and the device's mode is untouched.
    assert_eq!(client.call_positional("scope.get_async", vec![]).unwrap(), json!(false));

    handle.stop();
    serving.join().unwrap();
    scope.shutdown();
}
