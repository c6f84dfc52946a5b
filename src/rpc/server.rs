//! RPC server and interrupt listener.
//!
//! Connections are served by their own threads, but every call is executed on
//! the thread running [`RpcServer::serve`], one at a time. Handlers therefore
//! never run concurrently with each other.
//!
//! The [`Interrupter`] listens on a separate socket so an `interrupt` message
//! can arrive while a call is executing. It only has an effect while a call is
//! in progress: the interrupt flag is cleared when a call starts and when it
//! ends. Handlers observe the flag through
//! [`CallContext::check_interrupted`](crate::rpc::CallContext::check_interrupted).

use crate::error::{AppResult, ScopeError};
use crate::messaging::InterruptFlag;
use crate::net::{write_frame, FrameEvent, FrameReader};
use crate::rpc::namespace::{CallContext, CommandTree};
use crate::rpc::{RpcReply, RpcRequest, DESCRIBE, INTERRUPT_MESSAGE};
use bytes::Bytes;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct InterruptState {
    armed: AtomicBool,
    flag: InterruptFlag,
}

impl InterruptState {
    fn handle_message(&self, message: &[u8]) -> bool {
        if message != INTERRUPT_MESSAGE {
            debug!(
                "ignoring message on interrupt socket: {:?}",
                String::from_utf8_lossy(message)
            );
            return false;
        }
        if !self.armed.load(Ordering::SeqCst) {
            debug!("interrupt received with no call in progress");
            return false;
        }
        info!("interrupting the running call");
        self.flag.set();
        true
    }
}

/// Raises the interrupt flag for the call in progress.
pub struct Interrupter {
    state: Arc<InterruptState>,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
}

/// Keeps the interrupter armed for the duration of one call.
struct ArmGuard<'a> {
    state: &'a InterruptState,
}

impl Drop for ArmGuard<'_> {
    fn drop(&mut self) {
        self.state.armed.store(false, Ordering::SeqCst);
        self.state.flag.clear();
    }
}

impl Interrupter {
    /// An interrupter with no socket; [`handle_message`](Self::handle_message)
    /// is the only way to trigger it.
    pub fn detached() -> Self {
        Self {
            state: Arc::new(InterruptState::default()),
            running: Arc::new(AtomicBool::new(true)),
            local_addr: None,
        }
    }

    /// Listen for interrupt messages on `addr`.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> AppResult<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let interrupter = Self {
            state: Arc::new(InterruptState::default()),
            running: Arc::new(AtomicBool::new(true)),
            local_addr: Some(local_addr),
        };
        let state = Arc::clone(&interrupter.state);
        let running = Arc::clone(&interrupter.running);
        thread::Builder::new()
            .name("rpc-interrupt".to_string())
            .spawn(move || {
                accept_loop(&listener, &running, |stream| {
                    let state = Arc::clone(&state);
                    let running = Arc::clone(&running);
                    thread::spawn(move || read_interrupts(stream, &state, &running));
                });
            })?;
        info!("interrupt listener on {}", local_addr);
        Ok(interrupter)
    }

    /// Feed one message as if received on the socket. Returns whether it
    /// raised the flag.
    pub fn handle_message(&self, message: &[u8]) -> bool {
        self.state.handle_message(message)
    }

    /// Flag raised when an interrupt arrives for the running call.
    pub fn flag(&self) -> InterruptFlag {
        self.state.flag.clone()
    }

    /// Whether a call is currently running.
    pub fn is_armed(&self) -> bool {
        self.state.armed.load(Ordering::SeqCst)
    }

    /// Bound address, or `None` for an unbound interrupter.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn arm(&self) -> ArmGuard<'_> {
        self.state.flag.clear();
        self.state.armed.store(true, Ordering::SeqCst);
        ArmGuard { state: &self.state }
    }
}

impl Drop for Interrupter {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn read_interrupts(stream: TcpStream, state: &InterruptState, running: &AtomicBool) {
    let mut reader = FrameReader::new(stream);
    while running.load(Ordering::SeqCst) {
        match reader.next_frame() {
            Ok(FrameEvent::Frame(message)) => {
                state.handle_message(&message);
            }
            Ok(FrameEvent::Idle) => {}
            Ok(FrameEvent::Closed) => break,
            Err(e) => {
                debug!("interrupt connection dropped: {}", e);
                break;
            }
        }
    }
}

/// Poll a non-blocking listener until `running` clears.
fn accept_loop<F>(listener: &TcpListener, running: &AtomicBool, mut on_accept: F)
where
    F: FnMut(TcpStream),
{
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("accepted connection from {}", peer);
                let configured = stream
                    .set_nonblocking(false)
                    .and_then(|()| stream.set_read_timeout(Some(POLL_INTERVAL)));
                match configured {
                    Ok(()) => on_accept(stream),
                    Err(e) => warn!("could not configure connection from {}: {}", peer, e),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                warn!("accept failed: {}", e);
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

/// Stops a running [`RpcServer::serve`] loop from another thread.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    running: Arc<AtomicBool>,
}

impl ServerHandle {
    /// Asks the serve loop to return.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the serve loop is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

struct Job {
    request: Bytes,
    reply: mpsc::Sender<Vec<u8>>,
}

/// Serves a [`CommandTree`] over length-prefixed JSON frames.
pub struct RpcServer {
    tree: CommandTree,
    interrupter: Interrupter,
    running: Arc<AtomicBool>,
}

impl RpcServer {
    /// Builds a request.
    pub fn new(tree: CommandTree, interrupter: Interrupter) -> Self {
        Self {
            tree,
            interrupter,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Handle for stopping the server from another thread.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Commands served.
    pub fn tree(&self) -> &CommandTree {
        &self.tree
    }

    /// Interrupt listener shared with handlers.
    pub fn interrupter(&self) -> &Interrupter {
        &self.interrupter
    }

    /// Execute one request. Never fails; every problem becomes an error reply.
    pub fn process(&self, request: RpcRequest) -> RpcReply {
        let RpcRequest {
            command: name,
            args,
            kwargs,
        } = request;

        if name == DESCRIBE {
            return match serde_json::to_value(self.tree.descriptors()) {
                Ok(listing) => RpcReply::success(listing),
                Err(e) => RpcReply::failure(format!("Could not describe commands: {e}")),
            };
        }

        let Some(command) = self.tree.lookup(&name) else {
            warn!("rejected unknown command '{}'", name);
            return RpcReply::failure(ScopeError::NoSuchCommand(name).to_string());
        };

        let bound = match command.params().bind(args, kwargs) {
            Ok(bound) => bound,
            Err(e) => {
                return RpcReply::failure(format!(
                    "{}{}: {}",
                    name,
                    command.params().signature(),
                    e
                ))
            }
        };

        debug!("calling '{}'", name);
        let _armed = self.interrupter.arm();
        let context = CallContext::new(bound, self.interrupter.flag());
        match catch_unwind(AssertUnwindSafe(|| command.call(&context))) {
            Ok(Ok(retval)) => RpcReply::success(retval),
            Ok(Err(e)) => {
                warn!("command '{}' failed: {:#}", name, e);
                RpcReply::failure(error_text(&e))
            }
            Err(payload) => {
                let detail = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("command '{}' panicked: {}", name, detail);
                RpcReply::failure(format!("command '{name}' panicked: {detail}"))
            }
        }
    }

    /// Decode, execute and encode one wire frame.
    pub fn process_frame(&self, frame: &[u8]) -> Vec<u8> {
        let reply = match serde_json::from_slice::<RpcRequest>(frame) {
            Ok(request) => self.process(request),
            Err(e) => RpcReply::failure(format!(
                "Could not unpack command, arguments, and keyword arguments from JSON message: {e}"
            )),
        };
        serde_json::to_vec(&reply).unwrap_or_else(|e| {
            error!("could not encode reply: {}", e);
            serde_json::to_vec(&RpcReply::failure("Could not JSON-serialize return value."))
                .unwrap_or_default()
        })
    }

    /// Accept clients on `listener` and execute their calls until stopped.
    pub fn serve(&self, listener: TcpListener) -> AppResult<()> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>();

        let running = Arc::clone(&self.running);
        let acceptor = thread::Builder::new()
            .name("rpc-accept".to_string())
            .spawn(move || {
                accept_loop(&listener, &running, |stream| {
                    let jobs = jobs_tx.clone();
                    let running = Arc::clone(&running);
                    let spawned = thread::Builder::new()
                        .name("rpc-connection".to_string())
                        .spawn(move || serve_connection(stream, &jobs, &running));
                    if let Err(e) = spawned {
                        error!("could not spawn connection thread: {}", e);
                    }
                });
            })?;

        info!("RPC server listening on {}", local_addr);
        while self.running.load(Ordering::SeqCst) {
            match jobs_rx.recv_timeout(POLL_INTERVAL) {
                Ok(job) => {
                    let reply = self.process_frame(&job.request);
                    let _ = job.reply.send(reply);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        if acceptor.join().is_err() {
            error!("RPC acceptor thread panicked");
        }
        info!("RPC server on {} stopped", local_addr);
        Ok(())
    }
}

fn error_text(error: &anyhow::Error) -> String {
    match error.downcast_ref::<ScopeError>() {
        Some(ScopeError::Serialization(e)) => {
            format!("Could not JSON-serialize return value: {e}")
        }
        _ => format!("{error:#}"),
    }
}

fn serve_connection(stream: TcpStream, jobs: &mpsc::Sender<Job>, running: &AtomicBool) {
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(e) => {
            warn!("could not clone RPC connection: {}", e);
            return;
        }
    };
    let mut reader = FrameReader::new(stream);
    while running.load(Ordering::SeqCst) {
        let request = match reader.next_frame() {
            Ok(FrameEvent::Frame(request)) => request,
            Ok(FrameEvent::Idle) => continue,
            Ok(FrameEvent::Closed) => break,
            Err(e) => {
                warn!("RPC connection dropped: {}", e);
                break;
            }
        };
        let (reply_tx, reply_rx) = mpsc::channel();
        if jobs
            .send(Job {
                request,
                reply: reply_tx,
            })
            .is_err()
        {
            break;
        }
        let Ok(reply) = reply_rx.recv() else {
            break;
        };
        if let Err(e) = write_frame(&mut writer, &reply) {
            warn!("could not send RPC reply: {}", e);
            break;
        }
    }
    debug!("RPC connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::describe::{CommandDescriptor, ParamSpec};
    use serde_json::{json, Map, Value};
    use std::collections::HashMap;

    fn server() -> RpcServer {
        let tree = CommandTree::builder()
            .command(
                "add",
                "Add two numbers.",
                ParamSpec::new().arg("a").arg_default("b", json!(1)),
                |ctx| Ok(json!(ctx.get::<i64>("a")? + ctx.get::<i64>("b")?)),
            )
            .command("fail", "", ParamSpec::new(), |_| {
                Err(anyhow::anyhow!("stage is not homed"))
            })
            .command("explode", "", ParamSpec::new(), |_| {
                let v: Vec<i32> = Vec::new();
                Ok(json!(v[3]))
            })
            .typed_command("weird", "", ParamSpec::new(), |_| {
                let mut map = HashMap::new();
                map.insert((1, 2), "tuple keys are not JSON");
                Ok(map)
            })
            .command("interruptible", "", ParamSpec::new(), |ctx| {
                ctx.check_interrupted()?;
                Ok(json!("finished"))
            })
            .build()
            .unwrap();
        RpcServer::new(tree, Interrupter::detached())
    }

    fn call(server: &RpcServer, command: &str, args: Vec<Value>) -> RpcReply {
        server.process(RpcRequest::new(command, args, Map::new()))
    }

    #[test]
    fn test_dispatch_binds_arguments() {
        let server = server();
        assert_eq!(call(&server, "add", vec![json!(2)]).retval, json!(3));
        assert_eq!(call(&server, "add", vec![json!(2), json!(5)]).retval, json!(7));
    }

    #[test]
    fn test_unknown_command() {
        let reply = call(&server(), "nope", vec![]);
        assert_eq!(reply.error.as_deref(), Some("No such command: nope"));
    }

    #[test]
    fn test_handler_error_becomes_reply_and_server_survives() {
        let server = server();
        let reply = call(&server, "fail", vec![]);
        assert!(reply.error.unwrap().contains("stage is not homed"));
        let reply = call(&server, "explode", vec![]);
        assert!(reply.error.unwrap().contains("panicked"));
        assert_eq!(call(&server, "add", vec![json!(1)]).retval, json!(2));
    }

    #[test]
    fn test_argument_errors_name_the_signature() {
        let reply = call(&server(), "add", vec![]);
        let error = reply.error.unwrap();
        assert!(error.starts_with("add(a, b=1):"), "{error}");
    }

    #[test]
    fn test_unserializable_return_value() {
        let reply = call(&server(), "weird", vec![]);
        assert!(reply
            .error
            .unwrap()
            .starts_with("Could not JSON-serialize return value"));
    }

    #[test]
    fn test_describe_lists_commands() {
        let reply = call(&server(), DESCRIBE, vec![]);
        let listing: Vec<CommandDescriptor> = serde_json::from_value(reply.retval).unwrap();
        let add = listing.iter().find(|d| d.name == "add").unwrap();
        assert_eq!(add.doc, "Add two numbers.");
        assert_eq!(add.params.args, vec!["a", "b"]);
        assert_eq!(listing.len(), 5);
    }

    #[test]
    fn test_malformed_frame() {
        let reply: RpcReply = serde_json::from_slice(&server().process_frame(b"{not json")).unwrap();
        assert!(reply.error.unwrap().starts_with("Could not unpack"));
    }

    #[test]
    fn test_interrupter_only_acts_while_armed() {
        let interrupter = Interrupter::detached();
        assert!(!interrupter.handle_message(INTERRUPT_MESSAGE));
        {
            let _armed = interrupter.arm();
            assert!(!interrupter.handle_message(b"something else"));
            assert!(interrupter.handle_message(INTERRUPT_MESSAGE));
            assert!(interrupter.flag().is_set());
        }
        assert!(!interrupter.is_armed());
        assert!(!interrupter.flag().is_set());
    }

    #[test]
    fn test_interrupt_visible_to_handler() {
        let server = server();
        // Not armed before the call starts, so a stale interrupt is ignored.
        server.interrupter().handle_message(INTERRUPT_MESSAGE);
        assert_eq!(
            call(&server, "interruptible", vec![]).retval,
            json!("finished")
        );
    }
}
