//! Liveness beats from a server to its clients.
//!
//! A [`HeartbeatServer`] sends one frame holding the current Unix time, in
//! seconds as decimal text, to every connected client at a fixed interval.
//! A [`HeartbeatClient`] checks once per check interval whether a beat has
//! arrived. After `max_missed` empty intervals in a row it calls its error
//! callback, and keeps calling it every further empty interval. The first beat
//! after that calls the clear callback.
//!
//! The check interval should be longer than the server's beat interval. The
//! client reconnects on its own, so a restarted server is picked up again.

use crate::error::{AppResult, ScopeError};
use crate::net::{encode_frame, FrameEvent, FrameReader};
use parking_lot::Mutex;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

struct Listener {
    stream: TcpStream,
    peer: SocketAddr,
}

/// Publishes beats on its own socket.
pub struct HeartbeatServer {
    running: Arc<AtomicBool>,
    listeners: Arc<Mutex<Vec<Listener>>>,
    local_addr: SocketAddr,
    interval: Duration,
}

impl std::fmt::Debug for HeartbeatServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatServer")
            .field("local_addr", &self.local_addr)
            .field("interval", &self.interval)
            .finish()
    }
}

impl HeartbeatServer {
    /// Listen on `addr` and beat every `interval`.
    pub fn bind<A: ToSocketAddrs>(addr: A, interval: Duration) -> AppResult<Self> {
        if interval.is_zero() {
            return Err(ScopeError::Configuration(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));
        let listeners = Arc::new(Mutex::new(Vec::new()));

        let accepting = Arc::clone(&running);
        let accepted = Arc::clone(&listeners);
        thread::Builder::new()
            .name("heartbeat-accept".to_string())
            .spawn(move || accept_listeners(&listener, &accepting, &accepted))?;

        let beating = Arc::clone(&running);
        let targets = Arc::clone(&listeners);
        thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || {
                let mut next = Instant::now() + interval;
                while beating.load(Ordering::SeqCst) {
                    let now = Instant::now();
                    if now < next {
                        thread::sleep((next - now).min(POLL_INTERVAL));
                        continue;
                    }
                    next += interval;
                    beat(&targets);
                }
            })?;

        info!("heartbeat every {:?} on {}", interval, local_addr);
        Ok(Self {
            running,
            listeners,
            local_addr,
            interval,
        })
    }

    /// Address clients connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Time between beats.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Stop beating and close every client connection.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.listeners.lock().clear();
            info!("heartbeat on {} stopped", self.local_addr);
        }
    }
}

impl Drop for HeartbeatServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_listeners(listener: &TcpListener, running: &AtomicBool, listeners: &Mutex<Vec<Listener>>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let configured = stream
                    .set_nonblocking(false)
                    .and_then(|()| stream.set_write_timeout(Some(WRITE_TIMEOUT)));
                match configured {
                    Ok(()) => {
                        debug!("heartbeat client {} connected", peer);
                        listeners.lock().push(Listener { stream, peer });
                    }
                    Err(e) => warn!("could not configure heartbeat client {}: {}", peer, e),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                warn!("heartbeat accept failed: {}", e);
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn beat(listeners: &Mutex<Vec<Listener>>) {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| since.as_secs());
    let mut frame = Vec::new();
    if let Err(e) = encode_frame(&mut frame, seconds.to_string().as_bytes()) {
        warn!("could not encode heartbeat: {}", e);
        return;
    }
    listeners.lock().retain_mut(|listener| match listener.stream.write_all(&frame) {
        Ok(()) => true,
        Err(e) => {
            debug!("dropping heartbeat client {}: {}", listener.peer, e);
            false
        }
    });
}

type Notify = Box<dyn Fn() + Send>;

/// Settings for a [`HeartbeatClient`].
pub struct HeartbeatMonitor {
    check_interval: Duration,
    max_missed: u32,
    on_error: Notify,
    on_clear: Notify,
}

impl std::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("check_interval", &self.check_interval)
            .field("max_missed", &self.max_missed)
            .finish_non_exhaustive()
    }
}

impl HeartbeatMonitor {
    /// Check every `check_interval`; report after `max_missed` empty checks.
    /// A `max_missed` of zero is treated as one.
    pub fn new(check_interval: Duration, max_missed: u32) -> Self {
        Self {
            check_interval,
            max_missed: max_missed.max(1),
            on_error: Box::new(|| {}),
            on_clear: Box::new(|| {}),
        }
    }

    /// Called on every empty check once `max_missed` is reached.
    pub fn on_error<F: Fn() + Send + 'static>(mut self, callback: F) -> Self {
        self.on_error = Box::new(callback);
        self
    }

    /// Called on the first beat after an error was reported.
    pub fn on_clear<F: Fn() + Send + 'static>(mut self, callback: F) -> Self {
        self.on_clear = Box::new(callback);
        self
    }

    /// Fold one check into the missed count, firing callbacks as needed.
    fn record(&self, missed: &AtomicU32, beat: bool) {
        let previous = missed.load(Ordering::SeqCst);
        let now = if beat {
            if previous >= self.max_missed {
                info!("heartbeat restored");
                (self.on_clear)();
            }
            0
        } else {
            previous.saturating_add(1)
        };
        missed.store(now, Ordering::SeqCst);
        if now >= self.max_missed {
            warn!("missed {} heartbeat(s)", now);
            (self.on_error)();
        }
    }
}

/// Watches a [`HeartbeatServer`] on a background thread.
pub struct HeartbeatClient {
    running: Arc<AtomicBool>,
    missed: Arc<AtomicU32>,
    max_missed: u32,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for HeartbeatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatClient")
            .field("missed", &self.missed())
            .field("max_missed", &self.max_missed)
            .finish()
    }
}

impl HeartbeatClient {
    /// Start watching the server at `addr`. Callbacks run on the watcher thread.
    pub fn start<A: ToSocketAddrs>(addr: A, monitor: HeartbeatMonitor) -> AppResult<Self> {
        let server = addr.to_socket_addrs()?.next().ok_or_else(|| {
            ScopeError::Configuration("heartbeat address resolved to nothing".to_string())
        })?;
        let running = Arc::new(AtomicBool::new(true));
        let missed = Arc::new(AtomicU32::new(0));
        let max_missed = monitor.max_missed;

        let watching = Arc::clone(&running);
        let counter = Arc::clone(&missed);
        let thread = thread::Builder::new()
            .name("heartbeat-client".to_string())
            .spawn(move || {
                let mut connection = None;
                while watching.load(Ordering::SeqCst) {
                    let Some(beat) = receive_beat(
                        server,
                        &mut connection,
                        monitor.check_interval,
                        &watching,
                    ) else {
                        break;
                    };
                    monitor.record(&counter, beat);
                }
            })?;
        Ok(Self {
            running,
            missed,
            max_missed,
            thread: Some(thread),
        })
    }

    /// Consecutive checks without a beat.
    pub fn missed(&self) -> u32 {
        self.missed.load(Ordering::SeqCst)
    }

    /// True while fewer than `max_missed` checks in a row came up empty.
    pub fn is_alive(&self) -> bool {
        self.missed() < self.max_missed
    }

    /// Stop watching and join the thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("heartbeat watcher panicked");
            }
        }
    }
}

impl Drop for HeartbeatClient {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait up to `window` for one beat, reconnecting as needed. Returns `None`
/// once `running` clears.
fn receive_beat(
    server: SocketAddr,
    connection: &mut Option<FrameReader<TcpStream>>,
    window: Duration,
    running: &AtomicBool,
) -> Option<bool> {
    let deadline = Instant::now() + window;
    while running.load(Ordering::SeqCst) {
        if Instant::now() >= deadline {
            return Some(false);
        }
        if connection.is_none() {
            *connection = connect(server);
        }
        let Some(reader) = connection.as_mut() else {
            thread::sleep(POLL_INTERVAL);
            continue;
        };
        match reader.next_frame() {
            Ok(FrameEvent::Frame(_)) => return Some(true),
            Ok(FrameEvent::Idle) => {}
            Ok(FrameEvent::Closed) => {
                debug!("heartbeat server {} closed the connection", server);
                *connection = None;
            }
            Err(e) => {
                debug!("heartbeat connection to {} failed: {}", server, e);
                *connection = None;
            }
        }
    }
    None
}

fn connect(server: SocketAddr) -> Option<FrameReader<TcpStream>> {
    let stream = TcpStream::connect_timeout(&server, POLL_INTERVAL)
        .and_then(|stream| stream.set_read_timeout(Some(POLL_INTERVAL)).map(|()| stream));
    match stream {
        Ok(stream) => Some(FrameReader::new(stream)),
        Err(e) => {
            debug!("heartbeat server {} unreachable: {}", server, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_monitor(max_missed: u32) -> (HeartbeatMonitor, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let errors = Arc::new(AtomicUsize::new(0));
        let clears = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        let c = Arc::clone(&clears);
        let monitor = HeartbeatMonitor::new(Duration::from_millis(10), max_missed)
            .on_error(move || {
                e.fetch_add(1, Ordering::SeqCst);
            })
            .on_clear(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        (monitor, errors, clears)
    }

    #[test]
    fn test_errors_start_at_max_missed_and_repeat() {
        let (monitor, errors, clears) = counting_monitor(3);
        let missed = AtomicU32::new(0);
        for _ in 0..2 {
            monitor.record(&missed, false);
        }
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        monitor.record(&missed, false);
        monitor.record(&missed, false);
        assert_eq!(errors.load(Ordering::SeqCst), 2);
        assert_eq!(missed.load(Ordering::SeqCst), 4);

        monitor.record(&missed, true);
        assert_eq!(clears.load(Ordering::SeqCst), 1);
        assert_eq!(missed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_beat_below_threshold_does_not_clear() {
        let (monitor, errors, clears) = counting_monitor(3);
        let missed = AtomicU32::new(0);
        monitor.record(&missed, false);
        monitor.record(&missed, true);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert_eq!(clears.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(matches!(
            HeartbeatServer::bind("127.0.0.1:0", Duration::ZERO),
            Err(ScopeError::Configuration(_))
        ));
    }
}
