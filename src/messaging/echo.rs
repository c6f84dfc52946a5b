//! Simulated device that echoes every message back after a random delay.
//!
//! Replies to concurrent requests come back out of order, which makes this a
//! convenient stand-in for real hardware when exercising the manager.
//!
//! Each connection has a reader thread and a replier thread. The replier keeps
//! pending echoes in a queue ordered by due time.

use crate::error::AppResult;
use crate::messaging::transport::{DelimitedReader, MessageSource};
use rand::Rng;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Configuration of a simulated device; [`listen`](Self::listen) starts it.
#[derive(Debug, Clone)]
pub struct EchoDevice {
    terminator: Vec<u8>,
    max_delay: Duration,
}

impl EchoDevice {
    /// Echo messages split on `terminator`, delayed by up to 100 ms.
    pub fn new(terminator: &[u8]) -> Self {
        Self {
            terminator: terminator.to_vec(),
            max_delay: Duration::from_millis(100),
        }
    }

    /// Upper bound of the random reply delay. Zero answers immediately.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Accept connections on `addr` until the returned handle is stopped.
    pub fn listen<A: ToSocketAddrs>(self, addr: A) -> AppResult<EchoServer> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("echo-device".to_string())
            .spawn(move || {
                while flag.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            debug!("echo device accepted {}", peer);
                            if let Err(e) = self.clone().serve(stream, Arc::clone(&flag)) {
                                warn!("echo device could not serve {}: {}", peer, e);
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(POLL_INTERVAL);
                        }
                        Err(e) => {
                            warn!("echo device accept failed: {}", e);
                            thread::sleep(POLL_INTERVAL);
                        }
                    }
                }
            })?;
        info!("echo device listening on {}", local_addr);
        Ok(EchoServer {
            local_addr,
            running,
            thread: Some(thread),
        })
    }

    /// Echo everything received on `stream` until it closes.
    pub fn serve(self, stream: TcpStream, running: Arc<AtomicBool>) -> AppResult<JoinHandle<()>> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        let mut reader = DelimitedReader::new(stream.try_clone()?, &self.terminator);
        let (queue, pending) = mpsc::channel::<(Instant, Vec<u8>)>();
        let terminator = self.terminator.clone();
        let replier_running = Arc::clone(&running);
        let replier = thread::Builder::new()
            .name("echo-replier".to_string())
            .spawn(move || reply_loop(stream, &terminator, &pending, &replier_running))?;
        let handle = thread::Builder::new()
            .name("echo-connection".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    match reader.receive() {
                        Ok(Some(message)) => {
                            let due = Instant::now() + self.random_delay();
                            if queue.send((due, message.to_vec())).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            debug!("echo connection ended: {}", e);
                            break;
                        }
                    }
                }
                drop(queue);
                let _ = replier.join();
            })?;
        Ok(handle)
    }

    fn random_delay(&self) -> Duration {
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// Write queued echoes once they fall due, earliest first.
///
/// Drains what is already queued after the reader hangs up.
fn reply_loop(
    mut stream: TcpStream,
    terminator: &[u8],
    pending: &mpsc::Receiver<(Instant, Vec<u8>)>,
    running: &AtomicBool,
) {
    let mut due: BinaryHeap<Reverse<(Instant, u64, Vec<u8>)>> = BinaryHeap::new();
    let mut sequence = 0u64;
    let mut open = true;
    while running.load(Ordering::SeqCst) && (open || !due.is_empty()) {
        let now = Instant::now();
        while due.peek().is_some_and(|Reverse((at, _, _))| *at <= now) {
            let Some(Reverse((_, _, mut frame))) = due.pop() else {
                break;
            };
            frame.extend_from_slice(terminator);
            if let Err(e) = stream.write_all(&frame) {
                debug!("echo reply dropped: {}", e);
                return;
            }
        }
        let wait = due
            .peek()
            .map_or(POLL_INTERVAL, |Reverse((at, _, _))| at.saturating_duration_since(now))
            .min(POLL_INTERVAL);
        if !open {
            thread::sleep(wait);
            continue;
        }
        match pending.recv_timeout(wait) {
            Ok((at, message)) => {
                due.push(Reverse((at, sequence, message)));
                sequence += 1;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => open = false,
        }
    }
}

/// Running echo listener.
pub struct EchoServer {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EchoServer {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close existing connections within one poll interval.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Block until the listener is stopped from elsewhere.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Clearing this flag stops the listener, like [`stop`](Self::stop).
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::correlator::EchoCorrelator;
    use crate::messaging::device::AsyncDevice;
    use crate::messaging::manager::MessageManager;
    use crate::messaging::transport::Transport;

    #[test]
    fn test_echo_device_round_trip() {
        let server = EchoDevice::new(b"\r")
            .with_max_delay(Duration::from_millis(20))
            .listen("127.0.0.1:0")
            .unwrap();
        let transport =
            Transport::tcp(server.local_addr(), b"\r", Duration::from_millis(20)).unwrap();
        let manager = MessageManager::spawn("echo", transport, Arc::new(EchoCorrelator)).unwrap();
        let device = AsyncDevice::new("echo", manager);
        let reply = device.send_message("hello", None).unwrap();
        assert_eq!(reply.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn test_replier_orders_by_due_time() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        let (queue, pending) = mpsc::channel();
        let now = Instant::now();
        queue.send((now + Duration::from_millis(80), b"late".to_vec())).unwrap();
        queue.send((now + Duration::from_millis(10), b"early".to_vec())).unwrap();
        drop(queue);
        let running = AtomicBool::new(true);
        reply_loop(server_side, b"\r", &pending, &running);

        let mut reader = DelimitedReader::new(client, b"\r");
        assert_eq!(&reader.receive().unwrap().unwrap()[..], b"early");
        assert_eq!(&reader.receive().unwrap().unwrap()[..], b"late");
    }
}
