//! Message routing between logical devices and shared transports.
//!
//! Several logical devices may share one serial or network transport. Each
//! transport is owned by a [`MessageManager`], which runs a dedicated receive
//! thread and pairs incoming messages with the requests that caused them using
//! a pluggable [`Correlator`]. Responses may arrive in any order; the response
//! key, not arrival order, decides who gets what.
//!
//! ```text
//! caller ──send_message──▶ AsyncDevice ──key + ResponseFuture──▶ MessageManager ──bytes──▶ Transport
//!                                ▲                                     │
//!                                └──────── resolve(response) ◀──receive loop (own thread)
//! ```
//!
//! Devices can run synchronously (each call blocks on its [`ResponseFuture`]) or
//! asynchronously (calls return immediately and [`AsyncDevice::wait`] joins them).
//! A [`DeviceNamespace`] fans `wait`/`set_async` out over a whole device tree.

pub mod correlator;
pub mod device;
pub mod echo;
pub mod manager;
pub mod response;
pub mod transport;

pub use correlator::{Correlator, EchoCorrelator, FunctionUnitCorrelator, ResponseKey};
pub use device::{AsyncCapable, AsyncDevice, DeviceNamespace, SendOptions};
pub use echo::{EchoDevice, EchoServer};
pub use manager::{CallbackId, ManagerState, MessageManager, Registration, ResponseCallback};
pub use response::{InterruptFlag, ResponseFuture};
pub use transport::{DelimitedReader, DelimitedWriter, MessageSink, MessageSource, Transport};
