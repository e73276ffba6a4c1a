//! Transport adapters.
//!
//! A [`Port`] is one bidirectional connection between two execution
//! contexts. It is split in two halves:
//!
//! * [`PortHandle`] posts messages and disconnects; it is cheap to clone and
//!   can be shared by every coroutine that needs to answer on the port
//! * [`PortSource`] yields the incoming messages; it is owned by exactly one
//!   listener coroutine, and `Ok(None)` is the disconnect event
//!
//! Adapters produce ports either by connecting ([`Transport`]) or by
//! accepting incoming connections ([`Acceptor`]). Two adapter flavors are
//! provided: the in-process [`MemoryHost`] and the framed byte
//! [`stream`](self::stream) adapter for TCP and unix sockets.
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

pub use self::errors::Error;
pub use self::memory::{MemoryHost, MemoryListener};
pub use self::stream::{stream_port, TcpAcceptor, TcpTransport};
#[cfg(unix)]
pub use self::stream::{UnixAcceptor, UnixTransport};
pub use self::stream_ext::StreamExt;

/// Result of a port operation.
pub type Result<T> = std::result::Result<T, Error>;

/// Sending half of a port.
pub trait PortSink: Send + Sync {
    /// post one message to the peer
    fn post_message(&self, msg: Value) -> Result<()>;
    /// close the port, both sources observe the disconnect
    fn disconnect(&self);
    /// false once either side disconnected
    fn is_connected(&self) -> bool;
}

/// Receiving half of a port.
pub trait PortSource: Send {
    /// Block the calling coroutine until the next message.
    ///
    /// Returns `Ok(None)` once the port is disconnected.
    fn recv(&mut self) -> Result<Option<Value>>;
}

/// Shared sending half of a port.
#[derive(Clone)]
pub struct PortHandle {
    name: Arc<str>,
    sink: Arc<dyn PortSink>,
}

impl fmt::Debug for PortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortHandle")
            .field("name", &self.name)
            .field("connected", &self.sink.is_connected())
            .finish()
    }
}

impl PortHandle {
    /// name given when the port was opened
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn post_message(&self, msg: Value) -> Result<()> {
        self.sink.post_message(msg)
    }

    pub fn disconnect(&self) {
        self.sink.disconnect()
    }

    pub fn is_connected(&self) -> bool {
        self.sink.is_connected()
    }
}

/// One bidirectional connection.
pub struct Port {
    handle: PortHandle,
    source: Box<dyn PortSource>,
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port").field("handle", &self.handle).finish()
    }
}

impl Port {
    /// assemble a port from its halves
    pub fn new(
        name: impl Into<String>,
        sink: impl PortSink + 'static,
        source: impl PortSource + 'static,
    ) -> Self {
        let name: String = name.into();
        Port {
            handle: PortHandle {
                name: name.into(),
                sink: Arc::new(sink),
            },
            source: Box::new(source),
        }
    }

    pub fn handle(&self) -> &PortHandle {
        &self.handle
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn post_message(&self, msg: Value) -> Result<()> {
        self.handle.post_message(msg)
    }

    pub fn recv(&mut self) -> Result<Option<Value>> {
        self.source.recv()
    }

    pub fn disconnect(&self) {
        self.handle.disconnect()
    }

    /// separate the sending and the receiving half
    pub fn split(self) -> (PortHandle, Box<dyn PortSource>) {
        (self.handle, self.source)
    }
}

/// Options for opening a port.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// name of the port, visible to the accepting side
    pub name: Option<String>,
}

impl ConnectOptions {
    pub fn named(name: impl Into<String>) -> Self {
        ConnectOptions {
            name: Some(name.into()),
        }
    }
}

/// Client side of an adapter: opens new ports.
pub trait Transport: Send + Sync {
    /// Open a new port.
    ///
    /// Fails with [`Error::Unavailable`] when the host capability is missing.
    fn connect(&self, options: &ConnectOptions) -> Result<Port>;
}

/// Stops an [`Acceptor`] from another coroutine, calling it again is a no-op.
pub type Closer = Box<dyn Fn() + Send + Sync>;

/// Server side of an adapter: yields incoming ports.
pub trait Acceptor: Send + 'static {
    /// Block until the next incoming port, `Ok(None)` once shut down.
    fn accept(&self) -> Result<Option<Port>>;

    /// Handle that stops accepting.
    ///
    /// It wakes up a blocked `accept`, which then returns `Ok(None)` like
    /// every later call.
    fn closer(&self) -> Closer;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn connect(&self, options: &ConnectOptions) -> Result<Port> {
        (**self).connect(options)
    }
}

/// Provides a few different error types
mod errors;
/// length prefixed frames for byte streams
mod frame;
pub mod memory;
mod queued_writer;
pub mod stream;
mod stream_ext;
