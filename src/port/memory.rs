//! In-process adapter.
//!
//! `MemoryHost` plays the part of the extension runtime: one context
//! registers a listener, any other context may connect to it. Messages are
//! handed over as structured values without encoding.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use may::sync::mpsc::{self, Receiver, Sender};
use may::sync::Mutex;
use serde_json::Value;

use super::{
    Acceptor, Closer, ConnectOptions, Error, Port, PortSink, PortSource, Result, Transport,
};

enum Signal {
    Message(Value),
    Disconnect,
}

struct MemorySink {
    peer: Mutex<Sender<Signal>>,
    own: Mutex<Sender<Signal>>,
    connected: Arc<AtomicBool>,
}

impl PortSink for MemorySink {
    fn post_message(&self, msg: Value) -> Result<()> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let peer = self.peer.lock().map_err(|_| Error::Closed)?;
        peer.send(Signal::Message(msg)).map_err(|_| Error::Closed)
    }

    fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        // both listeners have to wake up, the peer's and our own
        for tx in [&self.peer, &self.own] {
            if let Ok(tx) = tx.lock() {
                tx.send(Signal::Disconnect).ok();
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct MemorySource {
    rx: Receiver<Signal>,
    connected: Arc<AtomicBool>,
    done: bool,
}

impl PortSource for MemorySource {
    fn recv(&mut self) -> Result<Option<Value>> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv() {
            Ok(Signal::Message(msg)) => Ok(Some(msg)),
            Ok(Signal::Disconnect) | Err(_) => {
                self.done = true;
                self.connected.store(false, Ordering::Release);
                Ok(None)
            }
        }
    }
}

/// Create two connected in-process ports.
///
/// This is also the test double for any adapter: whatever one side posts
/// the other side receives.
pub fn pair(name: &str) -> (Port, Port) {
    let (a_tx, a_rx) = mpsc::channel();
    let (b_tx, b_rx) = mpsc::channel();
    let connected = Arc::new(AtomicBool::new(true));

    let a = Port::new(
        name,
        MemorySink {
            peer: Mutex::new(b_tx.clone()),
            own: Mutex::new(a_tx.clone()),
            connected: connected.clone(),
        },
        MemorySource {
            rx: a_rx,
            connected: connected.clone(),
            done: false,
        },
    );
    let b = Port::new(
        name,
        MemorySink {
            peer: Mutex::new(a_tx),
            own: Mutex::new(b_tx),
            connected: connected.clone(),
        },
        MemorySource {
            rx: b_rx,
            connected,
            done: false,
        },
    );
    (a, b)
}

/// In-process connection host.
#[derive(Default)]
pub struct MemoryHost {
    // `None` wakes the listener up and closes it
    listener: Mutex<Option<Sender<Option<Port>>>>,
    seq: AtomicUsize,
}

impl std::fmt::Debug for MemoryHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHost")
            .field("listening", &self.is_listening())
            .finish()
    }
}

impl MemoryHost {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryHost::default())
    }

    /// Register the listener for incoming connections.
    ///
    /// A host has at most one listener at a time.
    pub fn listen(&self) -> Result<MemoryListener> {
        let mut listener = self
            .listener
            .lock()
            .map_err(|_| Error::Unavailable("memory host poisoned".into()))?;
        if listener.is_some() {
            return Err(Error::Unavailable("memory host already has a listener".into()));
        }
        let (tx, rx) = mpsc::channel();
        *listener = Some(tx.clone());
        Ok(MemoryListener {
            rx,
            wake: Arc::new(Mutex::new(tx)),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Drop the listener, its acceptor returns `None` afterwards.
    pub fn close(&self) {
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(tx) = listener.take() {
                tx.send(None).ok();
            }
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listener.lock().map(|l| l.is_some()).unwrap_or(false)
    }
}

impl Transport for MemoryHost {
    fn connect(&self, options: &ConnectOptions) -> Result<Port> {
        let listener = self
            .listener
            .lock()
            .map_err(|_| Error::Unavailable("memory host poisoned".into()))?;
        let Some(tx) = listener.as_ref() else {
            return Err(Error::Unavailable("no listener registered on memory host".into()));
        };

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = match options.name {
            Some(ref name) => name.clone(),
            None => format!("memory-{seq}"),
        };
        let (client, server) = pair(&name);
        tx.send(Some(server))
            .map_err(|_| Error::Unavailable("memory host listener is gone".into()))?;
        info!("memory port connected: {name}");
        Ok(client)
    }
}

/// Acceptor half of a [`MemoryHost`].
pub struct MemoryListener {
    rx: Receiver<Option<Port>>,
    wake: Arc<Mutex<Sender<Option<Port>>>>,
    closed: Arc<AtomicBool>,
}

impl Acceptor for MemoryListener {
    fn accept(&self) -> Result<Option<Port>> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        match self.rx.recv() {
            Ok(Some(port)) if !self.closed.load(Ordering::Acquire) => Ok(Some(port)),
            Ok(Some(port)) => {
                port.disconnect();
                Ok(None)
            }
            Ok(None) | Err(_) => {
                self.closed.store(true, Ordering::Release);
                Ok(None)
            }
        }
    }

    fn closer(&self) -> Closer {
        let wake = self.wake.clone();
        let closed = self.closed.clone();
        Box::new(move || {
            if closed.swap(true, Ordering::AcqRel) {
                return;
            }
            if let Ok(wake) = wake.lock() {
                wake.send(None).ok();
            }
        })
    }
}
