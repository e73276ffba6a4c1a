//! Byte stream adapter.
//!
//! Runs a port over a TCP or unix domain socket. Each wrapped envelope is
//! sent as one length prefixed json frame.
use std::io::{self, BufReader};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use may::net::{TcpListener, TcpStream};
#[cfg(unix)]
use may::os::unix::net::{UnixListener, UnixStream};
use may::sync::Mutex;
use serde_json::Value;

use super::frame::Frame;
use super::queued_writer::QueuedWriter;
use super::stream_ext::StreamExt;
use super::{
    Acceptor, Closer, ConnectOptions, Error, Port, PortSink, PortSource, Result, Transport,
};

struct StreamSink<S: StreamExt> {
    writer: QueuedWriter<S>,
    // kept apart from the writer so a disconnect never waits for a flush
    control: Mutex<S>,
    connected: Arc<AtomicBool>,
}

impl<S: StreamExt> PortSink for StreamSink<S> {
    fn post_message(&self, msg: Value) -> Result<()> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let frame = Frame::encode(&msg)?;
        self.writer.write(frame).map_err(|e| {
            self.connected.store(false, Ordering::Release);
            Error::Io(e)
        })
    }

    fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Ok(s) = self.control.lock() {
            if let Err(e) = s.shutdown() {
                info!("stream port shutdown: err = {:?}", e);
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl<S: StreamExt> Drop for StreamSink<S> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct StreamSource<S: StreamExt> {
    reader: BufReader<S>,
    buf: BytesMut,
    connected: Arc<AtomicBool>,
}

impl<S: StreamExt> PortSource for StreamSource<S> {
    fn recv(&mut self) -> Result<Option<Value>> {
        loop {
            let frame = match Frame::decode_from(&mut self.reader, &mut self.buf) {
                Ok(frame) => frame,
                Err(e) => {
                    let was_open = self.connected.swap(false, Ordering::AcqRel);
                    return match e.kind() {
                        io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::NotConnected => {
                            info!("stream port decode: connection closed");
                            Ok(None)
                        }
                        // shut down locally, whatever the socket reports
                        _ if !was_open => Ok(None),
                        _ => {
                            error!("stream port decode: err = {:?}", e);
                            Err(Error::Io(e))
                        }
                    };
                }
            };

            // a broken payload only costs that one message
            match frame.decode_value() {
                Ok(value) => return Ok(Some(value)),
                Err(e) => error!("stream port payload: err = {}", e),
            }
        }
    }
}

/// Wrap a connected byte stream into a port.
pub fn stream_port<S: StreamExt>(stream: S, name: impl Into<String>) -> io::Result<Port> {
    // the read half of the stream
    let reader = BufReader::new(stream.try_clone()?);
    // the half used to shut the stream down
    let control = stream.try_clone()?;
    let connected = Arc::new(AtomicBool::new(true));

    Ok(Port::new(
        name,
        StreamSink {
            writer: QueuedWriter::new(stream),
            control: Mutex::new(control),
            connected: connected.clone(),
        },
        StreamSource {
            reader,
            buf: BytesMut::with_capacity(1024 * 32),
            connected,
        },
    ))
}

/// Connects ports over TCP.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    addr: SocketAddr,
}

impl TcpTransport {
    pub fn new<L: ToSocketAddrs>(addr: L) -> io::Result<Self> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no socket address"))?;
        Ok(TcpTransport { addr })
    }
}

impl Transport for TcpTransport {
    fn connect(&self, options: &ConnectOptions) -> Result<Port> {
        let stream = TcpStream::connect(self.addr)?;
        stream.set_nodelay(true)?;
        let name = match options.name {
            Some(ref name) => name.clone(),
            None => stream.peer_name(),
        };
        info!("tcp port connected: {name}");
        Ok(stream_port(stream, name)?)
    }
}

/// Accepts ports over TCP.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    closed: Arc<AtomicBool>,
}

impl TcpAcceptor {
    pub fn bind<L: ToSocketAddrs>(addr: L) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(TcpAcceptor {
            listener,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Acceptor for TcpAcceptor {
    fn accept(&self) -> Result<Option<Port>> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let (stream, peer) = self.listener.accept()?;
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        stream.set_nodelay(true)?;
        info!("tcp port accepted: {peer}");
        Ok(Some(stream_port(stream, peer.to_string())?))
    }

    fn closer(&self) -> Closer {
        let closed = self.closed.clone();
        let addr = self.listener.local_addr().map(|mut addr| {
            if addr.ip().is_unspecified() {
                match addr {
                    SocketAddr::V4(_) => addr.set_ip(Ipv4Addr::LOCALHOST.into()),
                    SocketAddr::V6(_) => addr.set_ip(Ipv6Addr::LOCALHOST.into()),
                }
            }
            addr
        });
        Box::new(move || {
            if closed.swap(true, Ordering::AcqRel) {
                return;
            }
            // a throwaway connection wakes up the blocked accept
            let woken = match &addr {
                Ok(addr) => TcpStream::connect(*addr).map(drop),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            if let Err(e) = woken {
                warn!("tcp acceptor close: err = {e}");
            }
        })
    }
}

/// Connects ports over a unix domain socket.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct UnixTransport {
    path: PathBuf,
}

#[cfg(unix)]
impl UnixTransport {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        UnixTransport {
            path: path.as_ref().to_owned(),
        }
    }
}

#[cfg(unix)]
impl Transport for UnixTransport {
    fn connect(&self, options: &ConnectOptions) -> Result<Port> {
        let stream = UnixStream::connect(&self.path)?;
        let name = match options.name {
            Some(ref name) => name.clone(),
            None => self.path.display().to_string(),
        };
        Ok(stream_port(stream, name)?)
    }
}

/// Accepts ports over a unix domain socket, the socket file is removed on drop.
#[cfg(unix)]
#[derive(Debug)]
pub struct UnixAcceptor {
    listener: UnixListener,
    path: PathBuf,
    closed: Arc<AtomicBool>,
}

#[cfg(unix)]
impl UnixAcceptor {
    pub fn bind<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        std::fs::remove_file(&path).ok();
        let listener = UnixListener::bind(&path)?;
        Ok(UnixAcceptor {
            listener,
            path: path.as_ref().to_owned(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[cfg(unix)]
impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        std::fs::remove_file(&self.path).ok();
    }
}

#[cfg(unix)]
impl Acceptor for UnixAcceptor {
    fn accept(&self) -> Result<Option<Port>> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let (stream, _) = self.listener.accept()?;
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        Ok(Some(stream_port(stream, self.path.display().to_string())?))
    }

    fn closer(&self) -> Closer {
        let closed = self.closed.clone();
        let path = self.path.clone();
        Box::new(move || {
            if closed.swap(true, Ordering::AcqRel) {
                return;
            }
            if let Err(e) = UnixStream::connect(&path) {
                warn!("unix acceptor close: err = {e}");
            }
        })
    }
}
