use std::io::{self, Read, Write};
use std::net::Shutdown;

/// Byte stream a port can run on.
pub trait StreamExt: Sized + Read + Write + Send + 'static {
    /// try clone the stream
    fn try_clone(&self) -> io::Result<Self>;
    /// shut down both directions, wakes up a blocked reader
    fn shutdown(&self) -> io::Result<()>;
    /// printable peer name
    fn peer_name(&self) -> String;
}

macro_rules! impl_stream_ext {
    ($name: ty) => {
        impl StreamExt for $name {
            fn try_clone(&self) -> io::Result<Self> {
                (*self).try_clone()
            }
            fn shutdown(&self) -> io::Result<()> {
                (*self).shutdown(Shutdown::Both)
            }
            fn peer_name(&self) -> String {
                match (*self).peer_addr() {
                    Ok(addr) => format!("{addr:?}"),
                    Err(_) => String::from("unknown"),
                }
            }
        }
    };
}

impl_stream_ext!(may::net::TcpStream);
#[cfg(unix)]
impl_stream_ext!(may::os::unix::net::UnixStream);
