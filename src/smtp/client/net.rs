//! Socket abstraction for the SMTP client

use std::{
    fmt::{self, Debug, Formatter},
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    time::Duration,
};

use crate::smtp::{
    client::mock::MockStream,
    error::{self, Error},
};

/// The concept of opening a byte stream to a delivery server.
///
/// This is the injection point for tests and for exotic network setups; the
/// production implementation is [`TcpConnector`].
pub trait Connector: Send + Sync {
    /// Opens a stream to `host:port`, honoring `timeout` for the
    /// connection attempt
    fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<NetworkStream, Error>;
}

/// Plain TCP connector
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<NetworkStream, Error> {
        let addrs = (host, port).to_socket_addrs().map_err(error::connection)?;

        let mut last_err = None;
        for addr in addrs {
            let attempt = match timeout {
                Some(duration) => TcpStream::connect_timeout(&addr, duration),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => return Ok(NetworkStream::Tcp(stream)),
                Err(err) => last_err = Some(err),
            }
        }

        Err(match last_err {
            Some(err) => error::connection(err),
            None => error::connection(format!("no address found for {host}")),
        })
    }
}

/// The underlying byte stream of an SMTP conversation
pub enum NetworkStream {
    /// Plain TCP stream
    Tcp(TcpStream),
    /// In-memory stream for testing
    Mock(MockStream),
}

impl Debug for NetworkStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NetworkStream::Tcp(_) => f.write_str("NetworkStream::Tcp(..)"),
            NetworkStream::Mock(_) => f.write_str("NetworkStream::Mock(..)"),
        }
    }
}

impl NetworkStream {
    /// Sets the read and write timeouts for the underlying socket
    pub fn set_timeout(&mut self, duration: Option<Duration>) -> io::Result<()> {
        match self {
            NetworkStream::Tcp(stream) => {
                stream.set_read_timeout(duration)?;
                stream.set_write_timeout(duration)
            }
            NetworkStream::Mock(_) => Ok(()),
        }
    }

    /// Shuts down both directions of the stream
    pub fn shutdown(&mut self) -> io::Result<()> {
        match self {
            NetworkStream::Tcp(stream) => stream.shutdown(Shutdown::Both),
            NetworkStream::Mock(_) => Ok(()),
        }
    }
}

impl Read for NetworkStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            NetworkStream::Tcp(stream) => stream.read(buf),
            NetworkStream::Mock(stream) => stream.read(buf),
        }
    }
}

impl Write for NetworkStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            NetworkStream::Tcp(stream) => stream.write(buf),
            NetworkStream::Mock(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            NetworkStream::Tcp(stream) => stream.flush(),
            NetworkStream::Mock(stream) => stream.flush(),
        }
    }
}
