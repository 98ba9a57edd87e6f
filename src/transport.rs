//! The byte stream under a [`Session`](crate::Session).

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// A non-blocking, connected byte stream.
///
/// Reads and writes return [`Error::WouldBlock`] rather than waiting.
/// The stream's blocking mode is chosen by the caller, dusk never changes it.
pub trait Transport {
    /// Reads available bytes. `Ok(0)` means the peer closed the stream.
    fn try_read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Writes some of `buf`, returning the number of bytes accepted.
    fn try_write(&mut self, buf: &[u8]) -> Result<usize>;

    fn close(&mut self) -> Result<()>;

    /// Waits until the stream may be ready again.
    ///
    /// Only called for blocking mode operations. Implementations with a
    /// readiness mechanism should block on it here.
    fn wait(&mut self) -> Result<()> {
        std::thread::yield_now();
        Ok(())
    }
}

fn map_io(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Error::WouldBlock,
        _ => Error::IoError { source: e },
    }
}

impl Transport for TcpStream {
    fn try_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read(buf).map_err(map_io)
    }

    fn try_write(&mut self, buf: &[u8]) -> Result<usize> {
        match self.write(buf) {
            // A zero length write on a non-empty buffer is a closed socket
            Ok(0) if !buf.is_empty() => Err(Error::TransportClosed),
            r => r.map_err(map_io),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self.shutdown(Shutdown::Both) {
            // Already closed by the peer
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            r => r.map_err(map_io),
        }
    }

    fn wait(&mut self) -> Result<()> {
        std::thread::sleep(Duration::from_millis(1));
        Ok(())
    }
}
