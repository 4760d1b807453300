//! Byte-stream handles onto a task's stdio.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// A bidirectional byte stream onto a task's stdio, with half-close.
///
/// Writes go to the task's stdin; reads return its combined stdout and
/// stderr. Several attachers to one task share the same pipes: their
/// reads race and nothing is fanned out.
pub trait Attacher: Read + Write + Send {
    /// Closes the write direction so the task sees end of input, keeping
    /// the read direction open.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying close fails.
    fn close_write(&mut self) -> io::Result<()>;

    /// Bounds how long a read may block. A read that times out fails with
    /// [`io::ErrorKind::WouldBlock`] or [`io::ErrorKind::TimedOut`].
    ///
    /// # Errors
    ///
    /// Returns an error if the timeout cannot be applied.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Bounds how long a write may block, like
    /// [`Attacher::set_read_timeout`] does for reads.
    ///
    /// # Errors
    ///
    /// Returns an error if the timeout cannot be applied.
    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Returns another handle onto the same stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle cannot be duplicated.
    fn try_clone(&self) -> io::Result<Box<dyn Attacher>>;
}

impl Attacher for TcpStream {
    fn close_write(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        Self::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        Self::set_write_timeout(self, timeout)
    }

    fn try_clone(&self) -> io::Result<Box<dyn Attacher>> {
        Self::try_clone(self).map(|stream| Box::new(stream) as Box<dyn Attacher>)
    }
}
