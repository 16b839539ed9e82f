use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use bytes::BytesMut;
use mio::net::TcpStream;
use tracing::debug;

const READ_CHUNK: usize = 8 * 1024;

/// Buffered full-duplex wrapper around a nonblocking socket: an input byte
/// buffer filled from the socket and an output buffer with a consumed
/// prefix, drained to the socket. Dropping it closes the fd.
pub(crate) struct BufferedStream {
    stream: TcpStream,
    input: BytesMut,
    output: Vec<u8>,
    write_pos: usize,
}

impl BufferedStream {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            input: BytesMut::new(),
            output: Vec::new(),
            write_pos: 0,
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub(crate) fn set_nodelay(&self, enable: bool) {
        if let Err(e) = self.stream.set_nodelay(enable) {
            debug!("set_nodelay({}) failed: {}", enable, e);
        }
    }

    /// Probe an in-flight nonblocking connect. `Ok(true)` once connected,
    /// `Ok(false)` while still pending, `Err` when the connect failed.
    pub(crate) fn connect_result(&self) -> io::Result<bool> {
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        match self.stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(false),
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drain the socket into the input buffer until `WouldBlock`.
    /// Returns the byte count read and whether the stream reached EOF or a
    /// fatal read error.
    pub(crate) fn fill(&mut self) -> (usize, bool) {
        let mut total = 0;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return (total, true),
                Ok(n) => {
                    self.input.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return (total, false),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    if e.kind() != ErrorKind::ConnectionReset {
                        debug!("read failed on fd {}: {}", self.fd(), e);
                    }
                    return (total, true);
                }
            }
        }
    }

    pub(crate) fn queue(&mut self, data: &[u8]) {
        // Reclaim the buffer once everything queued so far went out.
        if self.write_pos >= self.output.len() {
            self.output.clear();
            self.write_pos = 0;
        }
        self.output.extend_from_slice(data);
    }

    /// Drain the output buffer to the socket until empty or `WouldBlock`.
    /// `Ok(true)` when fully drained.
    pub(crate) fn flush(&mut self) -> io::Result<bool> {
        while self.write_pos < self.output.len() {
            match self.stream.write(&self.output[self.write_pos..]) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => self.write_pos += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.output.clear();
        self.write_pos = 0;
        Ok(true)
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        self.write_pos < self.output.len()
    }

    /// Move the input buffer out so callbacks can borrow it without holding
    /// the stream lock; hand the unconsumed remainder back with
    /// [`restore_input`](Self::restore_input).
    pub(crate) fn take_input(&mut self) -> BytesMut {
        std::mem::take(&mut self.input)
    }

    pub(crate) fn restore_input(&mut self, input: BytesMut) {
        debug_assert!(self.input.is_empty());
        self.input = input;
    }
}
