use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mio::unix::pipe;
use parking_lot::Mutex;
use tracing::warn;

use crate::reactor::EventObject;

/// Self-pipe used to wake the loop from foreign threads.
///
/// The read end is registered for readability in the owning loop; the write
/// end is shared through [`NotifyHandle`] and written from any thread. One
/// byte per notification; a full pipe is benign because the loop will wake
/// anyway.
pub(crate) struct Notifier {
    receiver: Mutex<pipe::Receiver>,
    read_fd: RawFd,
    sender: Arc<pipe::Sender>,
    unique_id: AtomicU64,
}

#[derive(Clone)]
pub(crate) struct NotifyHandle {
    sender: Arc<pipe::Sender>,
}

impl Notifier {
    pub(crate) fn new() -> std::io::Result<Self> {
        let (sender, receiver) = pipe::new()?;
        let read_fd = receiver.as_raw_fd();
        Ok(Self {
            receiver: Mutex::new(receiver),
            read_fd,
            sender: Arc::new(sender),
            unique_id: AtomicU64::new(0),
        })
    }

    pub(crate) fn handle(&self) -> NotifyHandle {
        NotifyHandle {
            sender: Arc::clone(&self.sender),
        }
    }
}

impl NotifyHandle {
    pub(crate) fn notify(&self) {
        match (&*self.sender).write(&[0u8]) {
            Ok(_) => {}
            // Pipe full: enough wakeups are already pending.
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => warn!("notify write failed: {}", e),
        }
    }
}

impl EventObject for Notifier {
    fn fd(&self) -> RawFd {
        self.read_fd
    }

    fn unique_id(&self) -> u64 {
        self.unique_id.load(Ordering::Relaxed)
    }

    fn set_unique_id(&self, id: u64) {
        self.unique_id.store(id, Ordering::Relaxed);
    }

    fn handle_readable(&self) -> bool {
        // Edge-triggered: drain every pending wakeup byte.
        let mut receiver = self.receiver.lock();
        let mut buf = [0u8; 64];
        loop {
            match receiver.read(&mut buf) {
                Ok(0) => return false,
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("notifier read failed: {}", e);
                    return false;
                }
            }
        }
    }

    // The notifier never registers for writability.
    fn handle_writable(&self) -> bool {
        true
    }

    fn handle_error(&self) {
        warn!("error event on loop notifier");
    }
}
