use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use mio::net::TcpListener as MioTcpListener;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{LoopSelector, NewConnCallback, TcpConnection};
use crate::error::{Error, Result};
use crate::event_loop::LoopHandle;
use crate::reactor::{EventObject, EVENT_READ};

/// Accepts inbound connections and promotes each accepted socket into a
/// [`TcpConnection`] on a selectable target loop.
///
/// Binding is one-shot. Each accepted connection is initialized on the loop
/// returned by the loop selector (the listener's own loop by default) via
/// that loop's task queue, so `on_accept` always runs on the target thread.
pub struct TcpListener {
    loop_handle: LoopHandle,
    me: Weak<TcpListener>,
    unique_id: AtomicU64,
    listener: Mutex<Option<MioTcpListener>>,
    local_addr: OnceCell<SocketAddr>,
    on_new_conn: Mutex<Option<NewConnCallback>>,
    selector: Mutex<Option<LoopSelector>>,
}

impl TcpListener {
    pub fn new(loop_handle: LoopHandle) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            loop_handle,
            me: me.clone(),
            unique_id: AtomicU64::new(0),
            listener: Mutex::new(None),
            local_addr: OnceCell::new(),
            on_new_conn: Mutex::new(None),
            selector: Mutex::new(None),
        })
    }

    fn me(&self) -> Arc<Self> {
        self.me.upgrade().expect("listener outlived its Arc")
    }

    pub fn set_new_conn_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    {
        *self.on_new_conn.lock() = Some(Arc::new(cb));
    }

    /// Install a per-accept loop selector for distributing connections
    /// across worker loops.
    pub fn set_loop_selector<F>(&self, selector: F)
    where
        F: Fn() -> LoopHandle + Send + Sync + 'static,
    {
        *self.selector.lock() = Some(Box::new(selector));
    }

    /// Bind and start accepting on `ip:port`. One-shot; rebinding the same
    /// object is an error. The socket is created with address reuse and
    /// close-on-exec.
    pub fn bind(&self, ip: &str, port: u16) -> Result<()> {
        assert!(self.loop_handle.is_current(), "bind off the owning loop");
        if self.listener.lock().is_some() {
            error!("repeat bind to port {}", port);
            return Err(Error::AlreadyBound);
        }

        let addr: SocketAddr = format!("{}:{}", ip, port)
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("{}:{}", ip, port)))?;
        let listener = MioTcpListener::bind(addr)?;
        let local = listener.local_addr()?;
        *self.listener.lock() = Some(listener);

        let obj: Arc<dyn EventObject> = self.me();
        if !self.loop_handle.register(&obj, EVENT_READ) {
            error!("add tcp listener to loop failed, port {}", port);
            *self.listener.lock() = None;
            return Err(Error::LoopGone);
        }

        let _ = self.local_addr.set(local);
        info!("tcp listen on {}", local);
        Ok(())
    }

    /// The bound address, useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    fn select_loop(&self) -> LoopHandle {
        match self.selector.lock().as_ref() {
            Some(selector) => selector(),
            None => self.loop_handle.clone(),
        }
    }

    /// Accept-path error taxonomy: transient errors are ignored, resource
    /// exhaustion is logged and the socket dropped, anything else is a bug.
    /// Returns whether the accept loop should keep going this round.
    fn on_accept_error(&self, e: io::Error) -> bool {
        match e.raw_os_error() {
            Some(libc::EINTR) | Some(libc::ECONNABORTED) | Some(libc::EPROTO) => {
                debug!("transient accept error: {}", e);
                true
            }
            Some(libc::EMFILE) | Some(libc::ENFILE) => {
                error!("accept failed, out of file descriptors: {}", e);
                false
            }
            Some(libc::ENOBUFS) | Some(libc::ENOMEM) => {
                error!("accept failed, out of socket memory: {}", e);
                false
            }
            _ => {
                error!("BUG: accept failed with {}", e);
                debug_assert!(false, "unexpected accept error: {}", e);
                false
            }
        }
    }
}

impl EventObject for TcpListener {
    fn fd(&self) -> RawFd {
        self.listener
            .lock()
            .as_ref()
            .map(|l| l.as_raw_fd())
            .unwrap_or(-1)
    }

    fn unique_id(&self) -> u64 {
        self.unique_id.load(Ordering::Relaxed)
    }

    fn set_unique_id(&self, id: u64) {
        self.unique_id.store(id, Ordering::Relaxed);
    }

    fn handle_readable(&self) -> bool {
        loop {
            let accepted = {
                let guard = self.listener.lock();
                match guard.as_ref() {
                    Some(listener) => listener.accept(),
                    None => return true,
                }
            };

            match accepted {
                Ok((stream, peer)) => {
                    let cb = self.on_new_conn.lock().clone();
                    let cb = match cb {
                        Some(cb) => cb,
                        None => {
                            warn!("closing new conn from {}: no callback installed", peer);
                            continue;
                        }
                    };
                    debug!("new conn fd {} from {}", stream.as_raw_fd(), peer);

                    let target = self.select_loop();
                    let conn = TcpConnection::new(target.clone());
                    conn.install_new_conn_callback(cb);
                    // Always initialize on the target loop's thread.
                    target.execute(move || conn.on_accept(stream, peer));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    if !self.on_accept_error(e) {
                        return true;
                    }
                }
            }
        }
    }

    fn handle_error(&self) {
        warn!("error event on listener fd {}", self.fd());
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            debug!("close tcp listener fd {}", listener.as_raw_fd());
        }
    }
}
