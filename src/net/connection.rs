use std::any::Any;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Buf;
use mio::net::TcpStream;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::buffer::BufferedStream;
use super::{ConnFailCallback, DisconnectCallback, MessageCallback, NewConnCallback};
use crate::error::{Error, Result};
use crate::event_loop::LoopHandle;
use crate::reactor::{EventMask, EventObject, EVENT_READ, EVENT_WRITE};

/// How often the idle supervisor compares `last_active` against the
/// configured timeout. This is also the enforcement precision.
const IDLE_TICK: Duration = Duration::from_millis(100);

/// Connection lifecycle. Transitions are monotonic along
/// `New → Connecting → Connected → Disconnected` with `Failed` reachable
/// only from `Connecting`; `Disconnected` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    New = 0,
    Connecting = 1,
    Connected = 2,
    Disconnected = 3,
    Failed = 4,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::New,
            1 => ConnState::Connecting,
            2 => ConnState::Connected,
            3 => ConnState::Disconnected,
            _ => ConnState::Failed,
        }
    }
}

/// A buffered, full-duplex TCP connection bound to one event loop.
///
/// Connections are shared through `Arc`: the loop holds one while the
/// object is registered, user callbacks and pending tasks may hold more.
/// Internal supervisors (idle timer, active-close) capture only a `Weak`
/// projection so they never prolong the connection's life.
///
/// All state mutation happens on the owning loop's thread; the cross-thread
/// entry points are [`active_close`](TcpConnection::active_close) and the
/// read-only accessors.
pub struct TcpConnection {
    loop_handle: LoopHandle,
    me: Weak<TcpConnection>,
    unique_id: AtomicU64,
    state: AtomicU8,
    armed: AtomicU8,

    peer: OnceCell<SocketAddr>,
    stream: Mutex<Option<BufferedStream>>,

    on_message: Mutex<Option<MessageCallback>>,
    on_new_conn: Mutex<Option<NewConnCallback>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
    on_fail: Mutex<Option<ConnFailCallback>>,

    context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,

    idle_timer: AtomicU64,
    idle_timeout_ms: AtomicU64,
    last_active: Mutex<Instant>,
}

impl TcpConnection {
    pub fn new(loop_handle: LoopHandle) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            loop_handle,
            me: me.clone(),
            unique_id: AtomicU64::new(0),
            state: AtomicU8::new(ConnState::New as u8),
            armed: AtomicU8::new(0),
            peer: OnceCell::new(),
            stream: Mutex::new(None),
            on_message: Mutex::new(None),
            on_new_conn: Mutex::new(None),
            on_disconnect: Mutex::new(None),
            on_fail: Mutex::new(None),
            context: Mutex::new(None),
            idle_timer: AtomicU64::new(0),
            idle_timeout_ms: AtomicU64::new(0),
            last_active: Mutex::new(Instant::now()),
        })
    }

    fn me(&self) -> Arc<Self> {
        self.me.upgrade().expect("connection outlived its Arc")
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_handle
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.get().copied()
    }

    pub fn peer_ip(&self) -> String {
        self.peer
            .get()
            .map(|a| a.ip().to_string())
            .unwrap_or_default()
    }

    pub fn peer_port(&self) -> u16 {
        self.peer.get().map(|a| a.port()).unwrap_or(0)
    }

    pub fn set_message_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<TcpConnection>, &[u8]) -> isize + Send + Sync + 'static,
    {
        *self.on_message.lock() = Some(Arc::new(cb));
    }

    pub fn set_new_conn_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    {
        *self.on_new_conn.lock() = Some(Arc::new(cb));
    }

    pub(crate) fn install_new_conn_callback(&self, cb: NewConnCallback) {
        *self.on_new_conn.lock() = Some(cb);
    }

    pub fn set_on_disconnect<F>(&self, cb: F)
    where
        F: FnOnce(&Arc<TcpConnection>) + Send + 'static,
    {
        *self.on_disconnect.lock() = Some(Box::new(cb));
    }

    pub fn set_fail_callback<F>(&self, cb: F)
    where
        F: FnOnce(&LoopHandle, &str, u16) + Send + 'static,
    {
        *self.on_fail.lock() = Some(Box::new(cb));
    }

    /// Attach opaque application data to this connection.
    pub fn set_context(&self, ctx: Arc<dyn Any + Send + Sync>) {
        *self.context.lock() = Some(ctx);
    }

    /// Retrieve the attached context, downcast to `T`.
    pub fn context<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.context
            .lock()
            .clone()
            .and_then(|ctx| ctx.downcast::<T>().ok())
    }

    /// Initialize from an accepted socket. Called by the listener through
    /// the target loop's task queue, so it always runs on the owning loop.
    /// The socket arrives nonblocking and close-on-exec from accept4.
    pub fn on_accept(&self, stream: TcpStream, peer: SocketAddr) {
        assert!(
            self.loop_handle.is_current(),
            "on_accept off the owning loop"
        );
        assert!(self.state() == ConnState::New, "on_accept on a used connection");

        let _ = self.peer.set(peer);
        *self.stream.lock() = Some(BufferedStream::new(stream));

        let obj: Arc<dyn EventObject> = self.me();
        if !self.loop_handle.register(&obj, EVENT_READ) {
            error!("register accepted connection from {} failed", peer);
            *self.stream.lock() = None;
            return;
        }
        self.armed.store(EVENT_READ, Ordering::Relaxed);

        self.handle_connect();
    }

    /// Initiate an outbound connection. An immediate local failure returns
    /// `Err` and leaves the state untouched; asynchronous outcomes arrive
    /// through the state machine.
    pub fn connect(&self, ip: &str, port: u16) -> Result<()> {
        assert!(self.loop_handle.is_current(), "connect off the owning loop");
        if self.state() != ConnState::New {
            error!("repeat connect to {}:{}", ip, port);
            return Err(Error::WrongState("connect"));
        }

        let addr: SocketAddr = format!("{}:{}", ip, port)
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("{}:{}", ip, port)))?;
        let stream = TcpStream::connect(addr)?;

        let _ = self.peer.set(addr);
        *self.stream.lock() = Some(BufferedStream::new(stream));

        // Writable readiness signals the connect outcome.
        let obj: Arc<dyn EventObject> = self.me();
        if !self.loop_handle.register(&obj, EVENT_WRITE) {
            *self.stream.lock() = None;
            return Err(Error::LoopGone);
        }
        self.armed.store(EVENT_WRITE, Ordering::Relaxed);
        self.set_state(ConnState::Connecting);

        info!(
            "loop {:?} connecting to {}:{}",
            self.loop_handle.name(),
            ip,
            port
        );
        Ok(())
    }

    /// Append bytes to the output buffer and flush as far as the socket
    /// allows. Owning loop thread and `Connected` state only; an empty
    /// payload is a no-op success.
    pub fn send_packet(&self, data: &[u8]) -> bool {
        if self.state() != ConnState::Connected {
            error!("send in wrong connection state {:?}", self.state());
            return false;
        }
        assert!(
            self.loop_handle.is_current(),
            "send_packet off the owning loop"
        );
        if data.is_empty() {
            return true;
        }

        let flush = {
            let mut guard = self.stream.lock();
            let stream = match guard.as_mut() {
                Some(s) => s,
                None => return false,
            };
            stream.queue(data);
            stream.flush().map(|_| stream.has_pending_writes())
        };

        match flush {
            Ok(pending) => {
                let armed = self.armed.load(Ordering::Relaxed);
                if pending && armed & EVENT_WRITE == 0 {
                    self.set_events(armed | EVENT_WRITE);
                }
                true
            }
            Err(e) => {
                debug!("write to {} failed: {}", self.peer_ip(), e);
                self.handle_disconnect();
                false
            }
        }
    }

    /// Vectored variant of [`send_packet`](TcpConnection::send_packet):
    /// queues every slice as one contiguous packet.
    pub fn send_packet_vectored(&self, bufs: &[&[u8]]) -> bool {
        if self.state() != ConnState::Connected {
            error!("send in wrong connection state {:?}", self.state());
            return false;
        }
        assert!(
            self.loop_handle.is_current(),
            "send_packet off the owning loop"
        );
        if bufs.iter().all(|b| b.is_empty()) {
            return true;
        }

        let flush = {
            let mut guard = self.stream.lock();
            let stream = match guard.as_mut() {
                Some(s) => s,
                None => return false,
            };
            for buf in bufs {
                stream.queue(buf);
            }
            stream.flush().map(|_| stream.has_pending_writes())
        };

        match flush {
            Ok(pending) => {
                let armed = self.armed.load(Ordering::Relaxed);
                if pending && armed & EVENT_WRITE == 0 {
                    self.set_events(armed | EVENT_WRITE);
                }
                true
            }
            Err(e) => {
                debug!("write to {} failed: {}", self.peer_ip(), e);
                self.handle_disconnect();
                false
            }
        }
    }

    /// Request a disconnect. Runs immediately on the owning loop, otherwise
    /// hops threads; with `sync` the caller blocks until the close has run.
    /// Captures only a weak self-reference, so a pending close does not
    /// keep the connection alive.
    pub fn active_close(&self, sync: bool) {
        let me = self.me.clone();
        let destroy = move || {
            if let Some(conn) = me.upgrade() {
                if conn.state() == ConnState::Connected {
                    conn.handle_disconnect();
                }
            }
        };

        if self.loop_handle.is_current() {
            destroy();
        } else {
            let fut = self.loop_handle.execute(destroy);
            if sync {
                let _ = fut.wait();
            }
        }
    }

    /// Supervise this connection with an idle timeout. A 100 ms polling
    /// timer compares the gap since the last inbound byte against the
    /// threshold and closes the connection on expiry; enforcement precision
    /// is the tick, regardless of the requested value. The tick holds a
    /// weak handle and becomes a no-op once the connection is gone.
    pub fn set_idle_timeout(&self, timeout: Duration) {
        if timeout.is_zero() {
            return;
        }

        self.idle_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
        *self.last_active.lock() = Instant::now();

        let old = self.idle_timer.swap(0, Ordering::Relaxed);
        if old != 0 {
            let _ = self.loop_handle.cancel(old);
        }

        let me = self.me.clone();
        let id = self.loop_handle.schedule_repeatedly(IDLE_TICK, move || {
            let conn = match me.upgrade() {
                Some(conn) => conn,
                None => return,
            };
            if conn.idle_timeout_expired() {
                conn.active_close(false);
            }
        });
        self.idle_timer.store(id, Ordering::Relaxed);
    }

    fn idle_timeout_expired(&self) -> bool {
        let timeout = Duration::from_millis(self.idle_timeout_ms.load(Ordering::Relaxed));
        let elapsed = self.last_active.lock().elapsed();
        if elapsed > timeout {
            warn!(
                "idle timeout: inactive {:?} > {:?}, peer {}:{}",
                elapsed,
                timeout,
                self.peer_ip(),
                self.peer_port()
            );
            return true;
        }
        false
    }

    /// Toggle Nagle's algorithm on the underlying socket.
    pub fn set_nodelay(&self, enable: bool) {
        if let Some(stream) = self.stream.lock().as_ref() {
            stream.set_nodelay(enable);
        }
    }

    fn set_events(&self, events: EventMask) {
        if self.armed.load(Ordering::Relaxed) == events {
            return;
        }
        let obj: Arc<dyn EventObject> = self.me();
        if self.loop_handle.modify(&obj, events) {
            self.armed.store(events, Ordering::Relaxed);
        }
    }

    fn handle_connect(&self) {
        assert!(self.loop_handle.is_current());
        debug_assert!(matches!(
            self.state(),
            ConnState::New | ConnState::Connecting
        ));
        info!("connected to {}:{}", self.peer_ip(), self.peer_port());

        self.set_state(ConnState::Connected);
        self.set_events(EVENT_READ);

        let cb = self.on_new_conn.lock().take();
        if let Some(cb) = cb {
            cb(&self.me());
        }
    }

    fn handle_connect_failed(&self) {
        assert!(self.loop_handle.is_current());
        if self.state() != ConnState::Connecting {
            debug!("connect-failed event in state {:?} ignored", self.state());
            return;
        }
        error!("connect to {}:{} failed", self.peer_ip(), self.peer_port());

        self.set_state(ConnState::Failed);
        let cb = self.on_fail.lock().take();
        if let Some(cb) = cb {
            cb(&self.loop_handle, &self.peer_ip(), self.peer_port());
        }

        self.unregister_self();
    }

    fn handle_disconnect(&self) {
        assert!(self.loop_handle.is_current());
        if self.state() != ConnState::Connected {
            debug!("disconnect event in state {:?} ignored", self.state());
            return;
        }

        self.set_state(ConnState::Disconnected);
        let cb = self.on_disconnect.lock().take();
        if let Some(cb) = cb {
            cb(&self.me());
        }

        self.unregister_self();
    }

    fn unregister_self(&self) {
        if self.unique_id.load(Ordering::Relaxed) != 0 {
            let obj: Arc<dyn EventObject> = self.me();
            self.loop_handle.unregister(&obj);
        }
    }

    /// Feed the contiguous unread input to the message callback until it
    /// stops consuming. Returns `false` when the callback reported a fatal
    /// error (the disconnect has already been handled).
    fn dispatch_input(&self) -> bool {
        let cb = self.on_message.lock().clone();
        let mut input = {
            let mut guard = self.stream.lock();
            match guard.as_mut() {
                Some(stream) => stream.take_input(),
                None => return true,
            }
        };

        let mut consumed = 0usize;
        let mut fatal = false;
        match cb {
            None => {
                // Without a consumer the buffer would grow without bound.
                warn!(
                    "{} inbound bytes dropped: no message callback",
                    input.len()
                );
                consumed = input.len();
            }
            Some(cb) => {
                let me = self.me();
                while consumed < input.len() {
                    let n = cb(&me, &input[consumed..]);
                    if n > 0 {
                        consumed += (n as usize).min(input.len() - consumed);
                    } else {
                        fatal = n < 0;
                        break;
                    }
                    if self.state() != ConnState::Connected {
                        break;
                    }
                }
            }
        }

        input.advance(consumed);
        if let Some(stream) = self.stream.lock().as_mut() {
            stream.restore_input(input);
        }

        if fatal {
            self.handle_disconnect();
            return false;
        }
        true
    }
}

impl EventObject for TcpConnection {
    fn fd(&self) -> RawFd {
        self.stream.lock().as_ref().map(|s| s.fd()).unwrap_or(-1)
    }

    fn unique_id(&self) -> u64 {
        self.unique_id.load(Ordering::Relaxed)
    }

    fn set_unique_id(&self, id: u64) {
        self.unique_id.store(id, Ordering::Relaxed);
    }

    fn handle_readable(&self) -> bool {
        if self.state() != ConnState::Connected {
            debug!("read event in state {:?} ignored", self.state());
            return true;
        }

        let (nread, closed) = {
            let mut guard = self.stream.lock();
            match guard.as_mut() {
                Some(stream) => stream.fill(),
                None => return true,
            }
        };

        if nread > 0 {
            if self.idle_timer.load(Ordering::Relaxed) != 0 {
                *self.last_active.lock() = Instant::now();
            }
            if !self.dispatch_input() {
                // Fatal protocol error, already disconnected.
                return true;
            }
        }

        // EOF or read error: let the reactor route to handle_error.
        !closed
    }

    fn handle_writable(&self) -> bool {
        match self.state() {
            ConnState::Connecting => {
                let outcome = {
                    let guard = self.stream.lock();
                    match guard.as_ref() {
                        Some(stream) => stream.connect_result(),
                        None => return true,
                    }
                };
                match outcome {
                    Ok(true) => {
                        self.handle_connect();
                        true
                    }
                    // Still in flight; wait for the next writable edge.
                    Ok(false) => true,
                    Err(e) => {
                        debug!("connect probe failed: {}", e);
                        false
                    }
                }
            }
            ConnState::Connected => {
                let flushed = {
                    let mut guard = self.stream.lock();
                    match guard.as_mut() {
                        Some(stream) => stream.flush(),
                        None => return true,
                    }
                };
                match flushed {
                    Ok(true) => {
                        // Output drained; stop watching writability.
                        self.set_events(EVENT_READ);
                        true
                    }
                    Ok(false) => true,
                    Err(e) => {
                        debug!("flush to {} failed: {}", self.peer_ip(), e);
                        false
                    }
                }
            }
            state => {
                debug!("write event in state {:?} ignored", state);
                true
            }
        }
    }

    fn handle_error(&self) {
        match self.state() {
            ConnState::Connecting => self.handle_connect_failed(),
            ConnState::Connected => self.handle_disconnect(),
            state => debug!("error event in terminal state {:?} ignored", state),
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        let timer = *self.idle_timer.get_mut();
        if timer != 0 {
            let _ = self.loop_handle.cancel(timer);
        }
        if let Some(stream) = self.stream.get_mut().take() {
            debug!("close tcp fd {}", stream.fd());
        }
    }
}
