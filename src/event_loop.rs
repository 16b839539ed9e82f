//! EventLoop: one reactor per thread, driven by [`EventLoop::run`].
//!
//! The loop owns the reactor, the self-pipe notifier, the cross-thread task
//! queue, and shared handles to every registered object. [`LoopHandle`] is
//! the cloneable, thread-safe face of a loop: `execute`, `schedule_*`,
//! `cancel` and `stop` may be called from any thread, while `register`,
//! `modify`, `unregister`, `listen` and `connect` assert the loop's own
//! thread (registration keeps id allocation and table insertion a
//! single-thread invariant).

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::net::{TcpConnection, TcpListener};
use crate::notifier::{Notifier, NotifyHandle};
use crate::reactor::{EventMask, EventObject, PollReactor, Reactor, TimerId, EVENT_READ};

type Task = Box<dyn FnOnce() + Send>;

static LOOP_ID: AtomicU64 = AtomicU64::new(0);
static OBJECT_ID: AtomicU64 = AtomicU64::new(0);
static TIMER_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT: RefCell<Option<Rc<LoopCore>>> = const { RefCell::new(None) };
}

fn next_timer_id() -> TimerId {
    let mut id = TIMER_ID.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    // 0 is the "no timer" sentinel; skip it on wrap.
    if id == 0 {
        id = TIMER_ID.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    }
    id
}

/// Completion handle for a task posted with [`LoopHandle::execute`].
///
/// Resolves when the loop has run the task. A task that panics, or a loop
/// that tears down with the task still queued, surfaces as
/// [`Error::TaskDropped`]; the loop itself keeps running.
pub struct TaskFuture<T> {
    rx: crossbeam_channel::Receiver<T>,
}

impl<T> TaskFuture<T> {
    fn pair() -> (crossbeam_channel::Sender<T>, Self) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (tx, Self { rx })
    }

    fn ready(value: T) -> Self {
        let (tx, fut) = Self::pair();
        let _ = tx.send(value);
        fut
    }

    fn dropped() -> Self {
        let (_, fut) = Self::pair();
        fut
    }

    /// Block until the task has run and return its result.
    pub fn wait(self) -> Result<T> {
        self.rx.recv().map_err(|_| Error::TaskDropped)
    }

    /// Non-blocking probe; `None` while the task is still pending.
    pub fn try_wait(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

struct LoopShared {
    id: u64,
    name: String,
    tasks: Mutex<Vec<Task>>,
    running: AtomicBool,
    notify: NotifyHandle,
}

/// Loop-thread-only state: the reactor and the registered-object table.
/// Reached through the thread-local current-loop slot; never crosses
/// threads, so plain `RefCell` suffices.
pub(crate) struct LoopCore {
    shared: Arc<LoopShared>,
    reactor: RefCell<Option<Box<dyn Reactor>>>,
    objects: RefCell<HashMap<u64, Arc<dyn EventObject>>>,
}

impl LoopCore {
    fn current() -> Option<Rc<LoopCore>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    fn register(&self, obj: &Arc<dyn EventObject>, events: EventMask) -> bool {
        assert!(obj.unique_id() == 0, "object is already registered");

        let reactor = self.reactor.borrow();
        let reactor = match reactor.as_ref() {
            Some(r) => r,
            None => return false,
        };

        let mut objects = self.objects.borrow_mut();
        let mut id = OBJECT_ID.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        while id == 0 || objects.contains_key(&id) {
            id = OBJECT_ID.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        }
        obj.set_unique_id(id);

        if reactor.register(obj, events) {
            objects.insert(id, Arc::clone(obj));
            true
        } else {
            obj.set_unique_id(0);
            false
        }
    }

    fn modify(&self, obj: &Arc<dyn EventObject>, events: EventMask) -> bool {
        let id = obj.unique_id();
        assert!(id != 0, "modify on unregistered object");
        debug_assert!(self.objects.borrow().contains_key(&id));

        match self.reactor.borrow().as_ref() {
            Some(r) => r.modify(obj, events),
            None => false,
        }
    }

    fn unregister(&self, obj: &Arc<dyn EventObject>) {
        let id = obj.unique_id();
        assert!(id != 0, "unregister on unregistered object");

        if let Some(r) = self.reactor.borrow().as_ref() {
            r.unregister(obj);
        }
        self.objects.borrow_mut().remove(&id);
    }

    fn schedule_repeatedly(&self, id: TimerId, period: Duration, f: Box<dyn FnMut() + Send>) {
        match self.reactor.borrow().as_ref() {
            Some(r) => r.schedule_repeatedly(id, period, f),
            None => debug!("timer {} scheduled on torn-down loop", id),
        }
    }

    fn schedule_later(&self, id: TimerId, delay: Duration, f: Box<dyn FnOnce() + Send>) {
        match self.reactor.borrow().as_ref() {
            Some(r) => r.schedule_later(id, delay, f),
            None => debug!("timer {} scheduled on torn-down loop", id),
        }
    }

    fn cancel_timer(&self, id: TimerId) -> bool {
        match self.reactor.borrow().as_ref() {
            Some(r) => r.cancel(id),
            None => false,
        }
    }
}

/// Cloneable, `Send + Sync` handle to an event loop.
///
/// This is what callbacks receive and what foreign threads hold. See the
/// module docs for which operations require the loop's own thread.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the calling thread is this loop's thread.
    pub fn is_current(&self) -> bool {
        CURRENT.with(|c| {
            c.borrow()
                .as_ref()
                .is_some_and(|core| core.shared.id == self.shared.id)
        })
    }

    fn core(&self) -> Rc<LoopCore> {
        let core = LoopCore::current().expect("not on an event loop thread");
        assert!(
            core.shared.id == self.shared.id,
            "loop {:?} touched from the thread of loop {:?}",
            self.shared.name,
            core.shared.name
        );
        core
    }

    /// Run `f` in the loop thread. Inline and already-resolved when called
    /// from the loop thread itself; queued behind the task mutex plus a
    /// notifier wakeup otherwise.
    pub fn execute<F, R>(&self, f: F) -> TaskFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            let (tx, fut) = TaskFuture::pair();
            match catch_unwind(AssertUnwindSafe(f)) {
                Ok(value) => {
                    let _ = tx.send(value);
                }
                Err(_) => error!("task panicked in loop {:?}", self.shared.name),
            }
            return fut;
        }

        if !self.shared.running.load(Ordering::Acquire) {
            return TaskFuture::dropped();
        }

        let (tx, fut) = TaskFuture::pair();
        let name = self.shared.name.clone();
        let task: Task = Box::new(move || match catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => {
                let _ = tx.send(value);
            }
            Err(_) => error!("task panicked in loop {:?}", name),
        });
        self.shared.tasks.lock().push(task);
        self.shared.notify.notify();
        fut
    }

    /// Install a repeating timer; returns its id synchronously. Safe from
    /// any thread. Periods below 1 ms are clamped up.
    pub fn schedule_repeatedly<F>(&self, period: Duration, f: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let id = next_timer_id();
        if self.is_current() {
            self.core().schedule_repeatedly(id, period, Box::new(f));
        } else {
            let handle = self.clone();
            self.execute(move || handle.core().schedule_repeatedly(id, period, Box::new(f)));
        }
        id
    }

    /// Install a one-shot timer; returns its id synchronously. Safe from
    /// any thread.
    pub fn schedule_later<F>(&self, delay: Duration, f: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = next_timer_id();
        if self.is_current() {
            self.core().schedule_later(id, delay, Box::new(f));
        } else {
            let handle = self.clone();
            self.execute(move || handle.core().schedule_later(id, delay, Box::new(f)));
        }
        id
    }

    /// Cancel a timer. The future carries whether the id was live at cancel
    /// time; a one-shot that has already fired reports `false`.
    pub fn cancel(&self, id: TimerId) -> TaskFuture<bool> {
        if self.is_current() {
            TaskFuture::ready(self.core().cancel_timer(id))
        } else {
            let handle = self.clone();
            self.execute(move || handle.core().cancel_timer(id))
        }
    }

    /// Signal the loop to exit after its current iteration. Safe from any
    /// thread.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.notify.notify();
    }

    /// Register `obj` and arm `events` for it. Loop thread only; allocates
    /// the object's unique id and holds a shared handle until
    /// unregistration or loop teardown.
    pub fn register(&self, obj: &Arc<dyn EventObject>, events: EventMask) -> bool {
        self.core().register(obj, events)
    }

    /// Change the armed event set of a registered object. Loop thread only.
    pub fn modify(&self, obj: &Arc<dyn EventObject>, events: EventMask) -> bool {
        self.core().modify(obj, events)
    }

    /// Drop a registered object from the loop. Loop thread only.
    pub fn unregister(&self, obj: &Arc<dyn EventObject>) {
        self.core().unregister(obj)
    }

    /// Number of currently registered objects. Loop thread only.
    pub fn object_count(&self) -> usize {
        self.core().objects.borrow().len()
    }

    /// Start a TCP listener on `ip:port`. Loop thread only.
    pub fn listen<F>(&self, ip: &str, port: u16, on_new_conn: F) -> Result<Arc<TcpListener>>
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    {
        let listener = TcpListener::new(self.clone());
        listener.set_new_conn_callback(on_new_conn);
        listener.bind(ip, port)?;
        Ok(listener)
    }

    /// Start an outbound TCP connection to `ip:port`. Loop thread only.
    /// An immediate local failure returns `Err` without a state change;
    /// asynchronous failure is reported through `on_fail`.
    pub fn connect<F, G>(
        &self,
        ip: &str,
        port: u16,
        on_new_conn: F,
        on_fail: G,
    ) -> Result<Arc<TcpConnection>>
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
        G: FnOnce(&LoopHandle, &str, u16) + Send + 'static,
    {
        let conn = TcpConnection::new(self.clone());
        conn.set_new_conn_callback(on_new_conn);
        conn.set_fail_callback(on_fail);
        conn.connect(ip, port)?;
        Ok(conn)
    }
}

/// A single-threaded event loop. Construct and [`run`](EventLoop::run) it on
/// the thread that will own it; hand [`LoopHandle`]s to everyone else.
pub struct EventLoop {
    core: Rc<LoopCore>,
    notifier: Arc<Notifier>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::with_name("")
    }

    pub fn with_name(name: &str) -> Self {
        CURRENT.with(|c| {
            assert!(
                c.borrow().is_none(),
                "there must be only one EventLoop per thread"
            )
        });

        let reactor = PollReactor::new().expect("create reactor backend");
        let notifier = Arc::new(Notifier::new().expect("create loop notifier"));
        let shared = Arc::new(LoopShared {
            id: LOOP_ID.fetch_add(1, Ordering::Relaxed).wrapping_add(1),
            name: name.to_string(),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            notify: notifier.handle(),
        });
        let core = Rc::new(LoopCore {
            shared,
            reactor: RefCell::new(Some(Box::new(reactor))),
            objects: RefCell::new(HashMap::new()),
        });

        CURRENT.with(|c| *c.borrow_mut() = Some(Rc::clone(&core)));
        Self { core, notifier }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.core.shared),
        }
    }

    /// Handle to the loop owning the calling thread, if any. The equivalent
    /// of the thread-local current-loop accessor.
    pub fn current() -> Option<LoopHandle> {
        LoopCore::current().map(|core| LoopHandle {
            shared: Arc::clone(&core.shared),
        })
    }

    pub fn stop(&self) {
        self.handle().stop();
    }

    /// See [`LoopHandle::execute`].
    pub fn execute<F, R>(&self, f: F) -> TaskFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle().execute(f)
    }

    /// See [`LoopHandle::listen`].
    pub fn listen<F>(&self, ip: &str, port: u16, on_new_conn: F) -> Result<Arc<TcpListener>>
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    {
        self.handle().listen(ip, port, on_new_conn)
    }

    /// See [`LoopHandle::connect`].
    pub fn connect<F, G>(
        &self,
        ip: &str,
        port: u16,
        on_new_conn: F,
        on_fail: G,
    ) -> Result<Arc<TcpConnection>>
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
        G: FnOnce(&LoopHandle, &str, u16) + Send + 'static,
    {
        self.handle().connect(ip, port, on_new_conn, on_fail)
    }

    /// Drive the loop until [`stop`](LoopHandle::stop): drain queued tasks,
    /// then poll the reactor, repeatedly. On exit every remaining object is
    /// unregistered and the reactor is dropped.
    pub fn run(&mut self) {
        let notifier: Arc<dyn EventObject> = Arc::clone(&self.notifier) as Arc<dyn EventObject>;
        if !self.core.register(&notifier, EVENT_READ) {
            error!("register loop notifier failed");
            return;
        }

        while self.core.shared.running.load(Ordering::Acquire) {
            if let Some(mut guard) = self.core.shared.tasks.try_lock() {
                let tasks = std::mem::take(&mut *guard);
                drop(guard);
                for task in tasks {
                    task();
                }
            }

            let ok = match self.core.reactor.borrow().as_ref() {
                Some(reactor) => reactor.poll(),
                None => false,
            };
            if !ok {
                error!("reactor poll failed");
            }
        }

        let objects: Vec<Arc<dyn EventObject>> = {
            let mut table = self.core.objects.borrow_mut();
            table.drain().map(|(_, obj)| obj).collect()
        };
        if let Some(reactor) = self.core.reactor.borrow().as_ref() {
            for obj in &objects {
                reactor.unregister(obj);
            }
        }
        drop(objects);
        *self.core.reactor.borrow_mut() = None;

        // Queued tasks can never run now; dropping them resolves their
        // futures with TaskDropped.
        self.core.shared.tasks.lock().clear();
        info!("loop {:?} stopped", self.core.shared.name);
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.core.shared.running.store(false, Ordering::Release);
        CURRENT.with(|c| {
            let mut slot = c.borrow_mut();
            if slot
                .as_ref()
                .is_some_and(|core| core.shared.id == self.core.shared.id)
            {
                *slot = None;
            }
        });
    }
}
