use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io::ErrorKind;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use tracing::{error, trace, warn};

use super::{EventMask, EventObject, Reactor, TimerId, EVENT_READ, EVENT_WRITE};

/// Upper bound on how long one `poll` call may sleep. Keeps the latency
/// between cross-thread task injection and the next loop iteration bounded.
const POLL_CEILING: Duration = Duration::from_millis(10);

const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

struct Entry {
    obj: Arc<dyn EventObject>,
    fd: RawFd,
    events: EventMask,
}

struct Timer {
    deadline: Instant,
    period: Duration,
    repeat: bool,
    // Taken out of the table while the callback runs.
    callback: Option<Box<dyn FnMut() + Send>>,
}

enum Expired {
    Stale,
    OneShot(Box<dyn FnMut() + Send>),
    Repeat(Box<dyn FnMut() + Send>, Instant),
}

/// The concrete reactor, built on mio's `Poll`.
///
/// Registered fds are armed through `SourceFd` with the object's unique id
/// as the token. Timers live in a deadline heap with lazy deletion; the
/// poll timeout shrinks to the next deadline, capped at [`POLL_CEILING`].
///
/// mio readiness is edge-triggered, so every handler is expected to drain
/// its fd until `WouldBlock`.
pub struct PollReactor {
    poll: RefCell<Poll>,
    // Cloned registry so arming/disarming never contends with an in-flight
    // poll borrow (handlers re-enter register/modify mid-dispatch).
    registry: Registry,
    events: RefCell<Events>,
    objects: RefCell<HashMap<u64, Entry>>,
    timers: RefCell<HashMap<TimerId, Timer>>,
    deadlines: RefCell<BinaryHeap<Reverse<(Instant, TimerId)>>>,
    ready: RefCell<Vec<(u64, bool, bool, bool)>>,
}

impl PollReactor {
    pub fn new() -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        Ok(Self {
            poll: RefCell::new(poll),
            registry,
            events: RefCell::new(Events::with_capacity(1024)),
            objects: RefCell::new(HashMap::new()),
            timers: RefCell::new(HashMap::new()),
            deadlines: RefCell::new(BinaryHeap::new()),
            ready: RefCell::new(Vec::new()),
        })
    }

    fn interest(events: EventMask) -> Option<Interest> {
        match (events & EVENT_READ != 0, events & EVENT_WRITE != 0) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Time until the nearest live timer deadline, capped at the ceiling.
    fn next_timeout(&self) -> Duration {
        let now = Instant::now();
        let mut deadlines = self.deadlines.borrow_mut();
        let timers = self.timers.borrow();

        while let Some(&Reverse((deadline, id))) = deadlines.peek() {
            let live = timers
                .get(&id)
                .is_some_and(|t| t.deadline == deadline);
            if !live {
                deadlines.pop();
                continue;
            }
            return deadline.saturating_duration_since(now).min(POLL_CEILING);
        }
        POLL_CEILING
    }

    fn schedule(&self, id: TimerId, period: Duration, f: Box<dyn FnMut() + Send>, repeat: bool) {
        let period = period.max(MIN_TIMER_PERIOD);
        let deadline = Instant::now() + period;

        let replaced = self.timers.borrow_mut().insert(
            id,
            Timer {
                deadline,
                period,
                repeat,
                callback: Some(f),
            },
        );
        if replaced.is_some() {
            warn!("timer {} rescheduled while live", id);
        }
        self.deadlines.borrow_mut().push(Reverse((deadline, id)));
    }

    fn expire_timers(&self) {
        loop {
            let now = Instant::now();
            let (deadline, id) = {
                let mut deadlines = self.deadlines.borrow_mut();
                match deadlines.peek() {
                    Some(&Reverse((deadline, id))) if deadline <= now => {
                        deadlines.pop();
                        (deadline, id)
                    }
                    _ => break,
                }
            };

            let expired = {
                let mut timers = self.timers.borrow_mut();
                match timers.get_mut(&id) {
                    // Cancelled or re-armed; the heap entry is stale.
                    None => Expired::Stale,
                    Some(t) if t.deadline != deadline => Expired::Stale,
                    Some(t) if t.repeat => {
                        let next = now + t.period;
                        t.deadline = next;
                        match t.callback.take() {
                            Some(cb) => Expired::Repeat(cb, next),
                            None => Expired::Stale,
                        }
                    }
                    // One-shot: removed from the table before the callback
                    // runs, so an in-callback Cancel(id) reports false.
                    Some(_) => match timers.remove(&id) {
                        Some(t) => match t.callback {
                            Some(cb) => Expired::OneShot(cb),
                            None => Expired::Stale,
                        },
                        None => Expired::Stale,
                    },
                }
            };

            match expired {
                Expired::Stale => continue,
                Expired::OneShot(mut cb) => cb(),
                Expired::Repeat(mut cb, next) => {
                    self.deadlines.borrow_mut().push(Reverse((next, id)));
                    cb();
                    // The callback may have cancelled its own timer; only a
                    // surviving entry gets the callback back.
                    if let Some(t) = self.timers.borrow_mut().get_mut(&id) {
                        t.callback = Some(cb);
                    }
                }
            }
        }
    }
}

impl Reactor for PollReactor {
    fn register(&self, obj: &Arc<dyn EventObject>, events: EventMask) -> bool {
        let id = obj.unique_id();
        debug_assert!(id != 0, "register before id assignment");

        let mut objects = self.objects.borrow_mut();
        if objects.contains_key(&id) {
            return false;
        }

        let fd = obj.fd();
        if let Some(interest) = Self::interest(events) {
            if let Err(e) = self
                .registry
                .register(&mut SourceFd(&fd), Token(id as usize), interest)
            {
                error!("register fd {} failed: {}", fd, e);
                return false;
            }
        }

        objects.insert(
            id,
            Entry {
                obj: Arc::clone(obj),
                fd,
                events,
            },
        );
        true
    }

    fn modify(&self, obj: &Arc<dyn EventObject>, events: EventMask) -> bool {
        let id = obj.unique_id();
        let mut objects = self.objects.borrow_mut();
        let entry = match objects.get_mut(&id) {
            Some(entry) => entry,
            None => return false,
        };
        if entry.events == events {
            return true;
        }

        let fd = entry.fd;
        let result = match (Self::interest(entry.events), Self::interest(events)) {
            (None, Some(interest)) => {
                self.registry
                    .register(&mut SourceFd(&fd), Token(id as usize), interest)
            }
            (Some(_), Some(interest)) => {
                self.registry
                    .reregister(&mut SourceFd(&fd), Token(id as usize), interest)
            }
            (Some(_), None) => self.registry.deregister(&mut SourceFd(&fd)),
            (None, None) => Ok(()),
        };
        if let Err(e) = result {
            error!("modify fd {} events {:#x} failed: {}", fd, events, e);
            return false;
        }

        entry.events = events;
        true
    }

    fn unregister(&self, obj: &Arc<dyn EventObject>) {
        let id = obj.unique_id();
        let entry = match self.objects.borrow_mut().remove(&id) {
            Some(entry) => entry,
            None => return,
        };
        if Self::interest(entry.events).is_some() {
            if let Err(e) = self.registry.deregister(&mut SourceFd(&entry.fd)) {
                warn!("deregister fd {} failed: {}", entry.fd, e);
            }
        }
    }

    fn poll(&self) -> bool {
        let timeout = self.next_timeout();
        {
            let mut poll = self.poll.borrow_mut();
            let mut events = self.events.borrow_mut();
            match poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("poll failed: {}", e);
                    return false;
                }
            }

            let mut ready = self.ready.borrow_mut();
            ready.clear();
            for ev in events.iter() {
                ready.push((
                    ev.token().0 as u64,
                    ev.is_readable() || ev.is_read_closed(),
                    ev.is_writable(),
                    ev.is_error(),
                ));
            }
        }

        // Dispatch outside any borrow: handlers re-enter the reactor to
        // modify interest, unregister themselves, or schedule timers.
        let batch = std::mem::take(&mut *self.ready.borrow_mut());
        for &(id, readable, writable, errored) in &batch {
            let obj = match self.objects.borrow().get(&id) {
                Some(entry) => Arc::clone(&entry.obj),
                // Unregistered earlier in this batch.
                None => continue,
            };

            if readable && !obj.handle_readable() {
                obj.handle_error();
                continue;
            }
            // The readable handler may have torn the object down.
            if !self.objects.borrow().contains_key(&id) {
                continue;
            }
            if writable {
                if !obj.handle_writable() {
                    obj.handle_error();
                }
            } else if errored && !readable {
                trace!("error event on fd object {}", id);
                obj.handle_error();
            }
        }
        *self.ready.borrow_mut() = batch;

        self.expire_timers();
        true
    }

    fn schedule_repeatedly(&self, id: TimerId, period: Duration, f: Box<dyn FnMut() + Send>) {
        self.schedule(id, period, f, true);
    }

    fn schedule_later(&self, id: TimerId, delay: Duration, f: Box<dyn FnOnce() + Send>) {
        let mut f = Some(f);
        self.schedule(
            id,
            delay,
            Box::new(move || {
                if let Some(f) = f.take() {
                    f()
                }
            }),
            false,
        );
    }

    fn cancel(&self, id: TimerId) -> bool {
        self.timers.borrow_mut().remove(&id).is_some()
    }
}
