//! Reactor abstraction: event demultiplexing and timers.
//!
//! A [`Reactor`] maps readiness on file descriptors and timer expirations to
//! callbacks on [`EventObject`]s. The rest of the crate depends only on this
//! trait; [`PollReactor`] is the one concrete implementation.

mod poller;

pub use poller::PollReactor;

use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Identifier for a scheduled timer. Ids are monotonic and process-wide;
/// 0 is never a valid id.
pub type TimerId = u64;

/// Bitmask of directions a registered object is armed for.
pub type EventMask = u8;

pub const EVENT_NONE: EventMask = 0;
pub const EVENT_READ: EventMask = 0x1;
pub const EVENT_WRITE: EventMask = 0x2;

/// A participant in an event loop: something with a file descriptor and
/// readiness handlers.
///
/// An object is owned by at most one loop at a time. Its unique id is
/// assigned at registration and is meaningful only while registered
/// (0 means unregistered).
pub trait EventObject: Send + Sync {
    fn fd(&self) -> RawFd;

    fn unique_id(&self) -> u64;
    fn set_unique_id(&self, id: u64);

    /// Called when the fd is readable. Return `false` to have the reactor
    /// route to [`handle_error`](EventObject::handle_error).
    fn handle_readable(&self) -> bool;

    /// Called when the fd is writable. Same `false` contract as
    /// [`handle_readable`](EventObject::handle_readable).
    fn handle_writable(&self) -> bool {
        true
    }

    fn handle_error(&self);
}

/// Event demultiplexer plus timer table.
///
/// All methods are loop-thread-only; the reactor needs no internal locking
/// (see the concurrency rules in [`crate::event_loop`]).
pub trait Reactor {
    /// Arm `events` for `obj`. An empty mask is legal: the entry is tracked
    /// and directions can be armed later via [`modify`](Reactor::modify).
    /// Fails if the object's id is already registered.
    fn register(&self, obj: &Arc<dyn EventObject>, events: EventMask) -> bool;

    /// Change the armed set. Arming a previously unarmed direction installs
    /// the demuxer event; disarming releases it.
    fn modify(&self, obj: &Arc<dyn EventObject>, events: EventMask) -> bool;

    /// Release both directions and drop the entry. Idempotent.
    fn unregister(&self, obj: &Arc<dyn EventObject>);

    /// Run one bounded iteration: wait up to an internal ceiling (at most
    /// 10 ms) for events, dispatch everything that is ready, expire due
    /// timers. Never blocks indefinitely, even with no fds registered.
    fn poll(&self) -> bool;

    /// Install a repeating timer under the caller-supplied id. The minimum
    /// effective period is 1 ms.
    fn schedule_repeatedly(&self, id: TimerId, period: Duration, f: Box<dyn FnMut() + Send>);

    /// Install a one-shot timer under the caller-supplied id. The timer is
    /// removed from the table before its callback runs.
    fn schedule_later(&self, id: TimerId, delay: Duration, f: Box<dyn FnOnce() + Send>);

    /// Remove a timer; returns whether it was present.
    fn cancel(&self, id: TimerId) -> bool;
}
