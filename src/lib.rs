//! eddy-net: event-driven networking core for a Redis-compatible server.
//!
//! This crate provides the reactor substrate that higher layers (command
//! dispatch, storage, replication) build on: single-threaded event loops
//! that multiplex socket I/O, timers, and cross-thread tasks, plus buffered
//! TCP connection and listener objects with an explicit lifecycle.
//!
//! # Architecture
//!
//! - One [`EventLoop`] per thread, woken through a self-pipe notifier
//! - mio-based [`reactor::PollReactor`] behind a pluggable [`Reactor`] trait
//! - Connections shared cooperatively via `Arc`, with weak projections for
//!   supervisors that must not prolong their life
//! - Payload-agnostic: framing belongs to the message callback

/// Configuration for the demo binary
pub mod config;

/// Error types and result aliases
pub mod error;

/// The event loop, its thread-safe handle, and task futures
pub mod event_loop;

/// TCP connections and listeners
pub mod net;

mod notifier;

/// Event demultiplexing and timers
pub mod reactor;

pub use config::Config;
pub use error::{Error, Result};
pub use event_loop::{EventLoop, LoopHandle, TaskFuture};
pub use net::{ConnState, TcpConnection, TcpListener};
pub use reactor::{
    EventMask, EventObject, Reactor, TimerId, EVENT_NONE, EVENT_READ, EVENT_WRITE,
};
