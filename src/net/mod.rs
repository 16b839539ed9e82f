//! TCP layer: buffered connections and listeners on top of the event loop.

mod buffer;
mod connection;
mod listener;

pub use connection::{ConnState, TcpConnection};
pub use listener::TcpListener;

use crate::event_loop::LoopHandle;
use std::sync::Arc;

/// Called once per connection after it becomes usable, on the connection's
/// loop thread.
pub type NewConnCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Called with the contiguous unread input prefix. Return the number of
/// bytes consumed, `0` to wait for more data, or a negative value to abort
/// the connection.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &[u8]) -> isize + Send + Sync>;

/// Called once on the Connected → Disconnected transition.
pub type DisconnectCallback = Box<dyn FnOnce(&Arc<TcpConnection>) + Send>;

/// Called once when an outbound connect fails.
pub type ConnFailCallback = Box<dyn FnOnce(&LoopHandle, &str, u16) + Send>;

/// Picks the loop that will drive a freshly accepted connection.
pub type LoopSelector = Box<dyn Fn() -> LoopHandle + Send + Sync>;
