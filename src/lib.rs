//! A deferred-execution event queue over a caller-provided (or self-allocated) byte buffer.
//!
//! An [EventQueue] carves fixed-lifetime chunks out of a slab-plus-freelist allocator, links
//! posted events into a deadline-sorted intrusive timer queue, and exposes a single [dispatch]
//! entry point that fires due callbacks with no lock held, rearms periodic events, and retires
//! everything else. Handles are generation-checked, so cancelling a handle whose chunk has
//! already been reused for something else is always a safe no-op rather than a use-after-free.
//!
//! No allocation happens past construction time beyond the one buffer (or the caller's own, via
//! [EventQueue::create_inplace]) -- every `alloc`/`dealloc`/`post`/`cancel` call only ever moves
//! chunks between the slab cursor, the freelist, and the timer queue.
//!
//! [dispatch]: EventQueue::dispatch

mod allocator;
mod clock;
mod error;
mod handle;
mod header;
mod queue;
mod signal;
mod timer_queue;

pub use clock::{Clock, ManualClock, SystemClock, Tick};
pub use error::{CreateError, Result};
pub use handle::EventId;
pub use queue::{EventQueue, EventQueueBuilder};
