//! The dispatcher's wakeup primitive.
//!
//! Exactly one thread drives `dispatch` on a given queue at a time, and any number of other
//! threads may signal it without blocking. That is precisely the contract
//! `audio_synchronization::mpsc_counter::MpscCounter`
//! already implements (its own doc comment: "only the first thread which waits on the counter...
//! may wait on it"), so `DispatchSignal` keeps that single-designated-waiter precondition and the
//! same non-blocking park/unpark mechanics, trimmed to what a counting semaphore needs: a count
//! of pending wakeups and a wait that can time out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

pub(crate) struct DispatchSignal {
    count: AtomicU64,
    waiter: Mutex<Option<Thread>>,
}

impl DispatchSignal {
    pub(crate) fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            waiter: Mutex::new(None),
        }
    }

    /// Bump the signal count and wake the designated waiter if it's parked. Never blocks; may be
    /// called from any thread, any number of times.
    pub(crate) fn signal(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
        if let Some(t) = self.waiter.lock().unwrap().as_ref() {
            t.unpark();
        }
    }

    /// Block the calling thread until a pending signal is available or `timeout` elapses.
    /// `timeout == None` waits indefinitely. Returns `true` if a signal was consumed, `false` on
    /// timeout. Only one thread may ever call `wait` on a given `DispatchSignal` over its
    /// lifetime; a second caller from a different thread panics, matching the precondition this
    /// is ported from.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
        let me = thread::current();
        {
            let mut guard = self.waiter.lock().unwrap();
            match guard.as_ref() {
                None => *guard = Some(me.clone()),
                Some(t) => assert_eq!(
                    t.id(),
                    me.id(),
                    "DispatchSignal may only be waited on by a single designated thread"
                ),
            }
        }

        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            let consumed = self
                .count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                    if c > 0 {
                        Some(c - 1)
                    } else {
                        None
                    }
                })
                .is_ok();
            if consumed {
                return true;
            }
            match deadline {
                None => thread::park(),
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return false;
                    }
                    thread::park_timeout(dl - now);
                }
            }
        }
    }
}
