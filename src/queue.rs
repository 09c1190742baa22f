//! The public `EventQueue` type: construction, allocation, posting, cancellation, and the
//! dispatcher loop. This is the module that ties the allocator, timer queue, clock, and wakeup
//! signal together into a single `Queue` object.

use std::ptr::NonNull;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::allocator::{alloc_chunk, free_chunk, AllocatorState};
use crate::clock::{Clock, SystemClock};
use crate::error::CreateError;
use crate::handle::EventId;
use crate::header::{header_at, payload_ptr, total_chunk_size, EventState, WORD};
use crate::signal::DispatchSignal;
use crate::timer_queue::{self, QueueState};

/// Where the queue's backing bytes actually live. Kept only so the allocation (if any) is
/// dropped along with the queue; every read/write goes through `EventQueue::base` instead. This
/// is the same "roots exist purely to free on drop" shape
/// `audio_synchronization::concurrent_slab::SlabVecs::roots` uses for its own backing allocations.
enum Storage<'a> {
    Owned(Box<[u64]>),
    Borrowed(&'a mut [u8]),
}

/// A deferred-execution event queue living inside a fixed byte buffer, either owned by the queue
/// itself or borrowed from the caller.
///
/// Construct with [EventQueue::create], [EventQueue::create_inplace], or [EventQueue::builder].
pub struct EventQueue<'a> {
    storage: Storage<'a>,
    base: NonNull<u8>,
    memlock: Mutex<AllocatorState>,
    queuelock: Mutex<QueueState>,
    clock: Box<dyn Clock>,
    signal: DispatchSignal,
}

// SAFETY: all access to `base` goes through `memlock`/`queuelock`; nothing reads or writes the
// buffer without holding the relevant lock.
unsafe impl<'a> Send for EventQueue<'a> {}
unsafe impl<'a> Sync for EventQueue<'a> {}

impl EventQueue<'static> {
    /// Allocate a fresh, queue-owned buffer of (at least) `size` bytes.
    pub fn create(size: usize) -> Result<EventQueue<'static>, CreateError> {
        EventQueue::builder().build(size)
    }
}

impl<'a> EventQueue<'a> {
    /// Build a queue inside a caller-provided buffer instead of allocating one.
    pub fn create_inplace(buffer: &'a mut [u8]) -> Result<EventQueue<'a>, CreateError> {
        EventQueue::builder().build_inplace(buffer)
    }

    pub fn builder() -> EventQueueBuilder {
        EventQueueBuilder::new()
    }

    /// Carve a chunk large enough for `payload_size` bytes out of the slab or freelist. Returns
    /// `None` if the buffer has no room left; this is an expected, non-exceptional outcome, not
    /// an error.
    pub fn alloc(&self, payload_size: usize) -> Option<NonNull<u8>> {
        let mut state = self.memlock.lock().unwrap();
        let offset = unsafe { alloc_chunk(self.base, &mut state, payload_size) }?;
        drop(state);
        Some(unsafe { NonNull::new_unchecked(payload_ptr(self.base, offset)) })
    }

    /// Release a chunk that was never posted (or has already been retired by the dispatcher and
    /// handed back to the caller some other way). Runs the destructor, if one was configured.
    pub fn dealloc(&self, payload: NonNull<u8>) {
        let offset = self.offset_of(payload);
        self.dealloc_chunk(offset);
    }

    /// Configure how long after `post` this event should first fire, in milliseconds. A negative
    /// delay means "never": `post` deallocates the event immediately and hands back
    /// `EventId::NONE`.
    pub fn event_delay(&self, payload: NonNull<u8>, ms: i32) {
        let offset = self.offset_of(payload);
        unsafe { header_at(self.base, offset).delay_ms = ms };
    }

    /// Configure a repeat period in milliseconds, or `-1` (the default) for a one-shot event.
    pub fn event_period(&self, payload: NonNull<u8>, ms: i32) {
        let offset = self.offset_of(payload);
        unsafe { header_at(self.base, offset).period_ms = ms };
    }

    /// Configure a destructor, run at most once, whenever this chunk is finally retired
    /// (cancelled, fired-and-not-rearmed, or explicitly dealloc'd).
    pub fn event_dtor(&self, payload: NonNull<u8>, dtor: fn(*mut u8)) {
        let offset = self.offset_of(payload);
        unsafe { header_at(self.base, offset).dtor = Some(dtor) };
    }

    /// Hand the event to the dispatcher: configures its callback and links it into the timer
    /// queue at `now + delay`. Returns the handle `cancel` accepts, or `EventId::NONE` if the
    /// configured delay was negative (in which case the event was deallocated immediately instead
    /// of being queued).
    pub fn post(&self, payload: NonNull<u8>, cb: fn(*mut u8)) -> EventId {
        let offset = self.offset_of(payload);
        let (delay, generation) = unsafe {
            let hdr = header_at(self.base, offset);
            hdr.cb = Some(cb);
            (hdr.delay_ms, hdr.generation)
        };

        if delay < 0 {
            self.dealloc_chunk(offset);
            return EventId::NONE;
        }

        let now = self.clock.now();
        {
            let mut state = self.queuelock.lock().unwrap();
            unsafe { timer_queue::enqueue(self.base, &mut state, offset, now, delay as u32) };
        }
        self.signal.signal();
        EventId::new(generation, offset)
    }

    /// Cancel a previously posted event. A no-op if the handle is stale -- already fired and not
    /// periodic, already cancelled, or simply `EventId::NONE`. Cancelling an event whose callback
    /// is running right now (on the dispatcher thread) suppresses its destructor-visible rearm:
    /// the callback that is already executing is not interrupted, but it will not be rescheduled
    /// and its destructor will run once the dispatcher retires it.
    pub fn cancel(&self, id: EventId) {
        let Some((generation, offset)) = id.decode() else {
            return;
        };

        let mut retire = false;
        {
            let mut state = self.queuelock.lock().unwrap();
            let hdr = unsafe { header_at(self.base, offset) };
            match hdr.state {
                EventState::InFlight if hdr.generation == generation => {
                    hdr.cb = None;
                    hdr.period_ms = -1;
                    log::trace!("cancelled in-flight event at offset {offset}");
                }
                EventState::Queued if hdr.generation == generation => {
                    unsafe { timer_queue::unlink(self.base, &mut state, offset) };
                    hdr.generation = hdr.generation.wrapping_add(1);
                    hdr.state = EventState::Free;
                    retire = true;
                }
                _ => {
                    log::trace!("cancel called with a stale or unknown handle (offset {offset})");
                }
            }
        }
        if retire {
            self.dealloc_chunk(offset);
        }
    }

    /// Ask a running (possibly concurrently-called-from-another-thread) `dispatch` to return as
    /// soon as it finishes its current pass, rather than waiting out its timeout.
    pub fn request_break(&self) {
        {
            let mut state = self.queuelock.lock().unwrap();
            state.request_break();
        }
        self.signal.signal();
    }

    /// Run the dispatcher: drain and fire every due event, rearm periodic ones, retire the rest,
    /// then sleep until the next deadline (or until signalled by `post`/`cancel`/`request_break`
    /// on another thread). Returns once `timeout` elapses (`None` means "run until a break is
    /// requested") or a break is consumed.
    ///
    /// Exactly one thread may call `dispatch` on a given queue at a time; see
    /// [crate::signal::DispatchSignal].
    pub fn dispatch(&self, timeout: Option<Duration>) {
        let absolute_deadline = timeout.map(|d| Instant::now() + d);

        loop {
            let (should_break, next_deadline_ms) = self.dispatch_once();
            if should_break {
                return;
            }

            let remaining = absolute_deadline.map(|dl| {
                let now = Instant::now();
                if now >= dl {
                    Duration::ZERO
                } else {
                    dl - now
                }
            });
            if remaining == Some(Duration::ZERO) {
                return;
            }

            let wait_for = match (next_deadline_ms, remaining) {
                (None, None) => None,
                (None, Some(rem)) => Some(rem),
                (Some(ms), None) => Some(Duration::from_millis(ms.max(0) as u64)),
                (Some(ms), Some(rem)) => Some(Duration::from_millis(ms.max(0) as u64).min(rem)),
            };

            self.signal.wait(wait_for);
        }
    }

    /// One pass: drain due events, fire them with no lock held, rearm or retire each. Returns
    /// whether a break was consumed, and the number of milliseconds until the next pending
    /// deadline (`None` if the queue is now empty).
    fn dispatch_once(&self) -> (bool, Option<i32>) {
        let now = self.clock.now();
        let (due, next_deadline_ms) = {
            let mut state = self.queuelock.lock().unwrap();
            unsafe { timer_queue::drain_due(self.base, &mut state, now) }
        };

        let mut fired = Vec::with_capacity(due.len());
        for offset in due {
            let cb = unsafe { header_at(self.base, offset).cb };
            if let Some(f) = cb {
                f(unsafe { payload_ptr(self.base, offset) });
            }
            fired.push((offset, cb.is_some()));
        }

        for (offset, cb_was_called) in fired {
            let period = unsafe { header_at(self.base, offset).period_ms };
            if period >= 0 && cb_was_called {
                let now = self.clock.now();
                {
                    let mut state = self.queuelock.lock().unwrap();
                    unsafe {
                        timer_queue::enqueue(self.base, &mut state, offset, now, period as u32)
                    };
                }
                self.signal.signal();
                log::trace!("rearmed periodic event at offset {offset}");
            } else {
                unsafe {
                    let hdr = header_at(self.base, offset);
                    hdr.generation = hdr.generation.wrapping_add(1);
                    hdr.state = EventState::Free;
                }
                self.dealloc_chunk(offset);
            }
        }

        let should_break = {
            let mut state = self.queuelock.lock().unwrap();
            state.consume_break()
        };
        if should_break {
            log::debug!("dispatch loop consumed a break request");
        }

        (should_break, next_deadline_ms)
    }

    fn dealloc_chunk(&self, offset: u32) {
        unsafe {
            let hdr = header_at(self.base, offset);
            if let Some(dtor) = hdr.dtor.take() {
                dtor(payload_ptr(self.base, offset));
            }
        }
        let mut state = self.memlock.lock().unwrap();
        unsafe { free_chunk(self.base, &mut state, offset) };
    }

    fn offset_of(&self, payload: NonNull<u8>) -> u32 {
        let header_size = std::mem::size_of::<crate::header::EventHeader>();
        (payload.as_ptr() as usize - header_size - self.base.as_ptr() as usize) as u32
    }
}

impl<'a> Drop for EventQueue<'a> {
    /// Runs destructors for every event still sitting in the timer queue, mirroring the original
    /// `equeue_destroy`'s walk over pending events. In-flight events (mid-callback on some other
    /// thread's `dispatch` call) are not reachable here: dropping a queue implies no other
    /// reference to it survives, and `dispatch` only runs while a `&self` borrow is live.
    fn drop(&mut self) {
        let state = self.queuelock.get_mut().unwrap();
        let mut bucket = state.head();
        while let Some(head) = bucket {
            let mut sibling = Some(head);
            while let Some(offset) = sibling {
                let hdr = unsafe { header_at(self.base, offset) };
                if let Some(dtor) = hdr.dtor.take() {
                    dtor(unsafe { payload_ptr(self.base, offset) });
                }
                sibling = hdr.sibling;
            }
            bucket = unsafe { header_at(self.base, head).next };
        }
    }
}

/// Builder for [EventQueue], used to inject a non-default [Clock] (needed for deterministic
/// wraparound testing, and useful to embedded callers with a hardware tick source).
pub struct EventQueueBuilder {
    clock: Option<Box<dyn Clock>>,
}

impl EventQueueBuilder {
    fn new() -> Self {
        Self { clock: None }
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Box::new(clock));
        self
    }

    /// Allocate an owned buffer of at least `size` bytes and build the queue inside it.
    pub fn build(self, size: usize) -> Result<EventQueue<'static>, CreateError> {
        let words = (size + WORD - 1) / WORD;
        let mut storage = vec![0u64; words.max(1)].into_boxed_slice();
        let capacity = (storage.len() * WORD) as u32;
        let needed = total_chunk_size(0);
        if (capacity as usize) < needed {
            return Err(CreateError::BufferTooSmall { size, needed });
        }

        let base = NonNull::new(storage.as_mut_ptr() as *mut u8).unwrap();
        Ok(EventQueue {
            storage: Storage::Owned(storage),
            base,
            memlock: Mutex::new(AllocatorState::new(capacity)),
            queuelock: Mutex::new(QueueState::new()),
            clock: self.clock.unwrap_or_else(|| Box::new(SystemClock::new())),
            signal: DispatchSignal::new(),
        })
    }

    /// Build the queue inside `buffer` rather than allocating. `buffer` must be aligned to a
    /// word boundary and large enough to hold at least one zero-payload chunk.
    pub fn build_inplace<'a>(self, buffer: &'a mut [u8]) -> Result<EventQueue<'a>, CreateError> {
        if (buffer.as_ptr() as usize) % WORD != 0 {
            return Err(CreateError::BufferMisaligned { required: WORD });
        }
        let needed = total_chunk_size(0);
        if buffer.len() < needed {
            return Err(CreateError::BufferTooSmall {
                size: buffer.len(),
                needed,
            });
        }

        let capacity = buffer.len() as u32;
        let base = NonNull::new(buffer.as_mut_ptr()).unwrap();
        Ok(EventQueue {
            storage: Storage::Borrowed(buffer),
            base,
            memlock: Mutex::new(AllocatorState::new(capacity)),
            queuelock: Mutex::new(QueueState::new()),
            clock: self.clock.unwrap_or_else(|| Box::new(SystemClock::new())),
            signal: DispatchSignal::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Drop-accounting test helper, ported in spirit from
    /// `audio_synchronization`'s `eye_dropper` crate: a global counter bumped by a
    /// `fn(*mut u8)` destructor, so tests can assert a destructor ran exactly once without
    /// threading a closure through a raw C function pointer.
    mod drop_tracker {
        use std::sync::atomic::{AtomicUsize, Ordering};

        pub static DROPS: AtomicUsize = AtomicUsize::new(0);

        pub fn reset() {
            DROPS.store(0, Ordering::SeqCst);
        }

        pub fn count() -> usize {
            DROPS.load(Ordering::SeqCst)
        }

        pub fn dtor(_payload: *mut u8) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn noop_cb(_payload: *mut u8) {}

    #[test]
    fn create_rejects_too_small_buffer() {
        let err = EventQueue::create(0).unwrap_err();
        assert!(matches!(err, CreateError::BufferTooSmall { .. }));
    }

    #[test]
    fn create_inplace_rejects_misaligned_buffer() {
        let mut backing = vec![0u8; 256];
        // Offset by one byte so the slice start is (almost certainly) misaligned.
        let misaligned = &mut backing[1..];
        let err = EventQueue::create_inplace(misaligned).unwrap_err();
        assert!(matches!(err, CreateError::BufferMisaligned { .. }));
    }

    #[test]
    fn alloc_dealloc_round_trip_runs_destructor_once() {
        drop_tracker::reset();
        let queue = EventQueue::create(1024).unwrap();
        let payload = queue.alloc(8).unwrap();
        queue.event_dtor(payload, drop_tracker::dtor);
        queue.dealloc(payload);
        assert_eq!(drop_tracker::count(), 1);
    }

    #[test]
    fn allocation_exhausts_and_recovers_after_dealloc() {
        let _ = env_logger::try_init();
        let queue = EventQueue::create(256).unwrap();
        let mut handles = Vec::new();
        loop {
            match queue.alloc(8) {
                Some(p) => handles.push(p),
                None => break,
            }
        }
        assert!(!handles.is_empty());
        assert!(queue.alloc(8).is_none());

        let freed = handles.pop().unwrap();
        queue.dealloc(freed);
        assert!(queue.alloc(8).is_some());
    }

    #[test]
    fn events_fire_in_delay_order() {
        static ORDER: Mutex<Vec<u32>> = Mutex::new(Vec::new());
        ORDER.lock().unwrap().clear();

        fn record<const N: u32>(_payload: *mut u8) {
            ORDER.lock().unwrap().push(N);
        }

        let queue = EventQueue::create(4096).unwrap();

        let p3 = queue.alloc(0).unwrap();
        queue.event_delay(p3, 45);
        queue.post(p3, record::<3>);

        let p1 = queue.alloc(0).unwrap();
        queue.event_delay(p1, 5);
        queue.post(p1, record::<1>);

        let p2 = queue.alloc(0).unwrap();
        queue.event_delay(p2, 25);
        queue.post(p2, record::<2>);

        queue.dispatch(Some(Duration::from_millis(200)));

        pretty_assertions::assert_eq!(*ORDER.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn equal_delay_events_fire_in_post_order() {
        static ORDER: Mutex<Vec<u32>> = Mutex::new(Vec::new());
        ORDER.lock().unwrap().clear();

        fn record<const N: u32>(_payload: *mut u8) {
            ORDER.lock().unwrap().push(N);
        }

        let queue = EventQueue::create(4096).unwrap();
        for (n, cb) in [
            (1u32, record::<1> as fn(*mut u8)),
            (2, record::<2>),
            (3, record::<3>),
        ] {
            let p = queue.alloc(0).unwrap();
            queue.event_delay(p, 10);
            queue.post(p, cb);
            let _ = n;
        }

        queue.dispatch(Some(Duration::from_millis(100)));
        pretty_assertions::assert_eq!(*ORDER.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn periodic_event_rearms_and_destructor_runs_once_cancelled() {
        let _ = env_logger::try_init();
        drop_tracker::reset();
        static FIRES: AtomicUsize = AtomicUsize::new(0);
        FIRES.store(0, Ordering::SeqCst);

        fn tick(_payload: *mut u8) {
            FIRES.fetch_add(1, Ordering::SeqCst);
        }

        let queue = Arc::new(EventQueue::create(4096).unwrap());
        let payload = queue.alloc(0).unwrap();
        queue.event_delay(payload, 5);
        queue.event_period(payload, 10);
        queue.event_dtor(payload, drop_tracker::dtor);
        let id = queue.post(payload, tick);

        let worker = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.dispatch(Some(Duration::from_millis(60))))
        };
        worker.join().unwrap();

        assert!(FIRES.load(Ordering::SeqCst) >= 2);

        // By the time dispatch() has returned, the still-live periodic event is back in the
        // Queued state (rearmed), so cancelling it here unlinks and retires it immediately.
        queue.cancel(id);
        assert_eq!(drop_tracker::count(), 1);
    }

    #[test]
    fn cancel_before_dispatch_frees_chunk_and_bumps_generation() {
        drop_tracker::reset();
        let queue = EventQueue::create(4096).unwrap();
        let payload = queue.alloc(0).unwrap();
        queue.event_delay(payload, 1000);
        queue.event_dtor(payload, drop_tracker::dtor);
        let id = queue.post(payload, noop_cb);

        queue.cancel(id);
        assert_eq!(drop_tracker::count(), 1);

        // The chunk should be back on the freelist and reusable.
        let reused = queue.alloc(0).unwrap();
        assert_eq!(reused.as_ptr(), payload.as_ptr());

        // The old handle must not affect the new occupant.
        queue.cancel(id);
        assert_eq!(drop_tracker::count(), 1);
    }

    #[test]
    fn stale_handle_cancel_is_a_silent_no_op() {
        let queue = EventQueue::create(4096).unwrap();
        queue.cancel(EventId::NONE);

        let payload = queue.alloc(0).unwrap();
        queue.event_delay(payload, 5);
        let id = queue.post(payload, noop_cb);
        queue.dispatch(Some(Duration::from_millis(30)));

        // Already fired and retired (one-shot); cancelling again must do nothing observable.
        queue.cancel(id);
    }

    #[test]
    fn request_break_stops_a_blocking_dispatch() {
        let _ = env_logger::try_init();
        let queue = Arc::new(EventQueue::create(4096).unwrap());
        let worker = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.dispatch(None))
        };

        std::thread::sleep(Duration::from_millis(20));
        queue.request_break();
        worker.join().unwrap();
    }

    #[test]
    fn wraparound_boundary_still_orders_correctly() {
        static ORDER: Mutex<Vec<u32>> = Mutex::new(Vec::new());
        ORDER.lock().unwrap().clear();

        fn record<const N: u32>(_payload: *mut u8) {
            ORDER.lock().unwrap().push(N);
        }

        // Seed the clock five ticks short of wraparound so that a 10ms delay crosses it.
        let clock = Arc::new(ManualClock::new(u32::MAX - 5));
        let queue = EventQueue::builder()
            .clock(clock.clone())
            .build(4096)
            .unwrap();

        let p1 = queue.alloc(0).unwrap();
        queue.event_delay(p1, 2); // fires just before the wrap
        queue.post(p1, record::<1>);

        let p2 = queue.alloc(0).unwrap();
        queue.event_delay(p2, 10); // fires just after the wrap
        queue.post(p2, record::<2>);

        // Drive the manual clock forward across the wraparound boundary ourselves, since this
        // queue's clock does not advance with wall time.
        for _ in 0..12 {
            clock.advance(1);
            queue.dispatch(Some(Duration::from_millis(0)));
        }

        pretty_assertions::assert_eq!(*ORDER.lock().unwrap(), vec![1, 2]);
    }
}
