//! The per-event header stored at the front of every chunk, and the raw pointer arithmetic used
//! to reach it.
//!
//! Rather than the intrusive raw-pointer linked lists the original C uses (and rather than the
//! back-pointer-as-raw-pointer `ref` field it keeps for O(1) unqueueing), links here are buffer
//! offsets relative to the queue's own base pointer. This is the same move
//! `audio_synchronization::concurrent_slab` and `fixed_size_pool` make for their own freelists
//! (`OptionalAtomicU32` next-pointers into a `Vec`, not raw pointers) -- an arena indexed by a
//! plain integer is both safe to construct without `unsafe` blocks scattered everywhere and, for
//! a buffer this crate doesn't own the lifetime of on the borrowed-buffer path, the only option.

use std::ptr::NonNull;

use crate::clock::Tick;

/// What a chunk is doing right now. Replaces the original's sign-negation-of-`id` trick with an
/// explicit state enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventState {
    /// Sitting on the allocator's freelist (or never yet carved from the slab).
    Free,
    /// Handed to the caller by `alloc`, not yet posted.
    Allocated,
    /// Linked into the timer queue, waiting for its deadline.
    Queued,
    /// Detached from the timer queue by the dispatcher; its callback may be running right now.
    InFlight,
}

/// Identifies the slot whose link field names a given event -- i.e. a safe stand-in for a raw
/// `ref` back-pointer, made safe by naming the *slot* instead of holding a raw pointer into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefSlot {
    /// The queue head pointer itself names this event.
    QueueHead,
    /// The event at this offset's `next` field names this event.
    Next(u32),
    /// The event at this offset's `sibling` field names this event.
    Sibling(u32),
}

/// The header occupying the first `size_of::<EventHeader>()` bytes of every chunk. The caller's
/// payload begins immediately after it.
#[repr(C)]
pub(crate) struct EventHeader {
    /// Total chunk size in bytes, header included, rounded up to a word multiple. Fixed for the
    /// lifetime of the chunk regardless of how many times it is reused.
    pub(crate) chunk_size: u32,
    /// Bumped (wrapping) every time this chunk is retired (cancelled-while-queued or fired and
    /// not rearmed). Never bumped by `alloc` reusing a freed chunk.
    pub(crate) generation: u32,
    pub(crate) state: EventState,
    /// Absolute deadline tick, valid only while `state == Queued` or `InFlight`.
    pub(crate) target: Tick,
    /// Configured delay in milliseconds. Holds the caller-requested delay before `post`; ignored
    /// afterward (the absolute deadline is what matters once queued).
    pub(crate) delay_ms: i32,
    /// Configured period in milliseconds, or `-1` for one-shot. `post`-time `cancel` forces this
    /// to `-1` to suppress rearming a cancelled periodic event.
    pub(crate) period_ms: i32,
    pub(crate) cb: Option<fn(*mut u8)>,
    pub(crate) dtor: Option<fn(*mut u8)>,
    /// Freelist: next chunk in the same size bucket, or next larger bucket. Timer queue: next
    /// due-order bucket, or (mid-bucket during dispatch) the next event in dispatch order.
    pub(crate) next: Option<u32>,
    /// Freelist: next chunk sharing this exact size, LIFO. Timer queue: next sibling posted at
    /// the same deadline, LIFO (dispatch reverses this to FIFO).
    pub(crate) sibling: Option<u32>,
    /// Who points at me -- `None` unless `state == Queued`.
    pub(crate) link: Option<RefSlot>,
}

/// Number of bytes one word occupies on this platform; also the alignment every chunk (and thus
/// `EventHeader`) must honor.
pub(crate) const WORD: usize = std::mem::size_of::<usize>();

pub(crate) fn total_chunk_size(payload_size: usize) -> usize {
    let raw = std::mem::size_of::<EventHeader>() + payload_size;
    (raw + WORD - 1) & !(WORD - 1)
}

/// # Safety
/// `base` must point to a live buffer of at least `offset + size_of::<EventHeader>()` bytes,
/// word-aligned, and `offset` must be a previously-handed-out chunk offset (or `0` on an empty
/// queue reading the slab for the first time).
#[inline]
pub(crate) unsafe fn header_at<'a>(base: NonNull<u8>, offset: u32) -> &'a mut EventHeader {
    &mut *(base.as_ptr().add(offset as usize) as *mut EventHeader)
}

/// # Safety
/// Same preconditions as [header_at].
#[inline]
pub(crate) unsafe fn payload_ptr(base: NonNull<u8>, offset: u32) -> *mut u8 {
    base.as_ptr()
        .add(offset as usize)
        .add(std::mem::size_of::<EventHeader>())
}
