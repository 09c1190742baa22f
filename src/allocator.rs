//! The chunk allocator: a slab cursor plus a size-ascending freelist, guarded by `memlock`.
//!
//! Grounded on the allocation half of `audio_synchronization::fixed_size_pool::FixedSizePool`
//! and `concurrent_slab::SlabState` -- both keep a `Vec`/buffer of elements plus an
//! offset-linked freelist rather than a general-purpose allocator, because (like this queue) they
//! never need to split or coalesce: every chunk a given allocation might reuse was already sized
//! for some earlier request, and the freelist's ascending-size, equal-size-bucketed shape is
//! exactly the linear best-fit scan this allocator performs against its own freelist.

use std::ptr::NonNull;

use crate::header::{header_at, total_chunk_size, EventHeader, EventState};

/// State behind `memlock`. Never touched while `queuelock` is held.
pub(crate) struct AllocatorState {
    slab_offset: u32,
    slab_remaining: u32,
    freelist_head: Option<u32>,
}

impl AllocatorState {
    pub(crate) fn new(capacity: u32) -> Self {
        Self {
            slab_offset: 0,
            slab_remaining: capacity,
            freelist_head: None,
        }
    }
}

/// Best-fit-via-linear-scan against the freelist; falls back to bump-allocating from the slab
/// tail. Returns the chunk's offset, with its header already initialized and `state` set to
/// `Allocated`.
///
/// # Safety
/// `base` must point to the buffer `state` was built against.
pub(crate) unsafe fn alloc_chunk(
    base: NonNull<u8>,
    state: &mut AllocatorState,
    payload_size: usize,
) -> Option<u32> {
    let needed = total_chunk_size(payload_size) as u32;

    let mut prev: Option<u32> = None;
    let mut cur = state.freelist_head;
    while let Some(off) = cur {
        let hdr = header_at(base, off);
        if hdr.chunk_size >= needed {
            let replacement = hdr.sibling.take();
            if let Some(sib_off) = replacement {
                header_at(base, sib_off).next = hdr.next;
            }
            let next_link = replacement.or(hdr.next);
            match prev {
                None => state.freelist_head = next_link,
                Some(p) => header_at(base, p).next = next_link,
            }
            let hdr = header_at(base, off);
            hdr.next = None;
            hdr.sibling = None;
            hdr.state = EventState::Allocated;
            hdr.delay_ms = 0;
            hdr.period_ms = -1;
            hdr.cb = None;
            hdr.dtor = None;
            return Some(off);
        }
        prev = Some(off);
        cur = hdr.next;
    }

    if state.slab_remaining < needed {
        log::trace!(
            "allocation of {payload_size} bytes failed: slab exhausted ({} bytes remaining)",
            state.slab_remaining
        );
        return None;
    }

    let offset = state.slab_offset;
    state.slab_offset += needed;
    state.slab_remaining -= needed;

    let hdr = header_at(base, offset);
    *hdr = EventHeader {
        chunk_size: needed,
        generation: 0,
        state: EventState::Allocated,
        target: 0,
        delay_ms: 0,
        period_ms: -1,
        cb: None,
        dtor: None,
        next: None,
        sibling: None,
        link: None,
    };
    Some(offset)
}

/// Returns a chunk to the freelist, keeping the list in ascending-`chunk_size` order with
/// equal-size chunks stacked via `sibling`. Does not invoke the destructor; callers owning a
/// user-visible chunk (as opposed to internal reuse) are responsible for that first.
///
/// # Safety
/// Same preconditions as [alloc_chunk]; `offset` must name a chunk not already on the freelist.
pub(crate) unsafe fn free_chunk(base: NonNull<u8>, state: &mut AllocatorState, offset: u32) {
    let size = header_at(base, offset).chunk_size;

    let mut prev: Option<u32> = None;
    let mut cur = state.freelist_head;
    while let Some(off) = cur {
        if header_at(base, off).chunk_size >= size {
            break;
        }
        prev = Some(off);
        cur = header_at(base, off).next;
    }

    let hdr = header_at(base, offset);
    hdr.state = EventState::Free;
    hdr.link = None;

    if let Some(off) = cur {
        if header_at(base, off).chunk_size == size {
            let hdr = header_at(base, offset);
            hdr.sibling = Some(off);
            hdr.next = header_at(base, off).next;
            match prev {
                None => state.freelist_head = Some(offset),
                Some(p) => header_at(base, p).next = Some(offset),
            }
            return;
        }
    }

    let hdr = header_at(base, offset);
    hdr.sibling = None;
    hdr.next = cur;
    match prev {
        None => state.freelist_head = Some(offset),
        Some(p) => header_at(base, p).next = Some(offset),
    }
}
