//! Deterministic arena allocator for the real-time server.
//!
//! One fixed region is carved at startup and never grows. Blocks form an
//! address-ordered doubly linked chain; free blocks additionally sit on one
//! of 31 power-of-two size-class lists. Allocation rounds the request up to
//! 8-byte alignment, takes the first fitting block from the smallest
//! adequate class and splits off the tail when the remainder is worth at
//! least a header plus 8 bytes. Freeing coalesces with both address-adjacent
//! neighbors immediately, so a fully drained arena always collapses back to
//! one block. Every mutation happens under a single lock and never touches
//! the general-purpose heap, which keeps worst-case latency bounded.
//!
//! Each block is accounted with a [`BLOCK_HEADER`]-byte header, so the sum
//! of all block lengths plus headers always equals the arena capacity.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

/// Per-block bookkeeping overhead, accounted in the arena arithmetic.
pub const BLOCK_HEADER: usize = 32;

const ALIGN: usize = 8;
const NUM_CLASSES: usize = 31;
/// A split must leave the tail at least this many usable bytes.
const MIN_SPLIT: usize = 8;

struct Block {
    /// Start of the usable bytes, past the accounted header.
    offset: usize,
    /// Usable length.
    len: usize,
    free: bool,
    prev: Option<usize>,
    next: Option<usize>,
    free_prev: Option<usize>,
    free_next: Option<usize>,
}

struct ArenaState {
    blocks: Vec<Block>,
    recycled: Vec<usize>,
    free_lists: [Option<usize>; NUM_CLASSES],
}

struct ArenaInner {
    base: NonNull<u8>,
    capacity: usize,
    layout: Layout,
    state: Mutex<ArenaState>,
}

unsafe impl Send for ArenaInner {}
unsafe impl Sync for ArenaInner {}

impl Drop for ArenaInner {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// Handle to the shared arena. Cloning is cheap and shares the region.
#[derive(Clone)]
pub struct RtArena {
    inner: Arc<ArenaInner>,
}

/// An allocation. Dereferences to its byte slice; freed on drop.
pub struct RtBuf {
    inner: Arc<ArenaInner>,
    block: usize,
    offset: usize,
    len: usize,
}

unsafe impl Send for RtBuf {}
unsafe impl Sync for RtBuf {}

impl Deref for RtBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // The allocator hands out disjoint offset ranges, and the block
        // stays reserved until this value drops.
        unsafe {
            std::slice::from_raw_parts(self.inner.base.as_ptr().add(self.offset), self.len)
        }
    }
}

impl DerefMut for RtBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.inner.base.as_ptr().add(self.offset), self.len)
        }
    }
}

impl Drop for RtBuf {
    fn drop(&mut self) {
        self.inner.free(self.block);
    }
}

impl RtBuf {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl RtArena {
    /// Carve an arena of `capacity` bytes. The capacity is rounded up to
    /// hold at least one header plus one aligned allocation.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(BLOCK_HEADER + ALIGN);
        let capacity = (capacity + ALIGN - 1) & !(ALIGN - 1);
        // Alignment and size are both nonzero and valid here.
        let layout = Layout::from_size_align(capacity, ALIGN)
            .unwrap_or_else(|_| Layout::new::<u8>());
        let base = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(base).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));

        let mut state = ArenaState {
            blocks: Vec::new(),
            recycled: Vec::new(),
            free_lists: [None; NUM_CLASSES],
        };
        state.blocks.push(Block {
            offset: BLOCK_HEADER,
            len: capacity - BLOCK_HEADER,
            free: true,
            prev: None,
            next: None,
            free_prev: None,
            free_next: None,
        });
        push_free(&mut state, 0);

        Self {
            inner: Arc::new(ArenaInner {
                base,
                capacity,
                layout,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Usable bytes currently free (headers excluded).
    pub fn free_bytes(&self) -> usize {
        let state = self.inner.state();
        state
            .blocks
            .iter()
            .enumerate()
            .filter(|(idx, block)| block.free && !state.recycled.contains(idx))
            .map(|(_, block)| block.len)
            .sum()
    }

    /// Largest single allocation that would currently succeed.
    pub fn largest_free(&self) -> usize {
        let state = self.inner.state();
        state
            .blocks
            .iter()
            .enumerate()
            .filter(|(idx, block)| block.free && !state.recycled.contains(idx))
            .map(|(_, block)| block.len)
            .max()
            .unwrap_or(0)
    }

    /// Allocate `size` usable bytes, zero-initialized at arena creation but
    /// not re-zeroed on reuse. `None` when no block fits.
    pub fn alloc(&self, size: usize) -> Option<RtBuf> {
        let size = align_up(size.max(1));
        let mut state = self.inner.state();

        let block = fetch_free(&mut state, size)?;
        unlink_free(&mut state, block);
        state.blocks[block].free = false;

        // Split the tail off when it can hold its own header and something.
        if state.blocks[block].len >= size + BLOCK_HEADER + MIN_SPLIT {
            let tail_offset = state.blocks[block].offset + size + BLOCK_HEADER;
            let tail_len = state.blocks[block].len - size - BLOCK_HEADER;
            state.blocks[block].len = size;

            let next = state.blocks[block].next;
            let tail = new_block(
                &mut state,
                Block {
                    offset: tail_offset,
                    len: tail_len,
                    free: true,
                    prev: Some(block),
                    next,
                    free_prev: None,
                    free_next: None,
                },
            );
            if let Some(next) = next {
                state.blocks[next].prev = Some(tail);
            }
            state.blocks[block].next = Some(tail);
            push_free(&mut state, tail);
        }

        let offset = state.blocks[block].offset;
        let len = state.blocks[block].len;
        drop(state);
        Some(RtBuf {
            inner: Arc::clone(&self.inner),
            block,
            offset,
            len,
        })
    }
}

impl ArenaInner {
    fn state(&self) -> MutexGuard<'_, ArenaState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn free(&self, block: usize) {
        let mut state = self.state();
        state.blocks[block].free = true;
        let mut keep = block;

        // Coalesce with the previous neighbor first, then the next, so at
        // most one chain walk happens per merge.
        if let Some(prev) = state.blocks[keep].prev {
            if state.blocks[prev].free {
                unlink_free(&mut state, prev);
                merge_next_into(&mut state, prev);
                keep = prev;
            }
        }
        if let Some(next) = state.blocks[keep].next {
            if state.blocks[next].free {
                unlink_free(&mut state, next);
                merge_next_into(&mut state, keep);
            }
        }
        push_free(&mut state, keep);
    }
}

fn align_up(size: usize) -> usize {
    (size + ALIGN - 1) & !(ALIGN - 1)
}

/// Class for storing a free block: smallest x with len <= 2^(x+1).
fn store_class(len: usize) -> usize {
    for class in 0..NUM_CLASSES {
        if len <= 1usize << (class + 1) {
            return class;
        }
    }
    NUM_CLASSES - 1
}


fn new_block(state: &mut ArenaState, block: Block) -> usize {
    if let Some(idx) = state.recycled.pop() {
        state.blocks[idx] = block;
        idx
    } else {
        state.blocks.push(block);
        state.blocks.len() - 1
    }
}

fn push_free(state: &mut ArenaState, idx: usize) {
    let class = store_class(state.blocks[idx].len);
    let head = state.free_lists[class];
    state.blocks[idx].free_prev = None;
    state.blocks[idx].free_next = head;
    if let Some(head) = head {
        state.blocks[head].free_prev = Some(idx);
    }
    state.free_lists[class] = Some(idx);
}

fn unlink_free(state: &mut ArenaState, idx: usize) {
    let class = store_class(state.blocks[idx].len);
    let (free_prev, free_next) = (state.blocks[idx].free_prev, state.blocks[idx].free_next);
    match free_prev {
        Some(prev) => state.blocks[prev].free_next = free_next,
        None => state.free_lists[class] = free_next,
    }
    if let Some(next) = free_next {
        state.blocks[next].free_prev = free_prev;
    }
    state.blocks[idx].free_prev = None;
    state.blocks[idx].free_next = None;
}

/// Scan upward from the class a block of exactly `size` bytes would be
/// stored in. That class can hold blocks slightly smaller than `size`, so
/// the length check per block stays load-bearing.
fn fetch_free(state: &mut ArenaState, size: usize) -> Option<usize> {
    for class in store_class(size)..NUM_CLASSES {
        let mut cursor = state.free_lists[class];
        while let Some(idx) = cursor {
            if state.blocks[idx].len >= size {
                return Some(idx);
            }
            cursor = state.blocks[idx].free_next;
        }
    }
    None
}

/// Absorb `at`'s next neighbor, header included, recycling its slab slot.
fn merge_next_into(state: &mut ArenaState, at: usize) {
    let Some(next) = state.blocks[at].next else {
        return;
    };
    let absorbed = state.blocks[next].len + BLOCK_HEADER;
    let after = state.blocks[next].next;
    state.blocks[at].len += absorbed;
    state.blocks[at].next = after;
    if let Some(after) = after {
        state.blocks[after].prev = Some(at);
    }
    state.recycled.push(next);
}
