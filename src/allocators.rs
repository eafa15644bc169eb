//! Allocator types: the per-heap handle and the external growth hooks.
//!
//! ## Basic Types
//!
//! ### [`Heap`](struct.Heap.html)
//!
//! A `Heap` is a single-threaded handle over a [`Context`] record embedded
//! in a caller-supplied buffer. It services `allocate` / `callocate` /
//! `reallocate` / `free` requests out of segregated free-list bins, splits
//! and eagerly coalesces chunks via their boundary tags, and can be
//! checkpointed and restored through its raw context pointer.
//!
//! ### [`HeapGrower`](trait.HeapGrower.html)
//!
//! `HeapGrower` is a simple trait interface meant to abstract over the
//! caller-side source of additional buffers. When a heap runs dry and a
//! grower is registered, the heap requests one region, adopts it, and
//! retries the allocation once.
//!
//! ### [`ToyGrower`](struct.ToyGrower.html)
//!
//! `ToyGrower` is a static array that can pretend to be an external memory
//! provider, and implements `HeapGrower` for such a purpose. It is mainly
//! useful for testing.
//!
//! ### [`LibcGrower`](struct.LibcGrower.html)
//!
//! With the `use_libc` feature, `LibcGrower` implements `HeapGrower` on top
//! of `mmap(2)`, rounding every request up to the page size.

use core::fmt;
use core::ptr::NonNull;

use log::{debug, trace};

use crate::chunklist::{
    find_bin, find_chunk, read_tag, round_up, write_inuse, Footer, FreeChunk, FreeHeader, ALIGN,
    BIN_COUNT, BIN_SIZES, BOUND_SIZE, FOOTER_SIZE, INUSE_HEADER_SIZE, INUSE_OVERHEAD,
    MIN_FREE_CHUNK,
};
use crate::context::{Context, Stats};

/// Requests at or below this size prefer the chunk produced by the most
/// recent split, so consecutive small allocations land next to each other.
const MAX_SMALL_REQUEST: usize = 256;

/// Returned by a [`HeapGrower`] that cannot (or will not) provide memory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GrowError;

/// A caller-supplied source of additional buffers, consulted when the
/// internal pool cannot serve a request.
pub trait HeapGrower {
    /// Provide a region of at least `min_size` bytes. Returns the region
    /// base and its actual size; a region smaller than `min_size` is
    /// treated as failure by the heap.
    ///
    /// # Safety
    ///
    /// The returned region must be writable, not in use by or accessible to
    /// any other program logic, and must stay valid for the lifetime of the
    /// heap. Ownership transfers to the heap; it is never handed back.
    unsafe fn grow_heap(&mut self, min_size: usize) -> Result<(NonNull<u8>, usize), GrowError>;
}

/// Round a request up to the full chunk size it needs: payload rounded to
/// the chunk alignment, plus header and footer, and never below the minimum
/// a free header requires (so the chunk can be recaptured on free).
///
/// `None` means the request is at or above the top of the bin ladder and
/// cannot be served.
fn chunk_size(size: usize) -> Option<usize> {
    if size >= BIN_SIZES[BIN_COUNT - 1] {
        return None;
    }
    let need = round_up(size, ALIGN) + INUSE_OVERHEAD;
    let need = if need < MIN_FREE_CHUNK {
        MIN_FREE_CHUNK
    } else {
        need
    };
    if need >= BIN_SIZES[BIN_COUNT - 1] {
        return None;
    }
    Some(need)
}

/// A handle over one allocator context.
///
/// The handle itself owns nothing: all state, the context record included,
/// lives inside the buffers the caller supplied. Dropping a `Heap` leaves
/// the heap intact; it can be re-entered later with
/// [`Heap::from_context`].
pub struct Heap {
    ctx: NonNull<Context>,
}

// The heap is a cursor into caller-owned buffers; it can move across
// threads as long as the buffers (and any registered grower) move with it.
unsafe impl Send for Heap {}

impl Heap {
    /// Create a heap inside `buffer`: the context record is carved from the
    /// front, the remainder is adopted for allocations.
    ///
    /// Panics if `size` cannot hold the context record.
    ///
    /// # Safety
    ///
    /// `buffer..buffer + size` must be writable memory owned by the caller
    /// for the lifetime of the heap, and not touched by anything else while
    /// the heap is live.
    pub unsafe fn init(buffer: NonNull<u8>, size: usize) -> Heap {
        Heap {
            ctx: Context::init(buffer, size),
        }
    }

    /// Re-enter a heap created earlier, from its raw context pointer.
    ///
    /// # Safety
    ///
    /// `ctx` must have been produced by [`Heap::init`] (via
    /// [`Heap::context`]) and its buffers must still be alive.
    pub unsafe fn from_context(ctx: NonNull<Context>) -> Heap {
        Heap { ctx }
    }

    /// The raw context pointer, for checkpointing and multi-heap use.
    pub fn context(&self) -> NonNull<Context> {
        self.ctx
    }

    /// Adopt another buffer for allocations. Buffers too small to carry the
    /// boundary sentinels plus one minimum free chunk are silently ignored.
    ///
    /// # Safety
    ///
    /// Same ownership contract as [`Heap::init`].
    pub unsafe fn add_buffer(&mut self, region: NonNull<u8>, size: usize) {
        Context::add_buffer(self.ctx, region, size);
    }

    /// Register (or clear) the external source of additional buffers.
    ///
    /// # Safety
    ///
    /// The grower must stay alive and unaliased for as long as it remains
    /// registered with this heap.
    pub unsafe fn set_external_alloc(&mut self, grower: Option<NonNull<dyn HeapGrower>>) {
        (*self.ctx.as_ptr()).external = grower;
    }

    /// Bytes currently sitting in free chunks.
    pub fn free_memory(&self) -> usize {
        unsafe { (*self.ctx.as_ptr()).free_memory }
    }

    /// Walk every bin and validate headers, footers, linkage, and the
    /// accounting. Returns a pointer to the first corrupted structure, or
    /// `None` when the heap is clean. Never mutates.
    pub fn check(&self) -> Option<NonNull<u8>> {
        unsafe { Context::check(self.ctx) }
    }

    /// Observe the heap shape by walking the bins.
    pub fn stats(&self) -> Stats {
        unsafe { Context::stats(self.ctx) }
    }

    /// Allocate `size` bytes. Returns the payload address, or `None` when
    /// the request cannot be served (not even by the external grower).
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let need = chunk_size(size)?;
        trace!("allocate({}) needs a {} byte chunk", size, need);

        unsafe {
            if let Some(payload) = self.try_allocate(need) {
                return Some(payload);
            }
            self.grow_and_retry(need)
        }
    }

    /// Allocate a zero-filled region for `count` elements of `size` bytes.
    pub fn callocate(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let total = count.checked_mul(size)?;
        let payload = self.allocate(total)?;
        unsafe {
            core::ptr::write_bytes(payload.as_ptr(), 0, total);
        }
        Some(payload)
    }

    /// Release an allocation. Passing null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a payload address previously returned by this
    /// heap and not freed since.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let payload = match NonNull::new(ptr) {
            None => return,
            Some(payload) => payload,
        };
        let base = NonNull::new_unchecked(payload.as_ptr().sub(INUSE_HEADER_SIZE));
        self.release(base);
    }

    /// Resize an allocation, in place when possible. Passing null behaves
    /// as [`Heap::allocate`]. On failure the original allocation is left
    /// untouched and `None` is returned.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a payload address previously returned by this
    /// heap and not freed since. On success the old pointer must no longer
    /// be used unless it is the one returned.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
        let payload = match NonNull::new(ptr) {
            None => return self.allocate(size),
            Some(payload) => payload,
        };
        let need = chunk_size(size)?;

        let base = NonNull::new_unchecked(payload.as_ptr().sub(INUSE_HEADER_SIZE));
        let tag = read_tag(base);
        assert!(!tag.is_free(), "reallocating a chunk that is not in use");
        let cur = tag.size();
        let ctx = self.ctx.as_ptr();

        if need <= cur {
            let tail = cur - need;
            if tail < MIN_FREE_CHUNK {
                // Not enough slack to carve a free chunk out of; keep it.
                return Some(payload);
            }
            trace!("reallocate shrinks a {} byte chunk to {}", cur, need);
            write_inuse(base, need);
            let tail_base = NonNull::new_unchecked(base.as_ptr().add(need));
            write_inuse(tail_base, tail);
            // Returning the tail through the free path coalesces it with a
            // free successor.
            self.release(tail_base);
            return Some(payload);
        }

        let next = NonNull::new_unchecked(base.as_ptr().add(cur));
        let next_tag = read_tag(next);
        if next_tag.is_free() && cur + next_tag.size() >= need {
            trace!(
                "reallocate grows a {} byte chunk into its {} byte successor",
                cur,
                next_tag.size(),
            );
            let next_header = next.cast::<FreeHeader>();
            if (*ctx).last_chunk == next_header.as_ptr() {
                (*ctx).last_chunk_size = 0;
            }
            FreeChunk::from_header(next_header).unlink();
            write_inuse(base, cur + next_tag.size());
            (*ctx).free_memory -= next_tag.size();
            return Some(payload);
        }

        let fresh = self.allocate(size)?;
        let keep = core::cmp::min(cur - INUSE_OVERHEAD, size);
        core::ptr::copy_nonoverlapping(payload.as_ptr(), fresh.as_ptr(), keep);
        self.release(base);
        Some(fresh)
    }

    /// Usable payload capacity of a live allocation. This may exceed the
    /// requested size: splits absorb remainders too small to live as free
    /// chunks.
    ///
    /// # Safety
    ///
    /// `ptr` must be a payload address previously returned by this heap and
    /// not freed since.
    pub unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        let base = NonNull::new_unchecked(ptr.as_ptr().sub(INUSE_HEADER_SIZE));
        let tag = read_tag(base);
        assert!(!tag.is_free(), "querying a chunk that is not in use");
        tag.size() - INUSE_OVERHEAD
    }

    /// Best-fit search over the bins, without consulting the grower.
    unsafe fn try_allocate(&mut self, need: usize) -> Option<NonNull<u8>> {
        let ctx = self.ctx.as_ptr();
        if need > (*ctx).free_memory {
            return None;
        }

        let mut bin = find_bin(need)?;
        while Context::bin_is_empty(self.ctx, bin) {
            bin += 1;
            if bin >= BIN_COUNT {
                return None;
            }
        }

        let head = Context::bin_head(self.ctx, bin);
        let mut chunk = find_chunk(head, need);
        if chunk == head {
            // No fit in the minimum bin; any chunk of a higher bin is large
            // enough, since it is at least its class floor.
            loop {
                bin += 1;
                if bin >= BIN_COUNT {
                    return None;
                }
                if !Context::bin_is_empty(self.ctx, bin) {
                    break;
                }
            }
            chunk = Context::bin_head(self.ctx, bin).next();
        }

        // Small requests cluster around the previous split, which keeps
        // consecutive small allocations spatially close.
        if chunk.size() > need && need <= (*ctx).last_chunk_size && need <= MAX_SMALL_REQUEST {
            chunk = FreeChunk::from_header(NonNull::new_unchecked((*ctx).last_chunk));
        }

        chunk.unlink();
        Some(self.split_chunk(chunk, need))
    }

    /// Turn an unlinked free chunk into an in-use chunk of `need` bytes,
    /// returning the remainder (if any) to its bin and pinning it as the
    /// split hint. Remainders too small to carry a free header are absorbed
    /// into the allocation.
    unsafe fn split_chunk(&mut self, chunk: FreeChunk, mut need: usize) -> NonNull<u8> {
        let ctx = self.ctx.as_ptr();
        let base = chunk.addr();
        let mut leftover = chunk.size() - need;

        if leftover < MIN_FREE_CHUNK {
            need += leftover;
            leftover = 0;
        }

        write_inuse(base, need);

        if leftover > 0 {
            let rest = NonNull::new_unchecked(base.as_ptr().add(need));
            let rest = Context::add_free_chunk(self.ctx, rest, leftover);
            (*ctx).last_chunk = rest.header().as_ptr();
            (*ctx).last_chunk_size = leftover;
            trace!(
                "split {} bytes off a {} byte chunk at {:p}",
                need,
                need + leftover,
                base,
            );
        } else {
            (*ctx).last_chunk_size = 0;
        }

        (*ctx).free_memory -= need;
        NonNull::new_unchecked(base.as_ptr().add(INUSE_HEADER_SIZE))
    }

    /// Free a chunk by its base address: coalesce with both neighbours and
    /// publish the merged chunk into its bin.
    unsafe fn release(&mut self, base: NonNull<u8>) {
        let ctx = self.ctx.as_ptr();
        let tag = read_tag(base);
        assert!(!tag.is_free(), "freeing a chunk that is not in use");

        let mut size = tag.size();
        assert!(
            size >= MIN_FREE_CHUNK && size % ALIGN == 0,
            "freeing a chunk with a mangled size",
        );
        let footer = (base.as_ptr().add(size - FOOTER_SIZE) as *const Footer).read();
        assert!(size == footer.size, "header and footer sizes disagree");

        let record = ctx as usize;
        let at = base.as_ptr() as usize;
        assert!(
            at >= record + core::mem::size_of::<Context>() || at + size <= record,
            "freed chunk overlaps the context record",
        );

        (*ctx).free_memory += size;
        let mut start = base;

        // The buffer-front sentinel is never free, so the footer right
        // before any chunk is always safe to read.
        let prev_size = (*(start.as_ptr().sub(FOOTER_SIZE) as *const Footer)).size;
        let prev = NonNull::new_unchecked(start.as_ptr().sub(prev_size));
        if read_tag(prev).is_free() {
            FreeChunk::from_header(prev.cast()).unlink();
            start = prev;
            size += prev_size;
        }

        let next = NonNull::new_unchecked(start.as_ptr().add(size));
        let next_tag = read_tag(next);
        if next_tag.is_free() {
            if (*ctx).last_chunk == next.cast::<FreeHeader>().as_ptr() {
                // The split hint is being merged away.
                (*ctx).last_chunk_size = 0;
            }
            FreeChunk::from_header(next.cast()).unlink();
            size += next_tag.size();
        }

        Context::add_free_chunk(self.ctx, start, size);
    }

    /// The exhaustion fallback: ask the registered grower for one region
    /// (with headroom for the boundary sentinels), adopt it, and retry
    /// once.
    unsafe fn grow_and_retry(&mut self, need: usize) -> Option<NonNull<u8>> {
        let ctx = self.ctx.as_ptr();
        let mut grower = (*ctx).external?;
        let want = need + 2 * BOUND_SIZE;
        debug!("internal pool exhausted, requesting {} bytes", want);

        let (region, got) = match grower.as_mut().grow_heap(want) {
            Ok(grant) => grant,
            Err(GrowError) => {
                debug!("the external allocator declined");
                return None;
            }
        };
        if got < want {
            debug!("the external allocator granted {} of {} bytes", got, want);
            return None;
        }

        self.add_buffer(region, got);
        self.try_allocate(need)
    }
}

impl fmt::Display for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Heap(")?;
        let mut start = true;
        unsafe {
            for bin in 0..BIN_COUNT {
                let head = Context::bin_head(self.ctx, bin);
                let mut chunk = head.next();
                while chunk != head {
                    if !start {
                        write!(f, ", ")?;
                    } else {
                        start = false;
                    }
                    write!(f, "{:?}", chunk)?;
                    chunk = chunk.next();
                }
            }
        }
        write!(f, ")")
    }
}

/// `ToyGrower` hands out page-rounded slices of an internal array, in
/// order, and refuses once the array runs out.
pub struct ToyGrower {
    pub page_size: usize,
    pub size: usize,
    pub growths: usize,
    pub heap: [u8; 64 * 1024],
}

impl Default for ToyGrower {
    fn default() -> Self {
        ToyGrower {
            page_size: 64,
            size: 0,
            growths: 0,
            heap: [0; 64 * 1024],
        }
    }
}

impl HeapGrower for ToyGrower {
    unsafe fn grow_heap(&mut self, min_size: usize) -> Result<(NonNull<u8>, usize), GrowError> {
        let granting = round_up(min_size, self.page_size);
        if self.size + granting > self.heap.len() {
            return Err(GrowError);
        }

        let ptr = NonNull::new_unchecked(self.heap.as_mut_ptr().add(self.size));
        self.size += granting;
        self.growths += 1;
        Ok((ptr, granting))
    }
}

/// `LibcGrower` uses virtual memory to grow the heap upon request.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct LibcGrower {
    // Just for tracking, not really needed
    pub pages: usize,
    pub growths: usize,
}

#[cfg(feature = "use_libc")]
impl HeapGrower for LibcGrower {
    unsafe fn grow_heap(&mut self, min_size: usize) -> Result<(NonNull<u8>, usize), GrowError> {
        if min_size == 0 {
            return Err(GrowError);
        }
        let pagesize = sysconf::page::pagesize();
        let to_allocate = round_up(min_size, pagesize);

        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            core::ptr::null_mut(),
            to_allocate,
            // We want read/write access to this memory
            libc::PROT_WRITE | libc::PROT_READ,
            // MAP_ANON: no file descriptor, we're just going to use the
            // memory. MAP_PRIVATE: not shared with any other process.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            debug!("mmap refused {} bytes: {}", to_allocate, errno::errno());
            return Err(GrowError);
        }

        self.pages += to_allocate / pagesize;
        self.growths += 1;

        Ok((NonNull::new_unchecked(ptr as *mut u8), to_allocate))
    }
}
