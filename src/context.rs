use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

use log::debug;

use crate::allocators::HeapGrower;
use crate::chunklist::{
    find_bin, find_upper_chunk, write_inuse, FreeChunk, FreeHeader, Tag, ALIGN, BIN_COUNT,
    BIN_SIZES, BOUND_SIZE, FREE_HEADER_SIZE, MIN_FREE_CHUNK,
};

/// The context record: all allocator state apart from the chunks themselves.
///
/// It is embedded at the (aligned) head of the first buffer handed to
/// [`Heap::init`](crate::allocators::Heap::init); subsequent buffers carry
/// only chunks. The bin heads are in-place list nodes, kept permanently
/// `FREE` with a dummy size, so search and insertion never special-case the
/// end of a list.
#[repr(C)]
pub struct Context {
    pub(crate) total_memory: usize,
    pub(crate) free_memory: usize,
    pub(crate) last_chunk_size: usize,
    pub(crate) last_chunk: *mut FreeHeader,
    pub(crate) external: Option<NonNull<dyn HeapGrower>>,
    pub(crate) bins: [FreeHeader; BIN_COUNT],
}

/// A point-in-time summary of a heap, as observed by walking the bins.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Interior bytes adopted across all buffers.
    pub total: usize,
    /// Bytes currently sitting in free chunks.
    pub free: usize,
    /// Number of free chunks across all bins.
    pub chunks: usize,
}

impl Context {
    /// Carve a context record out of the front of `buffer` and adopt the
    /// remainder for allocations.
    ///
    /// # Safety
    ///
    /// `buffer..buffer + size` must be writable memory owned by the caller
    /// for the lifetime of the heap, and not used for anything else while
    /// the heap is live.
    pub(crate) unsafe fn init(buffer: NonNull<u8>, size: usize) -> NonNull<Context> {
        let offset = buffer.as_ptr().align_offset(align_of::<Context>());
        assert!(
            size >= offset + size_of::<Context>(),
            "buffer of {} bytes cannot hold the context record",
            size,
        );

        let raw = buffer.as_ptr().add(offset) as *mut Context;
        ptr::addr_of_mut!((*raw).total_memory).write(0);
        ptr::addr_of_mut!((*raw).free_memory).write(0);
        ptr::addr_of_mut!((*raw).last_chunk_size).write(0);
        ptr::addr_of_mut!((*raw).last_chunk).write(ptr::null_mut());
        ptr::addr_of_mut!((*raw).external).write(None);

        let bins = ptr::addr_of_mut!((*raw).bins) as *mut FreeHeader;
        for bin in 0..BIN_COUNT {
            let head = bins.add(bin);
            (*head).tag = Tag::free(FREE_HEADER_SIZE);
            (*head).prev = head;
            (*head).next = head;
        }

        let ctx = NonNull::new_unchecked(raw);
        let rest = NonNull::new_unchecked((raw as *mut u8).add(size_of::<Context>()));
        Context::add_buffer(ctx, rest, size - offset - size_of::<Context>());
        ctx
    }

    pub(crate) unsafe fn bin_head(ctx: NonNull<Context>, bin: usize) -> FreeChunk {
        let bins = ptr::addr_of_mut!((*ctx.as_ptr()).bins) as *mut FreeHeader;
        FreeChunk::from_header(NonNull::new_unchecked(bins.add(bin)))
    }

    pub(crate) unsafe fn bin_is_empty(ctx: NonNull<Context>, bin: usize) -> bool {
        let head = Context::bin_head(ctx, bin);
        head.next() == head
    }

    /// Adopt `region..region + size` as chunk storage: in-use sentinels at
    /// both ends, one free chunk in between.
    ///
    /// Regions too small to carry the sentinels plus a minimum free chunk
    /// are ignored.
    ///
    /// # Safety
    ///
    /// Same ownership contract as [`Context::init`], and `ctx` must point at
    /// a live context record.
    pub(crate) unsafe fn add_buffer(ctx: NonNull<Context>, region: NonNull<u8>, size: usize) {
        assert!(
            size < BIN_SIZES[BIN_COUNT - 1],
            "buffers must stay below the top of the bin ladder",
        );

        // Pull both edges inward to the chunk alignment.
        let lead = region.as_ptr().align_offset(ALIGN);
        if size < lead {
            debug!("ignoring {} byte buffer: too small to align", size);
            return;
        }
        let start = region.as_ptr().add(lead);
        let usable = (size - lead) & !(ALIGN - 1);

        if usable < 2 * BOUND_SIZE + MIN_FREE_CHUNK {
            debug!("ignoring {} byte buffer: too small for any chunk", size);
            return;
        }

        write_inuse(NonNull::new_unchecked(start), BOUND_SIZE);
        write_inuse(
            NonNull::new_unchecked(start.add(usable - BOUND_SIZE)),
            BOUND_SIZE,
        );

        let interior = usable - 2 * BOUND_SIZE;
        Context::add_free_chunk(
            ctx,
            NonNull::new_unchecked(start.add(BOUND_SIZE)),
            interior,
        );
        (*ctx.as_ptr()).free_memory += interior;
        (*ctx.as_ptr()).total_memory += interior;

        debug!("adopted buffer at {:p}: {} interior bytes", start, interior);
    }

    /// Write a free chunk over `at..at + size` and insert it into its bin,
    /// directly before the first strictly larger chunk.
    ///
    /// Does not touch `free_memory`; the callers account for that.
    ///
    /// # Safety
    ///
    /// `at..at + size` must be writable allocator-owned memory not covered
    /// by any live chunk, and `ctx` must point at a live context record.
    pub(crate) unsafe fn add_free_chunk(
        ctx: NonNull<Context>,
        at: NonNull<u8>,
        size: usize,
    ) -> FreeChunk {
        let chunk = FreeChunk::emplace(at, size);
        let bin = match find_bin(size) {
            Some(bin) => bin,
            None => panic!("free chunk of {} bytes is off the bin ladder", size),
        };
        let pos = find_upper_chunk(Context::bin_head(ctx, bin), size);
        chunk.link_before(pos);
        chunk
    }

    /// Walk every bin and validate headers, footers, linkage, and the
    /// `free_memory` accounting.
    ///
    /// Returns a pointer to the first offending structure, or `None` when
    /// the heap is clean. Never mutates.
    ///
    /// # Safety
    ///
    /// `ctx` must point at a live context record.
    pub(crate) unsafe fn check(ctx: NonNull<Context>) -> Option<NonNull<u8>> {
        let mut remaining = (*ctx.as_ptr()).free_memory;

        for bin in 0..BIN_COUNT {
            let head = Context::bin_head(ctx, bin);
            if !head.tag().is_free() || head.size() != FREE_HEADER_SIZE {
                return Some(head.addr());
            }

            let mut prev = head;
            let mut chunk = head.next();
            while chunk != head {
                if !chunk.tag().is_free() {
                    return Some(chunk.addr());
                }
                if chunk.prev() != prev {
                    return Some(chunk.addr());
                }
                if chunk.footer_size() != chunk.size() {
                    return Some(chunk.addr());
                }
                if find_bin(chunk.size()) != Some(bin) {
                    return Some(chunk.addr());
                }
                remaining = match remaining.checked_sub(chunk.size()) {
                    Some(remaining) => remaining,
                    None => return Some(chunk.addr()),
                };
                prev = chunk;
                chunk = chunk.next();
            }
        }

        if remaining != 0 {
            // The bins held less than the counter claims; report the record.
            return Some(ctx.cast());
        }
        None
    }

    /// Observe the heap shape by walking the bins.
    ///
    /// # Safety
    ///
    /// `ctx` must point at a live context record.
    pub(crate) unsafe fn stats(ctx: NonNull<Context>) -> Stats {
        let mut stats = Stats {
            total: (*ctx.as_ptr()).total_memory,
            ..Stats::default()
        };

        for bin in 0..BIN_COUNT {
            let head = Context::bin_head(ctx, bin);
            let mut chunk = head.next();
            while chunk != head {
                stats.chunks += 1;
                stats.free += chunk.size();
                chunk = chunk.next();
            }
        }

        stats
    }
}
