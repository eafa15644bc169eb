//! Legacy free-function surface over one process-wide heap.
//!
//! Multi-heap callers swap heaps in and out with [`get_context`] /
//! [`set_context`]; everything else goes through whichever context is
//! current. The context pointer is the only process-wide datum, guarded by
//! a spin lock; the heap behind it is still single-threaded, so callers
//! that share one context across threads get serialised per call but must
//! still reason about ordering themselves.

use core::ptr::NonNull;

use spin::Mutex;

use crate::allocators::{Heap, HeapGrower};
use crate::context::{Context, Stats};

struct Slot(Option<NonNull<Context>>);

// The slot only travels between threads as a raw checkpoint; the buffers
// behind it are the caller's problem, as with Heap itself.
unsafe impl Send for Slot {}

static CONTEXT: Mutex<Slot> = Mutex::new(Slot(None));

fn with_heap<R>(apply: impl FnOnce(&mut Heap) -> R) -> R {
    let slot = CONTEXT.lock();
    let ctx = slot
        .0
        .expect("no memory context: initialize (or set_context) must come first");
    let mut heap = unsafe { Heap::from_context(ctx) };
    apply(&mut heap)
}

/// Create a new heap in `buffer` and make it the current context.
///
/// Must be called before any other operation here, unless a context has
/// been installed with [`set_context`].
///
/// # Safety
///
/// Same contract as [`Heap::init`].
pub unsafe fn initialize(buffer: NonNull<u8>, size: usize) {
    let heap = Heap::init(buffer, size);
    CONTEXT.lock().0 = Some(heap.context());
}

/// Add a new memory buffer for allocations to the current context.
///
/// # Safety
///
/// Same contract as [`Heap::add_buffer`].
pub unsafe fn add_buffer(region: NonNull<u8>, size: usize) {
    with_heap(|heap| heap.add_buffer(region, size))
}

/// Allocate `size` bytes from the current context.
///
/// # Safety
///
/// The current context must point at live buffers (see [`set_context`]).
pub unsafe fn allocate(size: usize) -> Option<NonNull<u8>> {
    with_heap(|heap| heap.allocate(size))
}

/// Allocate a zero-filled region from the current context.
///
/// # Safety
///
/// The current context must point at live buffers (see [`set_context`]).
pub unsafe fn callocate(count: usize, size: usize) -> Option<NonNull<u8>> {
    with_heap(|heap| heap.callocate(count, size))
}

/// Resize an allocation of the current context.
///
/// # Safety
///
/// Same contract as [`Heap::reallocate`].
pub unsafe fn reallocate(ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
    with_heap(|heap| heap.reallocate(ptr, size))
}

/// Release an allocation of the current context. Passing null is a no-op.
///
/// # Safety
///
/// Same contract as [`Heap::free`].
pub unsafe fn free(ptr: *mut u8) {
    with_heap(|heap| heap.free(ptr))
}

/// Validate the current context. Returns a pointer to the first corrupted
/// structure, or `None` when the heap is clean.
///
/// # Safety
///
/// The current context must point at live buffers (see [`set_context`]).
pub unsafe fn check() -> Option<NonNull<u8>> {
    with_heap(|heap| heap.check())
}

/// Observe the current context's heap shape.
///
/// # Safety
///
/// The current context must point at live buffers (see [`set_context`]).
pub unsafe fn stats() -> Stats {
    with_heap(|heap| heap.stats())
}

/// The current context pointer, or `None` before the first
/// [`initialize`] / [`set_context`].
pub fn get_context() -> Option<NonNull<Context>> {
    CONTEXT.lock().0
}

/// Make a context produced earlier the current one.
///
/// # Safety
///
/// `ctx` must come from [`initialize`] / [`Heap::context`] and its buffers
/// must outlive its use here.
pub unsafe fn set_context(ctx: NonNull<Context>) {
    CONTEXT.lock().0 = Some(ctx);
}

/// Register (or clear) the external source of additional buffers for the
/// current context.
///
/// # Safety
///
/// Same contract as [`Heap::set_external_alloc`].
pub unsafe fn set_external_alloc(grower: Option<NonNull<dyn HeapGrower>>) {
    with_heap(|heap| heap.set_external_alloc(grower))
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    // The context slot is process-wide, so this file keeps to a single test.
    #[test]
    fn facade_round_trip() {
        #[repr(align(8))]
        struct Arena([u8; 16 * 1024]);
        let mut arena = Arena([0; 16 * 1024]);

        assert_eq!(get_context(), None);

        unsafe {
            initialize(NonNull::new(arena.0.as_mut_ptr()).unwrap(), arena.0.len());
            let ctx = get_context().expect("initialize installs a context");

            let p = allocate(100).expect("fresh heap serves 100 bytes");
            assert_eq!(check(), None);
            free(p.as_ptr());
            assert_eq!(check(), None);

            let stats = stats();
            assert_eq!(stats.chunks, 1);
            assert_eq!(stats.free, stats.total);

            set_context(ctx);
            assert_eq!(get_context(), Some(ctx));
        }
    }
}
