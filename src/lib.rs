#![no_std]

//! A boundary-tag, segregated-bin memory allocator over caller-supplied
//! buffers.
//!
//! The crate never asks the OS for memory: callers hand it one or more
//! contiguous byte buffers, and it services variable-sized allocation,
//! reallocation, and free requests out of them. Every buffer is carved into
//! chunks delimited by a header and a size-carrying footer, free chunks are
//! kept in ~90 size-classed circular lists, splits are eager and coalescing
//! is total, so no two free chunks are ever adjacent.
//!
//! The first buffer also carries the [`Context`] record (bin heads,
//! counters, the split hint, the optional growth hook), which makes whole
//! heaps checkpointable: hold on to the raw context pointer and re-enter it
//! later with [`Heap::from_context`], or run several independent heaps side
//! by side. The [`global`] module keeps a C-flavoured free-function surface
//! over one process-wide context for callers that want the classic
//! `initialize` / `allocate` / `free` shape.
//!
//! ```
//! use binned_allocator::Heap;
//! use core::ptr::NonNull;
//!
//! #[repr(align(8))]
//! struct Arena([u8; 16 * 1024]);
//! let mut arena = Arena([0; 16 * 1024]);
//!
//! let buffer = NonNull::new(arena.0.as_mut_ptr()).unwrap();
//! let mut heap = unsafe { Heap::init(buffer, arena.0.len()) };
//!
//! let p = heap.allocate(100).expect("plenty of room");
//! unsafe { heap.free(p.as_ptr()) };
//! assert_eq!(heap.check(), None);
//! ```

pub mod allocators;
pub mod chunklist;
pub mod context;
pub mod global;

#[cfg(feature = "use_libc")]
pub use allocators::LibcGrower;
pub use allocators::{GrowError, Heap, HeapGrower, ToyGrower};
pub use context::{Context, Stats};
