//! Fixed-sequence probes: multi-buffer coalescing, reallocation, and the
//! payload-preservation and zero-fill guarantees.

use core::ptr::NonNull;

use binned_allocator::Heap;

use rand::distributions::{Distribution, Uniform};
use rand::{RngCore, SeedableRng};
use test_log::test;

const SIZE: usize = 32 * 1024 * 1024;

struct Buffer(Vec<u64>);

impl Buffer {
    fn new(size: usize) -> Buffer {
        Buffer(vec![0u64; size / 8])
    }

    fn base(&mut self) -> NonNull<u8> {
        NonNull::new(self.0.as_mut_ptr() as *mut u8).unwrap()
    }

    fn len(&self) -> usize {
        self.0.len() * 8
    }
}

#[test]
fn multi_buffer_coalescing_probe() {
    let mut primary = Buffer::new(SIZE);
    let mut secondary = Buffer::new(SIZE / 2);

    let mut heap = unsafe { Heap::init(primary.base(), primary.len()) };
    assert_eq!(heap.check(), None);

    unsafe { heap.add_buffer(secondary.base(), secondary.len()) };
    assert_eq!(heap.check(), None);
    let initial_free = heap.free_memory();

    let mut p1 = heap.allocate(SIZE / 2).expect("half the primary fits");
    assert_eq!(heap.check(), None);

    unsafe { heap.free(p1.as_ptr()) };
    assert_eq!(heap.check(), None);
    assert_eq!(heap.free_memory(), initial_free);

    // Three quarters of the primary, then two allocations that only both
    // fit because the secondary buffer is there.
    p1 = heap.allocate(3 * SIZE / 4).expect("three quarters fit");
    assert_eq!(heap.check(), None);
    let p2 = heap.allocate(SIZE / 5).expect("the primary tail fits this");
    assert_eq!(heap.check(), None);
    let p3 = heap.allocate(SIZE / 5).expect("the secondary serves this");
    assert_eq!(heap.check(), None);

    unsafe { heap.free(p1.as_ptr()) };
    assert_eq!(heap.check(), None);

    p1 = heap.allocate(SIZE / 5).expect("freed space serves this");
    assert_eq!(heap.check(), None);

    unsafe { heap.free(p3.as_ptr()) };
    assert_eq!(heap.check(), None);
    unsafe { heap.free(p1.as_ptr()) };
    assert_eq!(heap.check(), None);
    unsafe { heap.free(p2.as_ptr()) };
    assert_eq!(heap.check(), None);

    // Fully drained: one buffer-wide chunk per buffer, accounting restored.
    assert_eq!(heap.free_memory(), initial_free);
    let stats = heap.stats();
    assert_eq!(stats.chunks, 2);
    assert_eq!(stats.free, stats.total);
}

#[test]
fn reallocate_preserves_payload_prefix() {
    let mut buffer = Buffer::new(1024 * 1024);
    let mut heap = unsafe { Heap::init(buffer.base(), buffer.len()) };

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let size_range = Uniform::new(1usize, 4096);

    let mut size = size_range.sample(&mut rng);
    let mut ptr = heap.allocate(size).expect("first allocation fits");
    unsafe {
        for i in 0..size {
            ptr.as_ptr().add(i).write((i % 251) as u8);
        }
    }

    // A blocker after the allocation forces some of the resizes to move.
    let blocker = heap.allocate(64).expect("blocker fits");

    for _ in 0..64 {
        let new_size = size_range.sample(&mut rng);
        let kept = new_size.min(size);

        ptr = unsafe {
            heap.reallocate(ptr.as_ptr(), new_size)
                .expect("resizes stay well within the buffer")
        };
        assert_eq!(heap.check(), None);
        unsafe {
            for i in 0..kept {
                assert_eq!(ptr.as_ptr().add(i).read(), (i % 251) as u8);
            }
            // Restore the pattern over the full region for the next round.
            for i in 0..new_size {
                ptr.as_ptr().add(i).write((i % 251) as u8);
            }
        }
        size = new_size;
    }

    unsafe {
        heap.free(ptr.as_ptr());
        heap.free(blocker.as_ptr());
    }
    assert_eq!(heap.check(), None);
    let stats = heap.stats();
    assert_eq!(stats.chunks, 1);
}

#[test]
fn callocate_returns_all_zeroes() {
    let mut buffer = Buffer::new(1024 * 1024);
    let mut heap = unsafe { Heap::init(buffer.base(), buffer.len()) };

    // Dirty a stretch of the buffer, free it, then calloc over it.
    let dirty = heap.allocate(64 * 1024).expect("fits");
    unsafe {
        core::ptr::write_bytes(dirty.as_ptr(), 0x5a, 64 * 1024);
        heap.free(dirty.as_ptr());
    }

    let counts = [1usize, 7, 256, 4096];
    for &count in &counts {
        let ptr = heap.callocate(count, 16).expect("fits");
        unsafe {
            for i in 0..count * 16 {
                assert_eq!(ptr.as_ptr().add(i).read(), 0, "byte {} not zeroed", i);
            }
            heap.free(ptr.as_ptr());
        }
        assert_eq!(heap.check(), None);
    }
}
