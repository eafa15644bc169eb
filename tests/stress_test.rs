use core::ptr::NonNull;

use binned_allocator::chunklist::{ALIGN, INUSE_OVERHEAD};
use binned_allocator::Heap;

use rand::distributions::{Distribution, Uniform};
use rand::{RngCore, SeedableRng};
use test_log::test;

const SIZE: usize = 10 * 1024 * 1024;
const SLOTS: usize = 50;
const ROUNDS: usize = 5000;
const MAX_ALLOC: usize = 1000;

fn validate(heap: &Heap, initial_free: usize, live: usize) {
    assert_eq!(heap.check(), None);
    assert_eq!(heap.free_memory(), initial_free - live);

    // The counter and the bins must tell the same story.
    let stats = heap.stats();
    assert_eq!(stats.free, heap.free_memory());
}

#[test]
fn test_stress() {
    // A Vec<u64> keeps the buffer word-aligned.
    let mut buffer = vec![0u64; SIZE / 8];
    let base = NonNull::new(buffer.as_mut_ptr() as *mut u8).unwrap();
    let mut heap = unsafe { Heap::init(base, SIZE) };
    let initial_free = heap.free_memory();

    let mut slots: [Option<NonNull<u8>>; SLOTS] = [None; SLOTS];
    // Sum of full chunk sizes behind the live slots.
    let mut live: usize = 0;
    let mut allocated_count: usize = 0;
    let mut freed_count: usize = 0;

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let slot_range = Uniform::new(0, SLOTS);
    let size_range = Uniform::new(0, MAX_ALLOC);

    for round in 0..ROUNDS {
        let j = slot_range.sample(&mut rng);
        match slots[j].take() {
            Some(ptr) => unsafe {
                live -= heap.allocation_size(ptr) + INUSE_OVERHEAD;
                heap.free(ptr.as_ptr());
                freed_count += 1;
            },
            None => {
                let size = size_range.sample(&mut rng);
                let ptr = heap
                    .allocate(size)
                    .expect("the pool far exceeds peak demand");
                assert_eq!(ptr.as_ptr() as usize % ALIGN, 0);

                // Scribble over the payload; overlapping allocations would
                // trip the accounting or the checker on a later round.
                unsafe {
                    core::ptr::write_bytes(ptr.as_ptr(), round as u8, size);
                    live += heap.allocation_size(ptr) + INUSE_OVERHEAD;
                }
                slots[j] = Some(ptr);
                allocated_count += 1;
            }
        }

        validate(&heap, initial_free, live);
    }

    log::info!(
        "ran {} rounds: {} allocations, {} frees",
        ROUNDS,
        allocated_count,
        freed_count,
    );

    for slot in slots.iter_mut() {
        if let Some(ptr) = slot.take() {
            unsafe {
                live -= heap.allocation_size(ptr) + INUSE_OVERHEAD;
                heap.free(ptr.as_ptr());
            }
        }
    }

    assert_eq!(live, 0);
    validate(&heap, initial_free, 0);

    // Everything coalesced back into the single buffer-wide chunk.
    let stats = heap.stats();
    assert_eq!(stats.chunks, 1);
    assert_eq!(stats.free, stats.total);
}
