//! Lock-free typed SPSC queue for in-process handoff.
//!
//! A wait-free bounded queue over a heap-allocated ring with atomic indices.
//! Each side keeps a cached copy of the opposite index so the hot path
//! usually touches only its own cache line.
//!
//! # Example
//!
//! ```
//! use gale::sync::spsc;
//!
//! let (producer, consumer) = spsc::channel::<u64, 16>();
//! producer.push(42).expect("queue full");
//! assert_eq!(consumer.pop(), Some(42));
//! ```

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Producer-side state: published head index plus a cached tail.
#[repr(C)]
#[repr(align(64))]
struct ProducerState {
    /// Write index; owned by the producer, read by the consumer.
    head: AtomicUsize,
    /// Producer-local copy of the consumer's tail.
    cached_tail: UnsafeCell<usize>,
}

/// Consumer-side state: published tail index plus a cached head.
#[repr(C)]
#[repr(align(64))]
struct ConsumerState {
    /// Read index; owned by the consumer, read by the producer.
    tail: AtomicUsize,
    /// Consumer-local copy of the producer's head.
    cached_head: UnsafeCell<usize>,
}

struct Slot<T> {
    value: UnsafeCell<MaybeUninit<T>>,
}

struct Ring<T, const N: usize> {
    producer: ProducerState,
    consumer: ConsumerState,
    buffer: [Slot<T>; N],
}

impl<T, const N: usize> Ring<T, N> {
    fn new() -> Self {
        Self {
            producer: ProducerState {
                head: AtomicUsize::new(0),
                cached_tail: UnsafeCell::new(0),
            },
            consumer: ConsumerState {
                tail: AtomicUsize::new(0),
                cached_head: UnsafeCell::new(0),
            },
            buffer: std::array::from_fn(|_| Slot {
                value: UnsafeCell::new(MaybeUninit::uninit()),
            }),
        }
    }

    /// # Safety
    ///
    /// Only one thread may call `push` (single producer).
    #[inline]
    unsafe fn push(&self, item: T) -> Result<(), T> {
        let head = self.producer.head.load(Ordering::Relaxed);

        // SAFETY: only the producer touches its cached_tail.
        let mut cached_tail = unsafe { *self.producer.cached_tail.get() };
        if head.wrapping_sub(cached_tail) >= N {
            cached_tail = self.consumer.tail.load(Ordering::Acquire);
            // SAFETY: as above.
            unsafe { *self.producer.cached_tail.get() = cached_tail };
            if head.wrapping_sub(cached_tail) >= N {
                return Err(item);
            }
        }

        // SAFETY: the capacity check guarantees the consumer has released
        // this slot, and head is published only after the write below.
        unsafe { (*self.buffer[head % N].value.get()).write(item) };
        self.producer.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// # Safety
    ///
    /// Only one thread may call `pop` (single consumer).
    #[inline]
    unsafe fn pop(&self) -> Option<T> {
        let tail = self.consumer.tail.load(Ordering::Relaxed);

        // SAFETY: only the consumer touches its cached_head.
        let mut cached_head = unsafe { *self.consumer.cached_head.get() };
        if cached_head == tail {
            cached_head = self.producer.head.load(Ordering::Acquire);
            // SAFETY: as above.
            unsafe { *self.consumer.cached_head.get() = cached_head };
            if cached_head == tail {
                return None;
            }
        }

        // SAFETY: head != tail proves the producer initialized this slot,
        // and the Acquire load above synchronizes with its Release store.
        let item = unsafe { (*self.buffer[tail % N].value.get()).assume_init_read() };
        self.consumer.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(item)
    }
}

impl<T, const N: usize> Drop for Ring<T, N> {
    fn drop(&mut self) {
        // Exclusive access here: drain whatever the consumer never took.
        let head = *self.producer.head.get_mut();
        let mut tail = *self.consumer.tail.get_mut();
        while tail != head {
            // SAFETY: slots in [tail, head) hold initialized values.
            unsafe { (*self.buffer[tail % N].value.get()).assume_init_drop() };
            tail = tail.wrapping_add(1);
        }
    }
}

// SAFETY: cross-thread access is mediated by the head/tail atomics with
// Release/Acquire ordering; each UnsafeCell is touched by exactly one role.
unsafe impl<T: Send, const N: usize> Send for Ring<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}

/// Marker to opt out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the queue. `Send` but not `Sync`: it can move to another
/// thread, but `&Producer` cannot be shared.
pub struct Producer<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
    _unsync: PhantomUnsync,
}

/// Read end of the queue. Same thread-safety shape as [`Producer`].
pub struct Consumer<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
    _unsync: PhantomUnsync,
}

struct CapacityCheck<const N: usize>;

impl<const N: usize> CapacityCheck<N> {
    const OK: () = assert!(N > 0, "queue capacity must be greater than 0");
}

/// Creates a new SPSC channel with capacity `N`.
#[must_use]
pub fn channel<T: Send, const N: usize>() -> (Producer<T, N>, Consumer<T, N>) {
    let () = CapacityCheck::<N>::OK;

    let ring = Arc::new(Ring::new());
    let producer = Producer {
        ring: Arc::clone(&ring),
        _unsync: PhantomData,
    };
    let consumer = Consumer {
        ring,
        _unsync: PhantomData,
    };
    (producer, consumer)
}

impl<T: Send, const N: usize> Producer<T, N> {
    /// Attempts to push an item (wait-free).
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` when the queue is full so the caller can back off
    /// and retry.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        // SAFETY: Producer is not Sync and not Clone, so this is the only
        // producer-side access.
        unsafe { self.ring.push(item) }
    }
}

impl<T: Send, const N: usize> Consumer<T, N> {
    /// Attempts to pop an item (wait-free). `None` when empty.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: Consumer is not Sync and not Clone, so this is the only
        // consumer-side access.
        unsafe { self.ring.pop() }
    }
}
