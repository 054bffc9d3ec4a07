//! SPSC ring buffer of length-prefixed command records.
//!
//! The command channels between the receiver and conductor threads carry
//! encoded commands rather than typed values, so one fixed allocation serves
//! arbitrarily-shaped messages and the producer never allocates per command.
//!
//! # Record layout
//!
//! ```text
//! 0: record length (u32 LE) - header plus payload, unpadded
//! 4: message type  (u32 LE) - 0 is reserved for padding records
//! 8: payload bytes
//! ```
//!
//! Records never wrap around the end of the buffer: when the remaining space
//! before the end is too small, the producer writes a padding record covering
//! it and the real record starts back at index zero. Every record advances
//! the indices by its length rounded up to 8 bytes, so record headers stay
//! word aligned.

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bytes of record header preceding each payload.
pub const RECORD_HEADER_LENGTH: usize = 8;

/// Message type reserved for padding records at the buffer end.
pub const PADDING_MSG_TYPE: u32 = 0;

const RECORD_ALIGNMENT: usize = 8;

const fn align_record(len: usize) -> usize {
    (len + RECORD_ALIGNMENT - 1) & !(RECORD_ALIGNMENT - 1)
}

#[repr(C)]
#[repr(align(64))]
struct ProducerState {
    head: AtomicUsize,
    cached_tail: UnsafeCell<usize>,
}

#[repr(C)]
#[repr(align(64))]
struct ConsumerState {
    tail: AtomicUsize,
    cached_head: UnsafeCell<usize>,
}

struct Shared {
    producer: ProducerState,
    consumer: ConsumerState,
    mask: usize,
    buffer: Box<[UnsafeCell<u8>]>,
}

impl Shared {
    fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// # Safety
    ///
    /// The [idx, idx + 4) region must be owned by the calling role.
    unsafe fn store_u32(&self, idx: usize, v: u32) {
        // UnsafeCell<u8> is layout-compatible with u8 and the slots are
        // contiguous, so a ranged copy through the first cell is in bounds.
        unsafe {
            std::ptr::copy_nonoverlapping(v.to_le_bytes().as_ptr(), self.buffer[idx].get(), 4);
        }
    }

    /// # Safety
    ///
    /// The [idx, idx + 4) region must be owned by the calling role.
    unsafe fn load_u32(&self, idx: usize) -> u32 {
        let mut bytes = [0u8; 4];
        unsafe {
            std::ptr::copy_nonoverlapping(self.buffer[idx].get(), bytes.as_mut_ptr(), 4);
        }
        u32::from_le_bytes(bytes)
    }

    /// # Safety
    ///
    /// The [idx, idx + src.len()) region must be owned by the producer.
    unsafe fn copy_in(&self, idx: usize, src: &[u8]) {
        if !src.is_empty() {
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), self.buffer[idx].get(), src.len());
            }
        }
    }

    /// # Safety
    ///
    /// The [idx, idx + len) region must be owned by the consumer for the
    /// lifetime of the returned slice.
    unsafe fn payload(&self, idx: usize, len: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.buffer[idx].get(), len) }
    }
}

// SAFETY: concurrent access is mediated by head/tail with Release/Acquire;
// the byte regions handed out never overlap between the two roles.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the command ring. `Send` but not `Sync`.
pub struct RingProducer {
    shared: Arc<Shared>,
    _unsync: PhantomUnsync,
}

/// Read end of the command ring. `Send` but not `Sync`.
pub struct RingConsumer {
    shared: Arc<Shared>,
    _unsync: PhantomUnsync,
}

/// Creates a command ring with the given capacity in bytes.
///
/// # Panics
///
/// Panics if `capacity` is not a power of two of at least 64 bytes.
#[must_use]
pub fn ring_buffer(capacity: usize) -> (RingProducer, RingConsumer) {
    assert!(
        capacity.is_power_of_two() && capacity >= 64,
        "ring capacity must be a power of two of at least 64 bytes"
    );

    let buffer = (0..capacity)
        .map(|_| UnsafeCell::new(0u8))
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let shared = Arc::new(Shared {
        producer: ProducerState {
            head: AtomicUsize::new(0),
            cached_tail: UnsafeCell::new(0),
        },
        consumer: ConsumerState {
            tail: AtomicUsize::new(0),
            cached_head: UnsafeCell::new(0),
        },
        mask: capacity - 1,
        buffer,
    });

    (
        RingProducer {
            shared: Arc::clone(&shared),
            _unsync: PhantomData,
        },
        RingConsumer {
            shared,
            _unsync: PhantomData,
        },
    )
}

impl RingProducer {
    /// Writes one command record.
    ///
    /// Returns `false` when the ring does not currently have room; the
    /// record is not partially written and the caller may retry.
    pub fn write(&self, msg_type: u32, payload: &[u8]) -> bool {
        debug_assert_ne!(msg_type, PADDING_MSG_TYPE, "message type 0 is reserved");

        let shared = &self.shared;
        let capacity = shared.capacity();
        let record_len = RECORD_HEADER_LENGTH + payload.len();
        let aligned = align_record(record_len);
        // Half the capacity bounds the padding + record combination at any
        // head position; larger records could never be written.
        if aligned > capacity / 2 {
            return false;
        }

        let head = shared.producer.head.load(Ordering::Relaxed);
        let head_idx = head & shared.mask;
        let to_end = capacity - head_idx;
        let (padding, required) = if aligned <= to_end {
            (0, aligned)
        } else {
            (to_end, to_end + aligned)
        };

        // SAFETY: only the producer touches its cached_tail.
        let mut cached_tail = unsafe { *shared.producer.cached_tail.get() };
        if capacity - head.wrapping_sub(cached_tail) < required {
            cached_tail = shared.consumer.tail.load(Ordering::Acquire);
            // SAFETY: as above.
            unsafe { *shared.producer.cached_tail.get() = cached_tail };
            if capacity - head.wrapping_sub(cached_tail) < required {
                return false;
            }
        }

        // SAFETY for all stores below: the space check guarantees the
        // consumer has released [head, head + required), and head is
        // published only after the writes.
        let record_idx = if padding > 0 {
            unsafe {
                shared.store_u32(head_idx, padding as u32);
                shared.store_u32(head_idx + 4, PADDING_MSG_TYPE);
            }
            0
        } else {
            head_idx
        };

        unsafe {
            shared.store_u32(record_idx, record_len as u32);
            shared.store_u32(record_idx + 4, msg_type);
            shared.copy_in(record_idx + RECORD_HEADER_LENGTH, payload);
        }

        shared
            .producer
            .head
            .store(head.wrapping_add(required), Ordering::Release);
        true
    }
}

impl RingConsumer {
    /// Drains all currently readable records in FIFO order, invoking
    /// `handler` with each record's message type and payload.
    ///
    /// Returns the number of records delivered. The payload slice is only
    /// valid for the duration of the callback.
    pub fn read(&self, mut handler: impl FnMut(u32, &[u8])) -> usize {
        let shared = &self.shared;
        let mut tail = shared.consumer.tail.load(Ordering::Relaxed);

        // SAFETY: only the consumer touches its cached_head.
        let mut cached_head = unsafe { *shared.consumer.cached_head.get() };
        let mut count = 0;

        loop {
            if tail == cached_head {
                cached_head = shared.producer.head.load(Ordering::Acquire);
                // SAFETY: as above.
                unsafe { *shared.consumer.cached_head.get() = cached_head };
                if tail == cached_head {
                    return count;
                }
            }

            let idx = tail & shared.mask;
            // SAFETY: [tail, head) was published by the producer and the
            // Acquire load above synchronizes with its Release store.
            let record_len = unsafe { shared.load_u32(idx) } as usize;
            let msg_type = unsafe { shared.load_u32(idx + 4) };
            let advance = align_record(record_len);

            if msg_type != PADDING_MSG_TYPE {
                let payload_len = record_len - RECORD_HEADER_LENGTH;
                // SAFETY: the record extent was published by the producer and
                // tail is republished only after the handler returns.
                let payload = unsafe { shared.payload(idx + RECORD_HEADER_LENGTH, payload_len) };
                handler(msg_type, payload);
                count += 1;
            }

            tail = tail.wrapping_add(advance);
            shared.consumer.tail.store(tail, Ordering::Release);
        }
    }
}

// SAFETY: the ends only contain an Arc to the Sync Shared; the unsync marker
// keeps each role single-threaded.
unsafe impl Send for RingProducer {}
unsafe impl Send for RingConsumer {}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(consumer: &RingConsumer) -> Vec<(u32, Vec<u8>)> {
        let mut records = Vec::new();
        consumer.read(|msg_type, payload| records.push((msg_type, payload.to_vec())));
        records
    }

    #[test]
    fn write_read_roundtrip() {
        let (producer, consumer) = ring_buffer(256);
        assert!(producer.write(1, b"hello"));
        assert!(producer.write(2, b""));
        assert!(producer.write(3, b"world!!"));

        let records = drain(&consumer);
        assert_eq!(
            records,
            vec![
                (1, b"hello".to_vec()),
                (2, Vec::new()),
                (3, b"world!!".to_vec()),
            ]
        );
        assert_eq!(consumer.read(|_, _| {}), 0);
    }

    #[test]
    fn rejects_record_when_full() {
        let (producer, consumer) = ring_buffer(64);
        // 24-byte payload -> 32-byte record; two fit, the third does not.
        assert!(producer.write(1, &[0u8; 24]));
        assert!(producer.write(2, &[0u8; 24]));
        assert!(!producer.write(3, &[0u8; 24]));

        assert_eq!(drain(&consumer).len(), 2);
        assert!(producer.write(3, &[0u8; 24]));
    }

    #[test]
    fn rejects_record_larger_than_capacity() {
        let (producer, _consumer) = ring_buffer(64);
        assert!(!producer.write(1, &[0u8; 64]));
    }

    #[test]
    fn pads_at_buffer_end_and_preserves_fifo() {
        let (producer, consumer) = ring_buffer(128);

        // Walk the indices out of phase with the capacity so records of
        // 24 bytes (aligned) eventually straddle the end and force padding.
        let mut next = 0u8;
        for _ in 0..64 {
            let payload = [next; 13]; // 21-byte record, advances by 24
            assert!(producer.write(u32::from(next) + 1, &payload));
            let records = drain(&consumer);
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].0, u32::from(next) + 1);
            assert_eq!(records[0].1, payload);
            next = next.wrapping_add(1);
        }
    }

    #[test]
    fn interleaved_backlog_wraps_cleanly() {
        let (producer, consumer) = ring_buffer(128);
        let mut written = 0u32;
        let mut read = 0u32;

        for _ in 0..100 {
            while producer.write(written + 1, &(written.to_le_bytes())) {
                written += 1;
            }
            consumer.read(|msg_type, payload| {
                assert_eq!(msg_type, read + 1);
                assert_eq!(payload, read.to_le_bytes());
                read += 1;
            });
            assert_eq!(written, read);
        }
        assert!(written >= 100);
    }

    #[test]
    fn cross_thread_fifo() {
        let (producer, consumer) = ring_buffer(1024);
        let count = 5_000u32;

        let sender = std::thread::spawn(move || {
            for i in 0..count {
                while !producer.write(7, &i.to_le_bytes()) {
                    std::hint::spin_loop();
                }
            }
        });

        let mut expected = 0u32;
        while expected < count {
            consumer.read(|msg_type, payload| {
                assert_eq!(msg_type, 7);
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(payload);
                assert_eq!(u32::from_le_bytes(bytes), expected);
                expected += 1;
            });
        }
        sender.join().unwrap();
    }
}
