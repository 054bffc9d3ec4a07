//! Gap detection and NAK policy.
//!
//! A loss handler observes the byte ranges a session has rebuilt into its
//! term buffer and is polled periodically by the receiver thread. When a gap
//! has persisted past the configured delay, it asks its [`NakEmitter`] for a
//! retransmission of the missing range. Emitting the same NAK again after a
//! further delay is allowed; the source treats NAKs idempotently.

use std::collections::BTreeMap;
use std::time::Duration;

use minstant::Instant;

/// Capability for emitting a NAK for a missing range.
///
/// Implementations carry just enough context to address the frame (session,
/// channel, source address, transport); the loss handler never sees the
/// receiver itself.
pub trait NakEmitter {
    /// Requests retransmission of `length` bytes at `term_offset` in
    /// `term_id`.
    fn nak(&mut self, term_id: u64, term_offset: u32, length: u32);
}

/// Per-session gap detection contract.
pub trait LossHandler: Send {
    /// Records that `[term_offset, term_offset + length)` of `term_id` has
    /// been observed in the term buffer.
    fn on_frame(&mut self, term_id: u64, term_offset: u32, length: u32);

    /// Scans for gaps, emitting NAKs per the policy. Called periodically by
    /// the receiver thread.
    fn scan(&mut self, now: Instant, emitter: &mut dyn NakEmitter);

    /// Highest term offset up to which all bytes have been received.
    fn highest_contiguous(&self) -> u32;
}

/// Default [`LossHandler`]: merges observed ranges and NAKs the first gap
/// after it has stood for `nak_delay`.
///
/// The delay gives regular out-of-order arrival a chance to fill the gap
/// before a retransmission is requested. With a zero delay the first scan
/// after a gap appears emits immediately.
pub struct GapTracker {
    term_id: u64,
    /// Everything below this offset has been received.
    contiguous: u32,
    /// Received ranges above the contiguous position: start → end, disjoint
    /// and non-adjacent.
    islands: BTreeMap<u32, u32>,
    nak_delay: Duration,
    /// Start offset of the gap currently being timed.
    tracked_gap: Option<u32>,
    gap_since: Option<Instant>,
    last_nak: Option<Instant>,
}

impl GapTracker {
    /// Creates a tracker for one term.
    #[must_use]
    pub fn new(term_id: u64, nak_delay: Duration) -> Self {
        Self {
            term_id,
            contiguous: 0,
            islands: BTreeMap::new(),
            nak_delay,
            tracked_gap: None,
            gap_since: None,
            last_nak: None,
        }
    }

    /// Folds islands that now touch the contiguous position into it.
    fn absorb_islands(&mut self) {
        while let Some((&start, &end)) = self.islands.first_key_value() {
            if start > self.contiguous {
                break;
            }
            self.islands.remove(&start);
            if end > self.contiguous {
                self.contiguous = end;
            }
        }
    }

    /// Merges `[start, end)` into the island set, coalescing overlaps and
    /// adjacency.
    fn merge_island(&mut self, start: u32, end: u32) {
        let mut new_start = start;
        let mut new_end = end;

        if let Some((&prev_start, &prev_end)) = self.islands.range(..=start).next_back()
            && prev_end >= start
        {
            self.islands.remove(&prev_start);
            new_start = prev_start;
            new_end = new_end.max(prev_end);
        }

        let touching: Vec<u32> = self
            .islands
            .range(new_start..=new_end)
            .map(|(&s, _)| s)
            .collect();
        for s in touching {
            if let Some(e) = self.islands.remove(&s) {
                new_end = new_end.max(e);
            }
        }

        self.islands.insert(new_start, new_end);
    }
}

impl LossHandler for GapTracker {
    fn on_frame(&mut self, term_id: u64, term_offset: u32, length: u32) {
        if term_id != self.term_id || length == 0 {
            return;
        }

        let start = term_offset;
        let Some(end) = term_offset.checked_add(length) else {
            return;
        };

        if end <= self.contiguous {
            return; // duplicate of already-contiguous bytes
        }

        if start <= self.contiguous {
            self.contiguous = end;
            self.absorb_islands();
        } else {
            self.merge_island(start, end);
        }
    }

    fn scan(&mut self, now: Instant, emitter: &mut dyn NakEmitter) {
        let Some((&gap_end, _)) = self.islands.first_key_value() else {
            // Stream is contiguous; re-arm the timers for the next gap.
            self.tracked_gap = None;
            self.gap_since = None;
            self.last_nak = None;
            return;
        };

        let gap_start = self.contiguous;
        if self.tracked_gap != Some(gap_start) {
            self.tracked_gap = Some(gap_start);
            self.gap_since = Some(now);
            self.last_nak = None;
        }

        let since = self.gap_since.get_or_insert(now);
        if now.duration_since(*since) < self.nak_delay {
            return;
        }

        let due = match self.last_nak {
            None => true,
            Some(at) => now.duration_since(at) >= self.nak_delay,
        };
        if due {
            emitter.nak(self.term_id, gap_start, gap_end - gap_start);
            self.last_nak = Some(now);
        }
    }

    fn highest_contiguous(&self) -> u32 {
        self.contiguous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingEmitter {
        naks: Vec<(u64, u32, u32)>,
    }

    impl RecordingEmitter {
        fn new() -> Self {
            Self { naks: Vec::new() }
        }
    }

    impl NakEmitter for RecordingEmitter {
        fn nak(&mut self, term_id: u64, term_offset: u32, length: u32) {
            self.naks.push((term_id, term_offset, length));
        }
    }

    #[test]
    fn in_order_frames_advance_contiguous() {
        let mut tracker = GapTracker::new(7, Duration::ZERO);
        tracker.on_frame(7, 0, 64);
        tracker.on_frame(7, 64, 64);
        assert_eq!(tracker.highest_contiguous(), 128);
    }

    #[test]
    fn out_of_order_frame_leaves_gap_then_fills() {
        let mut tracker = GapTracker::new(7, Duration::ZERO);
        tracker.on_frame(7, 128, 64);
        assert_eq!(tracker.highest_contiguous(), 0);

        tracker.on_frame(7, 0, 128);
        assert_eq!(tracker.highest_contiguous(), 192);
    }

    #[test]
    fn duplicates_are_idempotent() {
        let mut tracker = GapTracker::new(7, Duration::ZERO);
        tracker.on_frame(7, 0, 64);
        tracker.on_frame(7, 0, 64);
        tracker.on_frame(7, 32, 16);
        assert_eq!(tracker.highest_contiguous(), 64);
    }

    #[test]
    fn scan_naks_first_gap() {
        let mut tracker = GapTracker::new(7, Duration::ZERO);
        tracker.on_frame(7, 0, 64);
        tracker.on_frame(7, 192, 64);

        let mut emitter = RecordingEmitter::new();
        tracker.scan(Instant::now(), &mut emitter);
        assert_eq!(emitter.naks, vec![(7, 64, 128)]);
    }

    #[test]
    fn scan_without_gap_is_silent() {
        let mut tracker = GapTracker::new(7, Duration::ZERO);
        tracker.on_frame(7, 0, 64);

        let mut emitter = RecordingEmitter::new();
        tracker.scan(Instant::now(), &mut emitter);
        assert!(emitter.naks.is_empty());
    }

    #[test]
    fn nak_waits_for_delay() {
        let mut tracker = GapTracker::new(7, Duration::from_millis(50));
        tracker.on_frame(7, 64, 64);

        let first = Instant::now();
        let mut emitter = RecordingEmitter::new();
        tracker.scan(first, &mut emitter);
        assert!(emitter.naks.is_empty(), "gap only just observed");

        tracker.scan(first + Duration::from_millis(60), &mut emitter);
        assert_eq!(emitter.naks, vec![(7, 0, 64)]);
    }

    #[test]
    fn nak_reemits_after_another_delay() {
        let mut tracker = GapTracker::new(7, Duration::from_millis(10));
        tracker.on_frame(7, 64, 64);

        let t0 = Instant::now();
        let mut emitter = RecordingEmitter::new();
        tracker.scan(t0, &mut emitter);
        tracker.scan(t0 + Duration::from_millis(15), &mut emitter);
        tracker.scan(t0 + Duration::from_millis(20), &mut emitter);
        tracker.scan(t0 + Duration::from_millis(30), &mut emitter);
        assert_eq!(emitter.naks, vec![(7, 0, 64), (7, 0, 64)]);
    }

    #[test]
    fn filled_gap_rearms_timer() {
        let mut tracker = GapTracker::new(7, Duration::ZERO);
        tracker.on_frame(7, 64, 64);

        let mut emitter = RecordingEmitter::new();
        tracker.scan(Instant::now(), &mut emitter);
        assert_eq!(emitter.naks.len(), 1);

        tracker.on_frame(7, 0, 64);
        tracker.scan(Instant::now(), &mut emitter);
        assert_eq!(emitter.naks.len(), 1, "no gap left to NAK");
    }

    #[test]
    fn islands_merge_overlaps_and_adjacency() {
        let mut tracker = GapTracker::new(7, Duration::ZERO);
        tracker.on_frame(7, 100, 20);
        tracker.on_frame(7, 140, 20);
        tracker.on_frame(7, 120, 20); // bridges the two islands

        let mut emitter = RecordingEmitter::new();
        tracker.scan(Instant::now(), &mut emitter);
        assert_eq!(emitter.naks, vec![(7, 0, 100)]);

        tracker.on_frame(7, 0, 100);
        assert_eq!(tracker.highest_contiguous(), 160);
    }

    #[test]
    fn frames_for_other_terms_are_ignored() {
        let mut tracker = GapTracker::new(7, Duration::ZERO);
        tracker.on_frame(8, 0, 64);
        assert_eq!(tracker.highest_contiguous(), 0);
    }
}
