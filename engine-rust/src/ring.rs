//! Time-capacity ring buffer and the envelope sample pool.
//!
//! `Ring` keeps elements ordered by timestamp and guarantees that
//! `back.timestamp - front.timestamp` never exceeds the configured capacity.
//! Values older than the capacity window (relative to the newest element) are
//! rejected instead of reordering the buffer.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

/// Anything with a timestamp can live in a [`Ring`].
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone)]
pub struct Ring<T: Timestamped> {
    items: VecDeque<T>,
    capacity: Duration,
}

impl<T: Timestamped> Ring<T> {
    pub fn new(capacity: Duration) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> Duration {
        self.capacity
    }

    /// Change the capacity and evict elements that fall out of the new window.
    pub fn set_capacity(&mut self, capacity: Duration) {
        self.capacity = capacity;
        self.evict();
    }

    /// Insert `v` in timestamp order.
    ///
    /// Returns false when `v` is older than `back.timestamp - capacity`; the
    /// buffer is left untouched in that case. Equal timestamps keep insertion
    /// order (new values go behind existing ones).
    pub fn feed(&mut self, v: T) -> bool {
        let ts = v.timestamp();

        if let Some(back) = self.items.back() {
            if ts >= back.timestamp() {
                self.items.push_back(v);
            } else if ts < back.timestamp() - self.capacity {
                // Out of the buffer's capacity window
                return false;
            } else if ts < self.items.front().expect("non-empty").timestamp() {
                self.items.push_front(v);
            } else {
                // Scan from the back for the first element not newer than v
                let pos = self
                    .items
                    .iter()
                    .rposition(|e| e.timestamp() <= ts)
                    .expect("front <= v < back");
                self.items.insert(pos + 1, v);
            }
        } else {
            self.items.push_back(v);
        }

        self.evict();
        true
    }

    fn evict(&mut self) {
        let Some(back) = self.items.back() else {
            return;
        };
        let tmin = back.timestamp() - self.capacity;
        while let Some(front) = self.items.front() {
            if front.timestamp() < tmin {
                self.items.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn back(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

// ── Sample pool ──────────────────────────────────────────────────────────────

/// Fixed-capacity scratch buffer for the samples of one envelope interval.
/// The clipped flag is sticky until the pool is cleared.
#[derive(Debug, Clone, Default)]
pub struct SamplePool {
    samples: Vec<f64>,
    ofs: usize,
    pub clipped: bool,
}

impl SamplePool {
    /// Resize to `n` slots and clear. Reallocation only happens when the
    /// capacity actually changes.
    pub fn reset(&mut self, n: usize) {
        if self.samples.len() != n {
            self.samples = vec![0.0; n];
        }
        self.clear();
    }

    pub fn clear(&mut self) {
        self.ofs = 0;
        self.clipped = false;
    }

    pub fn push(&mut self, v: f64) {
        debug_assert!(self.ofs < self.samples.len(), "sample pool overflow");
        if self.ofs < self.samples.len() {
            self.samples[self.ofs] = v;
            self.ofs += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.ofs
    }

    pub fn is_empty(&self) -> bool {
        self.ofs == 0
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples[..self.ofs]
    }

    /// Largest absolute sample currently pooled.
    pub fn peak_abs(&self) -> f64 {
        self.samples().iter().fold(0.0, |m, v| m.max(v.abs()))
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        ts: DateTime<Utc>,
        tag: u32,
    }

    impl Timestamped for Item {
        fn timestamp(&self) -> DateTime<Utc> {
            self.ts
        }
    }

    fn at(secs_x10: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(secs_x10 * 100).unwrap()
    }

    fn item(secs_x10: i64, tag: u32) -> Item {
        Item {
            ts: at(secs_x10),
            tag,
        }
    }

    #[test]
    fn capacity_invariant_holds_after_every_feed() {
        let mut ring = Ring::new(Duration::seconds(2));
        for i in 0..100 {
            assert!(ring.feed(item(i * 3, i as u32)));
            let span = ring.back().unwrap().ts - ring.front().unwrap().ts;
            assert!(span <= Duration::seconds(2));
        }
    }

    #[test]
    fn eviction_keeps_exact_window() {
        // Capacity 2s, feeds at 0.0, 0.5, ..., 2.5s: 0.0 must be evicted,
        // 0.5..2.5 must survive.
        let mut ring = Ring::new(Duration::seconds(2));
        for i in [0, 5, 10, 15, 20, 25] {
            assert!(ring.feed(item(i, i as u32)));
        }
        let kept: Vec<i64> = ring.iter().map(|e| e.ts.timestamp_millis() / 100).collect();
        assert_eq!(kept, vec![5, 10, 15, 20, 25]);
    }

    #[test]
    fn late_values_are_inserted_in_order_or_rejected() {
        let mut ring = Ring::new(Duration::seconds(10));
        ring.feed(item(0, 0));
        ring.feed(item(50, 1));
        // In-window late arrival is sorted in
        assert!(ring.feed(item(20, 2)));
        let tags: Vec<u32> = ring.iter().map(|e| e.tag).collect();
        assert_eq!(tags, vec![0, 2, 1]);
        // Arrival older than back - capacity is rejected
        assert!(!ring.feed(item(-60, 3)));
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn equal_timestamps_retain_insertion_order() {
        let mut ring = Ring::new(Duration::seconds(10));
        ring.feed(item(10, 1));
        ring.feed(item(10, 2));
        ring.feed(item(5, 3));
        ring.feed(item(10, 4));
        let tags: Vec<u32> = ring.iter().map(|e| e.tag).collect();
        assert_eq!(tags, vec![3, 1, 2, 4]);
    }

    #[test]
    fn sample_pool_sticky_clip_and_peak() {
        let mut pool = SamplePool::default();
        pool.reset(4);
        pool.push(1.0);
        pool.push(-3.5);
        pool.clipped = true;
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.peak_abs(), 3.5);
        assert!(pool.clipped);
        pool.clear();
        assert!(pool.is_empty());
        assert!(!pool.clipped);
    }
}
