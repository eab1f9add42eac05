use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use tunetrail_core::Impression;

/// Bounded in-process buffer between request handlers and the background
/// impression flusher.
///
/// Producers never block: on overflow the oldest entry is dropped and the
/// drop counter incremented. The mutex is held only across queue
/// operations, never across I/O.
#[derive(Debug)]
pub struct ImpressionBuffer {
    inner: Mutex<VecDeque<Impression>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl ImpressionBuffer {
    /// Create a buffer holding at most `capacity` impressions.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue one impression, dropping the oldest on overflow.
    pub fn push(&self, impression: Impression) {
        let mut queue = self.inner.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(impression);
    }

    /// Enqueue a batch of impressions.
    pub fn push_all(&self, impressions: impl IntoIterator<Item = Impression>) {
        let mut queue = self.inner.lock();
        for impression in impressions {
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(impression);
        }
    }

    /// Dequeue up to `max` impressions, oldest first.
    #[must_use]
    pub fn drain(&self, max: usize) -> Vec<Impression> {
        let mut queue = self.inner.lock();
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    /// Current queue depth.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Total impressions dropped on overflow since startup.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tunetrail_core::{RecommendationId, TrackId, UserId};

    use super::*;

    fn impression(n: u32) -> Impression {
        Impression {
            id: format!("imp-{n}"),
            user_id: UserId::new("usr-1"),
            track_id: TrackId::new(format!("trk-{n}")),
            recommendation_id: RecommendationId::new(format!("rec-{n}")),
            model_type: "collaborative".to_owned(),
            model_version: "1".to_owned(),
            score: 0.5,
            position: n,
            context: "user_personal".to_owned(),
            shown_at: Utc::now(),
            clicked: false,
            played: false,
            liked: false,
        }
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let buffer = ImpressionBuffer::new(2);
        buffer.push(impression(1));
        buffer.push(impression(2));
        buffer.push(impression(3));

        assert_eq!(buffer.dropped_count(), 1);
        let drained = buffer.drain(10);
        let ids: Vec<&str> = drained.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["imp-2", "imp-3"]);
    }

    #[test]
    fn drain_respects_max_and_order() {
        let buffer = ImpressionBuffer::new(10);
        for n in 1..=5 {
            buffer.push(impression(n));
        }
        let first = buffer.drain(2);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, "imp-1");
        assert_eq!(buffer.len(), 3);
    }
}
