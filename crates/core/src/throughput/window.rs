use std::collections::VecDeque;

use crate::diary::RatePoint;

/// Bounded FIFO of `(offered rate, measured throughput)` points.
///
/// The window starts with the origin so the very first secant is measured
/// against `(0, 0)`.
#[derive(Clone, Debug)]
pub(crate) struct SlidingWindow {
    points: VecDeque<RatePoint>,
    capacity: usize,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "window capacity must be positive");
        let mut points = VecDeque::with_capacity(capacity);
        points.push_back(RatePoint::ORIGIN);
        Self { points, capacity }
    }

    #[cfg(test)]
    pub fn from_points(capacity: usize, points: impl IntoIterator<Item = RatePoint>) -> Self {
        let points: VecDeque<_> = points.into_iter().collect();
        assert!(points.len() <= capacity);
        Self { points, capacity }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.points.len() >= self.capacity
    }

    /// Oldest point of the window, the start of the secant.
    ///
    /// While there is spare capacity the point stays in the window; once the
    /// window is full it is removed to make room for the next sample.
    pub fn take_start(&mut self) -> Option<RatePoint> {
        if self.is_full() {
            self.points.pop_front()
        } else {
            self.points.front().copied()
        }
    }

    pub fn push(&mut self, point: RatePoint) {
        if self.is_full() {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    /// Mean throughput over the points currently held.
    pub fn mean_throughput(&self) -> f64 {
        let sum: f64 = self.points.iter().map(|p| p.y).sum();
        sum / self.points.len() as f64
    }

    pub fn iter(&self) -> impl Iterator<Item = &RatePoint> {
        self.points.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_with_origin() {
        let mut window = SlidingWindow::new(10);
        assert_eq!(window.len(), 1);
        assert_eq!(window.take_start(), Some(RatePoint::ORIGIN));
        // peeking keeps the point in the window
        assert_eq!(window.len(), 1);
        assert_eq!(window.mean_throughput(), 0.0);
    }

    #[test]
    fn full_window_evicts_start() {
        let mut window = SlidingWindow::new(3);
        window.push(RatePoint::new(10.0, 8.0));
        window.push(RatePoint::new(20.0, 15.0));
        assert!(window.is_full());

        assert_eq!(window.take_start(), Some(RatePoint::ORIGIN));
        assert_eq!(window.len(), 2);
        assert_eq!(window.mean_throughput(), 11.5);

        window.push(RatePoint::new(30.0, 20.0));
        assert_eq!(window.len(), 3);
        assert_eq!(window.take_start(), Some(RatePoint::new(10.0, 8.0)));
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut window = SlidingWindow::new(10);
        for i in 0..100 {
            let i = i as f64;
            window.push(RatePoint::new(i, i * 2.0));
            assert!(window.len() <= window.capacity());
        }
        // FIFO order: the oldest remaining sample is the 90th one pushed
        assert_eq!(window.iter().next(), Some(&RatePoint::new(90.0, 180.0)));
        assert_eq!(window.iter().last(), Some(&RatePoint::new(99.0, 198.0)));
    }

    #[test]
    fn single_slot_window() {
        let mut window = SlidingWindow::new(1);
        assert_eq!(window.take_start(), Some(RatePoint::ORIGIN));
        assert_eq!(window.len(), 0);
        assert!(window.mean_throughput().is_nan());
        window.push(RatePoint::new(1.0, 1.0));
        assert_eq!(window.len(), 1);
    }
}
