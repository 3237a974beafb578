//! Sliding-window median smoothing of per-frame counts.
//!
//! One `DetectionSmoother` belongs to one observation stream (a relay
//! session, or a poll lineage that opts in). There is no process-wide
//! instance; each session constructs and owns its own.

use std::collections::VecDeque;

use crate::model::ObservationCounts;

pub const WINDOW_CAPACITY: usize = 5;

/// Fixed-capacity FIFO of counts for one tracked class.
#[derive(Clone, Debug, Default)]
pub struct CountWindow {
    values: VecDeque<u32>,
}

impl CountWindow {
    pub fn new() -> Self {
        Self {
            values: VecDeque::with_capacity(WINDOW_CAPACITY),
        }
    }

    pub fn push(&mut self, value: u32) {
        if self.values.len() == WINDOW_CAPACITY {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    /// Median of the window; lower-middle element on even sizes, 0 when empty.
    pub fn median(&self) -> u32 {
        if self.values.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u32> = self.values.iter().copied().collect();
        sorted.sort_unstable();
        sorted[(sorted.len() - 1) / 2]
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = u32> + '_ {
        self.values.iter().copied()
    }
}

#[derive(Clone, Debug, Default)]
pub struct DetectionSmoother {
    people: CountWindow,
    buses: CountWindow,
}

impl DetectionSmoother {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, raw: ObservationCounts) {
        self.people.push(raw.people);
        self.buses.push(raw.buses);
    }

    pub fn smoothed(&self) -> ObservationCounts {
        ObservationCounts {
            people: self.people.median(),
            buses: self.buses.median(),
        }
    }

    /// Record and return the smoothed reading in one step.
    pub fn observe(&mut self, raw: ObservationCounts) -> ObservationCounts {
        self.record(raw);
        self.smoothed()
    }

    pub fn samples(&self) -> usize {
        self.people.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people(n: u32) -> ObservationCounts {
        ObservationCounts { people: n, buses: 0 }
    }

    #[test]
    fn median_suppresses_single_outlier() {
        let mut smoother = DetectionSmoother::new();
        for n in [2, 2, 9, 2, 2] {
            smoother.record(people(n));
        }
        assert_eq!(smoother.smoothed().people, 2);
    }

    #[test]
    fn sixth_value_evicts_oldest() {
        let mut window = CountWindow::new();
        for n in [1, 2, 3, 4, 5] {
            window.push(n);
        }
        window.push(6);
        assert_eq!(window.len(), WINDOW_CAPACITY);
        assert_eq!(window.values().collect::<Vec<_>>(), vec![2, 3, 4, 5, 6]);
        assert_eq!(window.median(), 4);
    }

    #[test]
    fn even_window_takes_lower_middle_and_empty_is_zero() {
        let mut window = CountWindow::new();
        assert_eq!(window.median(), 0);
        for n in [7, 1, 5, 3] {
            window.push(n);
        }
        assert_eq!(window.median(), 3);
    }

    #[test]
    fn step_change_passes_after_three_samples() {
        let mut smoother = DetectionSmoother::new();
        for _ in 0..5 {
            smoother.record(people(1));
        }
        assert_eq!(smoother.observe(people(8)).people, 1);
        assert_eq!(smoother.observe(people(8)).people, 1);
        assert_eq!(smoother.observe(people(8)).people, 8);
    }

    #[test]
    fn sessions_do_not_share_state() {
        let mut a = DetectionSmoother::new();
        let mut b = DetectionSmoother::new();
        a.record(people(10));
        b.record(people(1));
        assert_eq!(a.smoothed().people, 10);
        assert_eq!(b.smoothed().people, 1);
    }
}
