use itertools::Itertools;
use std::collections::VecDeque;

pub(crate) const DEFAULT_VOTE_WINDOW: usize = 10;

/// Majority vote over the most recent class predictions.
///
/// Ties go to the tied class that was pushed most recently.
#[derive(Debug, Clone)]
pub(crate) struct PredictionAggregator {
    capacity: usize,
    window: VecDeque<usize>,
}

impl Default for PredictionAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_VOTE_WINDOW)
    }
}

impl PredictionAggregator {
    /// A window of at least one entry.
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            window: VecDeque::with_capacity(capacity + 1),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.window.len()
    }

    pub(crate) fn push(&mut self, class: usize) -> usize {
        self.window.push_back(class);
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }
        self.vote().unwrap_or(class)
    }

    pub(crate) fn vote(&self) -> Option<usize> {
        let counts = self.window.iter().copied().counts();
        let best = counts.values().copied().max()?;
        self.window
            .iter()
            .rev()
            .copied()
            .find(|class| counts.get(class) == Some(&best))
    }
}
