use std::collections::{HashSet, VecDeque};

/// Bounded window of the most recent server message ids seen in one scope.
#[derive(Debug)]
pub(crate) struct SeenIds {
    capacity: usize,
    order: VecDeque<u64>,
    members: HashSet<u64>,
}

impl SeenIds {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.members.contains(&id)
    }

    /// Records `id`; returns false if it was already inside the window.
    pub(crate) fn insert(&mut self, id: u64) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_repeated_ids() {
        let mut seen = SeenIds::new(4);
        assert!(seen.insert(10));
        assert!(!seen.insert(10));
        assert!(seen.contains(10));
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut seen = SeenIds::new(3);
        for id in 1..=4 {
            assert!(seen.insert(id));
        }
        assert!(!seen.contains(1));
        assert!(seen.contains(2));
        assert!(seen.contains(4));
        // Evicted ids are accepted again.
        assert!(seen.insert(1));
        assert!(!seen.contains(2));
    }
}
