//! Bounded memory of recently handled log entry ids.

use std::collections::{HashSet, VecDeque};

use chorus_core::DeliveryId;

/// Remembers the last `capacity` delivery ids, evicting the oldest first.
#[derive(Debug)]
pub struct DedupWindow {
    order: VecDeque<DeliveryId>,
    seen: HashSet<DeliveryId>,
    capacity: usize,
}

impl DedupWindow {
    /// Window holding at most `capacity` ids. Zero disables it.
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(1024)),
            seen: HashSet::new(),
            capacity,
        }
    }

    /// Whether `id` is in the window.
    pub fn contains(&self, id: &DeliveryId) -> bool {
        self.seen.contains(id)
    }

    /// Record `id`. Returns `false` if it was already present.
    pub fn insert(&mut self, id: DeliveryId) -> bool {
        if self.capacity == 0 || self.seen.contains(&id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                let _ = self.seen.remove(&oldest);
            }
        }
        let _ = self.seen.insert(id.clone());
        self.order.push_back(id);
        true
    }

    /// Ids currently held.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remembers_inserted_ids() {
        let mut window = DedupWindow::new(4);
        assert!(window.insert(DeliveryId::new(1, 0)));
        assert!(window.contains(&DeliveryId::new(1, 0)));
        assert!(!window.insert(DeliveryId::new(1, 0)));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let mut window = DedupWindow::new(2);
        let _ = window.insert(DeliveryId::new(1, 0));
        let _ = window.insert(DeliveryId::new(2, 0));
        let _ = window.insert(DeliveryId::new(3, 0));
        assert!(!window.contains(&DeliveryId::new(1, 0)));
        assert!(window.contains(&DeliveryId::new(2, 0)));
        assert!(window.contains(&DeliveryId::new(3, 0)));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn zero_capacity_remembers_nothing() {
        let mut window = DedupWindow::new(0);
        assert!(!window.insert(DeliveryId::new(1, 0)));
        assert!(window.is_empty());
    }
}
