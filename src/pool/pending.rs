//! Priority-then-FIFO queue of pending socket requests.
//!
//! Entries live in a map keyed by request id; each priority has a FIFO of
//! ids. Removing by id is O(1): the map entry goes away and the stale id is
//! skipped (and compacted away) when the FIFO is next walked.

use std::collections::{HashMap, VecDeque};

use crate::pool::priority::RequestPriority;

/// Identity of one queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

#[derive(Debug)]
pub(crate) struct PendingQueue<T> {
    entries: HashMap<RequestId, (RequestPriority, T)>,
    fifos: [VecDeque<RequestId>; 6],
    stale: usize,
}

impl<T> Default for PendingQueue<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            fifos: Default::default(),
            stale: 0,
        }
    }
}

impl<T> PendingQueue<T> {
    pub fn push(&mut self, id: RequestId, priority: RequestPriority, value: T) {
        self.entries.insert(id, (priority, value));
        self.fifos[priority.index()].push_back(id);
    }

    pub fn remove(&mut self, id: RequestId) -> Option<T> {
        let (_, value) = self.entries.remove(&id)?;
        self.stale += 1;
        if self.stale > 32 && self.stale > self.entries.len() {
            self.compact();
        }
        Some(value)
    }

    /// Highest priority, earliest queued entry.
    pub fn pop(&mut self) -> Option<(RequestId, T)> {
        for fifo in self.fifos.iter_mut().rev() {
            while let Some(id) = fifo.pop_front() {
                if let Some((_, value)) = self.entries.remove(&id) {
                    return Some((id, value));
                }
                self.stale = self.stale.saturating_sub(1);
            }
        }
        None
    }

    /// Like [`pop`](Self::pop), but only among entries `accept` takes.
    pub fn pop_first(&mut self, accept: impl Fn(&T) -> bool) -> Option<(RequestId, T)> {
        let id = self
            .fifos
            .iter()
            .rev()
            .flat_map(|fifo| fifo.iter())
            .find(|id| self.entries.get(id).is_some_and(|(_, value)| accept(value)))
            .copied()?;
        self.remove(id).map(|value| (id, value))
    }

    /// The entry `pop` would return.
    pub fn peek(&self) -> Option<&T> {
        self.fifos
            .iter()
            .rev()
            .flat_map(|fifo| fifo.iter())
            .find_map(|id| self.entries.get(id).map(|(_, value)| value))
    }

    /// Priority of the entry `pop` would return.
    pub fn top_priority(&self) -> Option<RequestPriority> {
        RequestPriority::ALL
            .iter()
            .rev()
            .find(|p| self.fifos[p.index()].iter().any(|id| self.entries.contains_key(id)))
            .copied()
    }

    pub fn any(&self, accept: impl Fn(&T) -> bool) -> bool {
        self.entries.values().any(|(_, value)| accept(value))
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry in service order.
    pub fn drain(&mut self) -> Vec<(RequestId, T)> {
        let mut out = Vec::with_capacity(self.entries.len());
        while let Some(entry) = self.pop() {
            out.push(entry);
        }
        self.stale = 0;
        out
    }

    fn compact(&mut self) {
        for fifo in self.fifos.iter_mut() {
            fifo.retain(|id| self.entries.contains_key(id));
        }
        self.stale = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RequestPriority::*;

    fn queue(items: &[(u64, RequestPriority)]) -> PendingQueue<u64> {
        let mut q = PendingQueue::default();
        for &(id, p) in items {
            q.push(RequestId(id), p, id);
        }
        q
    }

    #[test]
    fn priority_then_fifo() {
        let mut q = queue(&[(1, Low), (2, Highest), (3, Low), (4, Medium), (5, Highest)]);
        let order: Vec<u64> = q.drain().into_iter().map(|(_, v)| v).collect();
        assert_eq!(order, vec![2, 5, 4, 1, 3]);
    }

    #[test]
    fn removal_keeps_relative_order() {
        let mut q = queue(&[(1, Low), (2, Low), (3, Low), (4, Low)]);
        assert_eq!(q.remove(RequestId(2)), Some(2));
        assert_eq!(q.remove(RequestId(2)), None);
        assert_eq!(q.len(), 3);
        assert!(!q.contains(RequestId(2)));
        let order: Vec<u64> = q.drain().into_iter().map(|(_, v)| v).collect();
        assert_eq!(order, vec![1, 3, 4]);
    }

    #[test]
    fn pop_first_skips_rejected_entries() {
        let mut q = queue(&[(1, Low), (2, Highest), (3, Medium), (4, Medium)]);
        let odd = q.pop_first(|v| v % 2 == 1).map(|(_, v)| v);
        assert_eq!(odd, Some(3));
        assert_eq!(q.pop_first(|v| *v > 10), None);
        let order: Vec<u64> = q.drain().into_iter().map(|(_, v)| v).collect();
        assert_eq!(order, vec![2, 4, 1]);
    }

    #[test]
    fn peek_matches_pop() {
        let mut q = queue(&[(1, Low), (2, Medium)]);
        assert_eq!(q.peek(), Some(&2));
        q.remove(RequestId(2));
        assert_eq!(q.peek(), Some(&1));
        assert_eq!(q.pop().map(|(_, v)| v), Some(1));
        assert_eq!(q.peek(), None);
    }

    #[test]
    fn top_priority_skips_removed() {
        let mut q = queue(&[(1, Lowest), (2, Highest)]);
        assert_eq!(q.top_priority(), Some(Highest));
        q.remove(RequestId(2));
        assert_eq!(q.top_priority(), Some(Lowest));
    }

    #[test]
    fn compaction_under_heavy_cancellation() {
        let mut q = PendingQueue::default();
        for i in 0..200 {
            q.push(RequestId(i), Medium, i);
        }
        for i in 0..199 {
            q.remove(RequestId(i));
        }
        assert_eq!(q.pop(), Some((RequestId(199), 199)));
        assert!(q.is_empty());
    }
}
