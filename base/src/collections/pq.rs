//! A keyed priority queue which pops the item with the *lowest*
//! priority first.  The emulator uses this to hold device callbacks
//! ordered by the simulated time at which they fall due.
use std::cmp::Ordering;
use std::fmt::{self, Debug, Formatter};
use std::hash::Hash;

use keyed_priority_queue::KeyedPriorityQueue;

#[derive(Debug)]
struct ReverseOrdered<T> {
    inner: T,
}

impl<T> From<T> for ReverseOrdered<T> {
    fn from(inner: T) -> ReverseOrdered<T> {
        ReverseOrdered { inner }
    }
}

impl<T: Ord> PartialOrd for ReverseOrdered<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Eq> Eq for ReverseOrdered<T> {}

impl<T: Eq> PartialEq for ReverseOrdered<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl<T: Ord> Ord for ReverseOrdered<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.inner.cmp(&self.inner)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownKeyError;

impl fmt::Display for UnknownKeyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("key is not present in the queue")
    }
}

impl std::error::Error for UnknownKeyError {}

/// Items with equal priority pop in the order in which they were
/// (most recently) pushed.  This keeps the emulator deterministic
/// when two device callbacks fall due at the same instant.
pub struct KeyedReversePriorityQueue<K: Hash + Eq, P: Ord> {
    items: KeyedPriorityQueue<K, ReverseOrdered<(P, u64)>>,
    pushes: u64,
}

impl<K, P> KeyedReversePriorityQueue<K, P>
where
    K: Hash + Eq,
    P: Ord,
{
    pub fn new() -> KeyedReversePriorityQueue<K, P> {
        KeyedReversePriorityQueue {
            items: KeyedPriorityQueue::new(),
            pushes: 0,
        }
    }

    fn next_sequence(&mut self) -> u64 {
        let seq = self.pushes;
        self.pushes += 1;
        seq
    }

    pub fn peek(&self) -> Option<(&K, &P)> {
        self.items.peek().map(|(k, p)| (k, &p.inner.0))
    }

    pub fn pop(&mut self) -> Option<(K, P)> {
        self.items.pop().map(|(k, p)| (k, p.inner.0))
    }

    /// Insert `key` with `priority`.  If the key was already present,
    /// its priority is replaced and the previous priority is
    /// returned.
    pub fn push(&mut self, key: K, priority: P) -> Option<P> {
        let seq = self.next_sequence();
        self.items
            .push(key, ReverseOrdered::from((priority, seq)))
            .map(|old| old.inner.0)
    }

    /// Remove `key` from the queue, returning its priority.
    pub fn remove(&mut self, key: &K) -> Option<P> {
        self.items.remove(key).map(|p| p.inner.0)
    }

    /// Remove every item whose key satisfies `pred`.
    pub fn remove_matching<F>(&mut self, mut pred: F) -> usize
    where
        F: FnMut(&K) -> bool,
        K: Clone,
    {
        let doomed: Vec<K> = self
            .items
            .iter()
            .filter(|(k, _)| pred(k))
            .map(|(k, _)| k.clone())
            .collect();
        for k in doomed.iter() {
            self.items.remove(k);
        }
        doomed.len()
    }

    /// Update the priority of an item (identified by `key`) in the
    /// priority queue.
    ///
    /// # Errors
    ///
    /// `Err(UnknownKeyError)` is returned when the indicated key is
    /// not present.
    pub fn set_priority(&mut self, key: &K, priority: P) -> Result<P, UnknownKeyError> {
        let seq = self.next_sequence();
        match self
            .items
            .set_priority(key, ReverseOrdered::from((priority, seq)))
        {
            Ok(old) => Ok(old.inner.0),
            Err(_) => Err(UnknownKeyError),
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.items.get_priority(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<K, P> Default for KeyedReversePriorityQueue<K, P>
where
    K: Hash + Eq,
    P: Ord,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, P> Debug for KeyedReversePriorityQueue<K, P>
where
    K: Hash + Eq + Debug,
    P: Ord + Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedReversePriorityQueue")
            .field("items", &self.items)
            .field("pushes", &self.pushes)
            .finish()
    }
}

#[test]
fn test_reverse_order() {
    assert!(ReverseOrdered::from(1) < ReverseOrdered::from(0));
    assert_eq!(ReverseOrdered::from(3), ReverseOrdered::from(3));
}

#[test]
fn test_empty() {
    let mut q: KeyedReversePriorityQueue<usize, usize> = KeyedReversePriorityQueue::default();
    assert!(q.is_empty());
    assert_eq!(0, q.len());
    assert_eq!(q.peek(), None);
    assert_eq!(q.pop(), None);
}

#[test]
fn test_lowest_priority_pops_first() {
    let mut q: KeyedReversePriorityQueue<&str, u32> = KeyedReversePriorityQueue::new();
    assert_eq!(q.push("clock", 1667), None);
    assert_eq!(q.push("console", 100), None);
    assert_eq!(q.peek(), Some((&"console", &100)));
    assert_eq!(q.pop(), Some(("console", 100)));
    assert_eq!(q.pop(), Some(("clock", 1667)));
    assert!(q.is_empty());
}

#[test]
fn test_equal_priorities_pop_in_push_order() {
    let mut q: KeyedReversePriorityQueue<char, u32> = KeyedReversePriorityQueue::new();
    q.push('b', 5);
    q.push('a', 5);
    q.push('c', 5);
    assert_eq!(q.pop(), Some(('b', 5)));
    assert_eq!(q.pop(), Some(('a', 5)));
    assert_eq!(q.pop(), Some(('c', 5)));
}

#[test]
fn test_repeat_push_replaces() {
    let mut q: KeyedReversePriorityQueue<usize, char> = KeyedReversePriorityQueue::new();
    assert_eq!(q.push(0, '2'), None);
    assert_eq!(q.push(0, '4'), Some('2'));
    assert_eq!(q.len(), 1);
    assert_eq!(q.pop(), Some((0, '4')));
}

#[test]
fn test_remove() {
    let mut q: KeyedReversePriorityQueue<(u8, u8), u32> = KeyedReversePriorityQueue::new();
    q.push((1, 0), 10);
    q.push((1, 1), 20);
    q.push((2, 0), 30);
    assert_eq!(q.remove(&(1, 1)), Some(20));
    assert_eq!(q.remove(&(1, 1)), None);
    assert!(q.contains(&(1, 0)));
    assert_eq!(q.remove_matching(|(dev, _)| *dev == 1), 1);
    assert_eq!(q.pop(), Some(((2, 0), 30)));
    assert!(q.set_priority(&(2, 0), 5).is_err());
}
