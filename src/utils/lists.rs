/// Per-state membership lists ordered by transition time
///
/// Every member belongs to exactly one list. Moving a member appends it at
/// the tail of its new list, so each list stays ordered oldest-first and
/// timeout sweeps can stop at the first entry that has not expired.
use fnv::FnvHashMap;
use std::collections::BTreeMap;
use std::hash::Hash;

#[derive(Debug)]
pub struct StateLists<S, K> {
    lists: FnvHashMap<S, BTreeMap<u64, K>>,
    index: FnvHashMap<K, (S, u64)>,
    seq: u64,
}

impl<S, K> Default for StateLists<S, K> {
    fn default() -> Self {
        Self {
            lists: FnvHashMap::default(),
            index: FnvHashMap::default(),
            seq: 0,
        }
    }
}

impl<S, K> StateLists<S, K>
where
    S: Copy + Eq + Hash,
    K: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `key` to the tail of `state`'s list, inserting it if new.
    /// Returns the previous state.
    pub fn move_to_tail(&mut self, key: K, state: S) -> Option<S> {
        let previous = self.unlink(key);
        self.seq += 1;
        self.lists.entry(state).or_default().insert(self.seq, key);
        self.index.insert(key, (state, self.seq));
        previous
    }

    /// Remove `key` from whichever list holds it
    pub fn remove(&mut self, key: K) -> Option<S> {
        let previous = self.unlink(key);
        self.index.remove(&key);
        previous
    }

    pub fn state_of(&self, key: K) -> Option<S> {
        self.index.get(&key).map(|(state, _)| *state)
    }

    pub fn contains(&self, key: K) -> bool {
        self.index.contains_key(&key)
    }

    pub fn len(&self, state: S) -> usize {
        self.lists.get(&state).map_or(0, BTreeMap::len)
    }

    /// Total number of members across all lists
    pub fn total(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn front(&self, state: S) -> Option<K> {
        self.lists
            .get(&state)
            .and_then(|list| list.values().next().copied())
    }

    /// Members of `state`, oldest first
    pub fn iter(&self, state: S) -> impl Iterator<Item = K> + '_ {
        self.lists
            .get(&state)
            .into_iter()
            .flat_map(|list| list.values().copied())
    }

    /// Up to `n` members of `state`, oldest first
    pub fn head(&self, state: S, n: usize) -> Vec<K> {
        self.iter(state).take(n).collect()
    }

    fn unlink(&mut self, key: K) -> Option<S> {
        let (state, seq) = *self.index.get(&key)?;
        if let Some(list) = self.lists.get_mut(&state) {
            list.remove(&seq);
        }
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Color {
        Red,
        Blue,
    }

    #[test]
    fn test_move_keeps_single_membership() {
        let mut lists = StateLists::new();
        lists.move_to_tail(1, Color::Red);
        lists.move_to_tail(2, Color::Red);
        assert_eq!(lists.move_to_tail(1, Color::Blue), Some(Color::Red));

        assert_eq!(lists.len(Color::Red), 1);
        assert_eq!(lists.len(Color::Blue), 1);
        assert_eq!(lists.total(), 2);
        assert_eq!(lists.state_of(1), Some(Color::Blue));
    }

    #[test]
    fn test_tail_order() {
        let mut lists = StateLists::new();
        for k in [3, 1, 2] {
            lists.move_to_tail(k, Color::Red);
        }
        // Re-entering the same state moves to the tail.
        lists.move_to_tail(3, Color::Red);
        assert_eq!(lists.iter(Color::Red).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(lists.front(Color::Red), Some(1));
        assert_eq!(lists.head(Color::Red, 2), vec![1, 2]);
        assert!(lists.head(Color::Blue, 2).is_empty());
    }

    #[test]
    fn test_remove() {
        let mut lists = StateLists::new();
        lists.move_to_tail(7, Color::Blue);
        assert_eq!(lists.remove(7), Some(Color::Blue));
        assert_eq!(lists.remove(7), None);
        assert!(lists.is_empty());
        assert_eq!(lists.len(Color::Blue), 0);
    }
}
