use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// A symmetric binary relation recording which pairs of items are mutually
/// exclusive. Self-conflicts (`add(x, x)`) are permitted and meaningful:
/// they mark an item that cannot be used at all.
#[derive(Debug, Clone)]
pub struct ConflictMap<T: Eq + Hash + Copy> {
    edges: HashMap<T, HashSet<T>>,
}

impl<T: Eq + Hash + Copy> Default for ConflictMap<T> {
    fn default() -> Self {
        Self {
            edges: HashMap::new(),
        }
    }
}

impl<T: Eq + Hash + Copy> ConflictMap<T> {
    /// Creates an empty conflict map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `a` and `b` conflict. Returns true if the pair was not
    /// already present.
    pub fn add(&mut self, a: T, b: T) -> bool {
        let inserted = self.edges.entry(a).or_default().insert(b);
        self.edges.entry(b).or_default().insert(a);
        inserted
    }

    /// Removes the conflict between `a` and `b`, if present. Items left
    /// without any conflicts are forgotten entirely.
    pub fn remove_pair(&mut self, a: T, b: T) {
        for (from, to) in [(a, b), (b, a)] {
            if let Some(set) = self.edges.get_mut(&from) {
                set.remove(&to);
                if set.is_empty() {
                    self.edges.remove(&from);
                }
            }
        }
    }

    /// Removes every conflict incident to `a`.
    pub fn remove(&mut self, a: T) {
        if let Some(others) = self.edges.remove(&a) {
            for other in others {
                if let Some(set) = self.edges.get_mut(&other) {
                    set.remove(&a);
                    if set.is_empty() {
                        self.edges.remove(&other);
                    }
                }
            }
        }
    }

    /// Returns true if `a` and `b` conflict.
    pub fn in_conflict(&self, a: T, b: T) -> bool {
        self.edges
            .get(&a)
            .map_or(false, |set| set.contains(&b))
    }

    /// Returns true if `a` participates in any conflict.
    pub fn has_conflict(&self, a: T) -> bool {
        self.edges.get(&a).map_or(false, |set| !set.is_empty())
    }

    /// The items `a` conflicts with.
    pub fn conflicts(&self, a: T) -> impl Iterator<Item = T> + '_ {
        self.edges.get(&a).into_iter().flatten().copied()
    }

    /// The number of items that participate in at least one conflict.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Returns true if no conflicts are recorded.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::ConflictMap;

    #[test]
    fn test_symmetry() {
        let mut map = ConflictMap::new();
        assert!(map.add(1, 2));
        assert!(!map.add(1, 2));
        assert!(map.in_conflict(1, 2));
        assert!(map.in_conflict(2, 1));

        map.add(2, 3);
        map.remove_pair(2, 1);
        assert!(!map.in_conflict(1, 2));
        assert!(!map.in_conflict(2, 1));
        assert!(!map.has_conflict(1));
        assert!(map.in_conflict(3, 2));
    }

    #[test]
    fn test_remove_all_incident() {
        let mut map = ConflictMap::new();
        map.add(1, 2);
        map.add(1, 3);
        map.add(2, 3);

        map.remove(1);
        assert!(!map.has_conflict(1));
        assert!(!map.in_conflict(1, 2));
        assert!(!map.in_conflict(3, 1));
        assert!(map.in_conflict(2, 3));
    }

    #[test]
    fn test_self_conflict() {
        let mut map = ConflictMap::new();
        map.add(7, 7);
        assert!(map.in_conflict(7, 7));
        assert!(map.has_conflict(7));
        map.remove(7);
        assert!(map.is_empty());
    }
}
