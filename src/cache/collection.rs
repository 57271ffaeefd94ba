use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::Hash;

use thiserror::Error;

/// An item with an identity inside a collection.
pub trait Keyed {
    type Key: Eq + Hash + Clone + Send;

    fn key(&self) -> Self::Key;
}

/// An item that can absorb another item with the same key.
///
/// `combine` must be commutative and associative over the merged fields so
/// that the drained value does not depend on arrival order.
pub trait Mergeable: Keyed {
    fn combine(&mut self, other: Self);
}

/// Operations a collection policy may not support.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CollectionError {
    #[error("{op} is not supported by the {policy} collection")]
    Unsupported {
        op: &'static str,
        policy: &'static str,
    },
}

/// Writer/reader activity markers, toggled by the owning window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub writing: bool,
    pub reading: bool,
}

/// A keyed container with a fixed insertion policy.
pub trait Collection: Send {
    type Key;
    type Item;
    /// What a key maps to: one item, or every retained item for top-N.
    type Entry: ?Sized;

    fn put(&mut self, item: Self::Item);

    fn contains_key(&self, key: &Self::Key) -> Result<bool, CollectionError>;

    fn get(&self, key: &Self::Key) -> Result<Option<&Self::Entry>, CollectionError>;

    /// Number of retained items.
    fn size(&self) -> usize;

    /// Drops every item, keeping allocated capacity.
    fn clear(&mut self);

    /// Every retained item.
    fn collection(&self) -> Vec<&Self::Item>;

    fn flags(&self) -> Flags;

    fn flags_mut(&mut self) -> &mut Flags;

    fn is_writing(&self) -> bool {
        self.flags().writing
    }

    fn is_reading(&self) -> bool {
        self.flags().reading
    }

    fn set_writing(&mut self, writing: bool) {
        self.flags_mut().writing = writing;
    }

    fn set_reading(&mut self, reading: bool) {
        self.flags_mut().reading = reading;
    }
}

/// Merge-by-key: one entry per key, later items combined into it.
pub struct MergeCollection<T: Mergeable> {
    items: HashMap<T::Key, T>,
    flags: Flags,
}

impl<T: Mergeable> MergeCollection<T> {
    pub fn new() -> Self {
        Self {
            items: HashMap::new(),
            flags: Flags::default(),
        }
    }
}

impl<T: Mergeable> Default for MergeCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Mergeable + Send> Collection for MergeCollection<T> {
    type Key = T::Key;
    type Item = T;
    type Entry = T;

    fn put(&mut self, item: T) {
        match self.items.get_mut(&item.key()) {
            Some(existing) => existing.combine(item),
            None => {
                self.items.insert(item.key(), item);
            }
        }
    }

    fn contains_key(&self, key: &T::Key) -> Result<bool, CollectionError> {
        Ok(self.items.contains_key(key))
    }

    fn get(&self, key: &T::Key) -> Result<Option<&T>, CollectionError> {
        Ok(self.items.get(key))
    }

    fn size(&self) -> usize {
        self.items.len()
    }

    fn clear(&mut self) {
        self.items.clear();
    }

    fn collection(&self) -> Vec<&T> {
        self.items.values().collect()
    }

    fn flags(&self) -> Flags {
        self.flags
    }

    fn flags_mut(&mut self) -> &mut Flags {
        &mut self.flags
    }
}

/// Append-only: every item retained in insertion order, no key lookups.
pub struct AppendCollection<T> {
    items: Vec<T>,
    flags: Flags,
}

impl<T> AppendCollection<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            flags: Flags::default(),
        }
    }
}

impl<T> Default for AppendCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Collection for AppendCollection<T> {
    type Key = ();
    type Item = T;
    type Entry = T;

    fn put(&mut self, item: T) {
        self.items.push(item);
    }

    fn contains_key(&self, _key: &()) -> Result<bool, CollectionError> {
        Err(CollectionError::Unsupported {
            op: "contains_key",
            policy: "append",
        })
    }

    fn get(&self, _key: &()) -> Result<Option<&T>, CollectionError> {
        Err(CollectionError::Unsupported {
            op: "get",
            policy: "append",
        })
    }

    fn size(&self) -> usize {
        self.items.len()
    }

    fn clear(&mut self) {
        self.items.clear();
    }

    fn collection(&self) -> Vec<&T> {
        self.items.iter().collect()
    }

    fn flags(&self) -> Flags {
        self.flags
    }

    fn flags_mut(&mut self) -> &mut Flags {
        &mut self.flags
    }
}

/// Bounded top-N per key, ordered by a caller comparator (largest first).
pub struct TopNCollection<T: Keyed> {
    items: HashMap<T::Key, Vec<T>>,
    capacity: usize,
    compare: fn(&T, &T) -> Ordering,
    len: usize,
    flags: Flags,
}

impl<T: Keyed> TopNCollection<T> {
    /// Keeps at most `capacity` items per key (at least one).
    pub fn new(capacity: usize, compare: fn(&T, &T) -> Ordering) -> Self {
        Self {
            items: HashMap::new(),
            capacity: capacity.max(1),
            compare,
            len: 0,
            flags: Flags::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Keyed + Send> Collection for TopNCollection<T> {
    type Key = T::Key;
    type Item = T;
    type Entry = [T];

    fn put(&mut self, item: T) {
        let compare = self.compare;
        let ranked = self.items.entry(item.key()).or_default();

        if ranked.len() >= self.capacity {
            match ranked.last() {
                Some(smallest) if compare(&item, smallest) != Ordering::Greater => return,
                _ => {
                    ranked.pop();
                    self.len -= 1;
                }
            }
        }

        let at = ranked.partition_point(|existing| compare(existing, &item) != Ordering::Less);
        ranked.insert(at, item);
        self.len += 1;
    }

    fn contains_key(&self, key: &T::Key) -> Result<bool, CollectionError> {
        Ok(self.items.contains_key(key))
    }

    fn get(&self, key: &T::Key) -> Result<Option<&[T]>, CollectionError> {
        Ok(self.items.get(key).map(Vec::as_slice))
    }

    fn size(&self) -> usize {
        self.len
    }

    fn clear(&mut self) {
        self.items.clear();
        self.len = 0;
    }

    fn collection(&self) -> Vec<&T> {
        self.items.values().flatten().collect()
    }

    fn flags(&self) -> Flags {
        self.flags
    }

    fn flags_mut(&mut self) -> &mut Flags {
        &mut self.flags
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Count {
        key: &'static str,
        value: u64,
    }

    impl Keyed for Count {
        type Key = &'static str;

        fn key(&self) -> &'static str {
            self.key
        }
    }

    impl Mergeable for Count {
        fn combine(&mut self, other: Self) {
            self.value += other.value;
        }
    }

    fn by_value(a: &Count, b: &Count) -> Ordering {
        a.value.cmp(&b.value)
    }

    fn count(key: &'static str, value: u64) -> Count {
        Count { key, value }
    }

    #[test]
    fn test_merge_combines_same_key() {
        let mut c = MergeCollection::new();
        c.put(count("a", 1));
        c.put(count("b", 2));
        c.put(count("a", 3));

        assert_eq!(c.size(), 2);
        assert_eq!(c.get(&"a").expect("get"), Some(&count("a", 4)));
        assert!(c.contains_key(&"b").expect("contains"));
        assert!(!c.contains_key(&"z").expect("contains"));
    }

    #[test]
    fn test_append_keeps_every_item_and_refuses_lookups() {
        let mut c = AppendCollection::new();
        c.put(count("a", 1));
        c.put(count("a", 1));

        assert_eq!(c.size(), 2);
        assert_eq!(c.collection(), vec![&count("a", 1), &count("a", 1)]);

        let err = c.contains_key(&()).unwrap_err();
        assert_eq!(err.to_string(), "contains_key is not supported by the append collection");
        assert!(c.get(&()).is_err());
    }

    #[test]
    fn test_top_n_keeps_largest_in_descending_order() {
        let mut c = TopNCollection::new(3, by_value);
        for v in [5, 1, 9, 7, 3, 8] {
            c.put(count("svc", v));
        }
        c.put(count("other", 2));

        let values: Vec<u64> = c
            .get(&"svc")
            .expect("get")
            .expect("present")
            .iter()
            .map(|x| x.value)
            .collect();
        assert_eq!(values, vec![9, 8, 7]);
        assert_eq!(c.size(), 4);
    }

    #[test]
    fn test_top_n_discards_candidate_equal_to_smallest() {
        let mut c = TopNCollection::new(2, by_value);
        c.put(count("svc", 5));
        c.put(count("svc", 4));
        c.put(count("svc", 4));

        let values: Vec<u64> = c
            .get(&"svc")
            .expect("get")
            .expect("present")
            .iter()
            .map(|x| x.value)
            .collect();
        assert_eq!(values, vec![5, 4]);
    }

    #[test]
    fn test_clear_resets_size_and_keeps_flags() {
        let mut c = TopNCollection::new(2, by_value);
        c.put(count("svc", 1));
        c.set_reading(true);
        c.clear();

        assert_eq!(c.size(), 0);
        assert!(c.collection().is_empty());
        assert!(c.is_reading());
        assert!(!c.is_writing());
    }

    proptest! {
        #[test]
        fn prop_merge_is_order_independent(
            values in proptest::collection::vec((0usize..4, 0u64..1000), 0..64),
        ) {
            const KEYS: [&str; 4] = ["a", "b", "c", "d"];

            let mut forward = MergeCollection::new();
            for (k, v) in &values {
                forward.put(count(KEYS[*k], *v));
            }

            let mut backward = MergeCollection::new();
            for (k, v) in values.iter().rev() {
                backward.put(count(KEYS[*k], *v));
            }

            for key in KEYS {
                let expected: u64 = values
                    .iter()
                    .filter(|(k, _)| KEYS[*k] == key)
                    .map(|(_, v)| v)
                    .sum();
                let got = forward.get(&key).expect("get").map(|c| c.value);
                prop_assert_eq!(got, backward.get(&key).expect("get").map(|c| c.value));
                if values.iter().any(|(k, _)| KEYS[*k] == key) {
                    prop_assert_eq!(got, Some(expected));
                } else {
                    prop_assert_eq!(got, None);
                }
            }
        }

        #[test]
        fn prop_top_n_matches_sorted_prefix(
            values in proptest::collection::vec(0u64..1000, 0..128),
            n in 1usize..10,
        ) {
            let mut c = TopNCollection::new(n, by_value);
            for v in &values {
                c.put(count("svc", *v));
            }

            let mut expected = values.clone();
            expected.sort_unstable_by(|a, b| b.cmp(a));
            expected.truncate(n);

            let got: Vec<u64> = c
                .get(&"svc")
                .expect("get")
                .map(|items| items.iter().map(|x| x.value).collect())
                .unwrap_or_default();
            prop_assert_eq!(got, expected);
            prop_assert!(c.size() <= n);
        }
    }
}
