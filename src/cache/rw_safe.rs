use std::collections::HashMap;

use parking_lot::Mutex;

use super::collection::Mergeable;

/// A buffer that accepts items and hands them all back on `read`.
pub trait BufferedData: Send {
    type Input;
    type Output;

    fn accept(&mut self, item: Self::Input);

    /// Returns every buffered item and leaves the buffer empty.
    fn read(&mut self) -> Vec<Self::Output>;
}

/// Keeps every accepted item in arrival order.
pub struct AppendBufferedData<T> {
    items: Vec<T>,
}

impl<T> Default for AppendBufferedData<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Send> BufferedData for AppendBufferedData<T> {
    type Input = T;
    type Output = T;

    fn accept(&mut self, item: T) {
        self.items.push(item);
    }

    fn read(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }
}

/// Combines accepted items by key.
pub struct MergeBufferedData<T: Mergeable> {
    items: HashMap<T::Key, T>,
}

impl<T: Mergeable> Default for MergeBufferedData<T> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
        }
    }
}

impl<T: Mergeable + Send> BufferedData for MergeBufferedData<T> {
    type Input = T;
    type Output = T;

    fn accept(&mut self, item: T) {
        match self.items.get_mut(&item.key()) {
            Some(existing) => existing.combine(item),
            None => {
                self.items.insert(item.key(), item);
            }
        }
    }

    fn read(&mut self) -> Vec<T> {
        self.items.drain().map(|(_, v)| v).collect()
    }
}

struct Buffers<B> {
    slots: [B; 2],
    write: usize,
}

/// Two buffers behind one lock: writers fill one while `read` swaps and
/// empties the other.
pub struct ReadWriteSafeCache<B: BufferedData> {
    inner: Mutex<Buffers<B>>,
}

impl<B: BufferedData + Default> Default for ReadWriteSafeCache<B> {
    fn default() -> Self {
        Self::new(B::default)
    }
}

impl<B: BufferedData> ReadWriteSafeCache<B> {
    pub fn new(make: impl Fn() -> B) -> Self {
        Self {
            inner: Mutex::new(Buffers {
                slots: [make(), make()],
                write: 0,
            }),
        }
    }

    pub fn write(&self, item: B::Input) {
        let mut inner = self.inner.lock();
        let idx = inner.write;
        inner.slots[idx].accept(item);
    }

    /// Swaps the buffers and returns everything written since the last read.
    pub fn read(&self) -> Vec<B::Output> {
        let mut inner = self.inner.lock();
        let idx = inner.write;
        inner.write = 1 - idx;
        inner.slots[idx].read()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::cache::collection::Keyed;

    #[derive(Debug, Clone, PartialEq)]
    struct Bytes {
        service: &'static str,
        total: u64,
    }

    impl Keyed for Bytes {
        type Key = &'static str;

        fn key(&self) -> &'static str {
            self.service
        }
    }

    impl Mergeable for Bytes {
        fn combine(&mut self, other: Self) {
            self.total += other.total;
        }
    }

    #[test]
    fn test_read_returns_and_clears() {
        let cache: ReadWriteSafeCache<AppendBufferedData<u32>> = ReadWriteSafeCache::default();
        cache.write(1);
        cache.write(2);

        assert_eq!(cache.read(), vec![1, 2]);
        assert!(cache.read().is_empty());

        cache.write(3);
        assert_eq!(cache.read(), vec![3]);
    }

    #[test]
    fn test_merge_buffer_combines_by_key() {
        let cache: ReadWriteSafeCache<MergeBufferedData<Bytes>> = ReadWriteSafeCache::default();
        cache.write(Bytes { service: "a", total: 10 });
        cache.write(Bytes { service: "a", total: 5 });
        cache.write(Bytes { service: "b", total: 1 });

        let mut out = cache.read();
        out.sort_by_key(|b| b.service);
        assert_eq!(
            out,
            vec![
                Bytes { service: "a", total: 15 },
                Bytes { service: "b", total: 1 },
            ]
        );
    }

    #[test]
    fn test_concurrent_writes_are_all_read() {
        let cache = Arc::new(ReadWriteSafeCache::<AppendBufferedData<u64>>::default());

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..1000 {
                        cache.write(t * 1000 + i);
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.extend(cache.read());
            thread::yield_now();
        }
        for w in writers {
            w.join().expect("writer");
        }
        seen.extend(cache.read());
        seen.extend(cache.read());

        seen.sort_unstable();
        assert_eq!(seen, (0..4000).collect::<Vec<_>>());
    }
}
