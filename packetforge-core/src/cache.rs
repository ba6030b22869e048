//! Outgoing-frame dedup cache and bounded incoming FIFO buffer.
//!
//! Neither cache is durable; both exist purely to bound memory and give the
//! transport a cheap observability hook, not to guarantee exactly-once
//! delivery.
use lru::LruCache;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Bytes used from the head/tail of a payload to build a dedup key, mirroring
/// [`dedup_key`]'s "first 4 ‖ last 5" rule.
const DEDUP_HEAD: usize = 4;
const DEDUP_TAIL: usize = 5;

/// Builds the short dedup key the transport consults before sending: the
/// first 4 and last 5 bytes of `payload`, or the whole payload verbatim if
/// shorter than 9 bytes.
pub fn dedup_key(payload: &[u8]) -> Vec<u8> {
    if payload.len() < DEDUP_HEAD + DEDUP_TAIL {
        return payload.to_vec();
    }
    let mut key = Vec::with_capacity(DEDUP_HEAD + DEDUP_TAIL);
    key.extend_from_slice(&payload[..DEDUP_HEAD]);
    key.extend_from_slice(&payload[payload.len() - DEDUP_TAIL..]);
    key
}

/// Thread-safe bounded cache of recently observed `(key, bytes)` pairs,
/// evicting least-recently-used entries once `capacity` is exceeded.
pub struct BinaryCache {
    inner: Mutex<LruCache<Vec<u8>, Vec<u8>>>,
}

impl BinaryCache {
    pub fn new(capacity: usize) -> BinaryCache {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity must be nonzero");
        BinaryCache {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Looks up `key`, promoting it to most-recently-used on a hit.
    pub fn try_get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().expect("binary cache mutex poisoned");
        inner.get(key).cloned()
    }

    /// Inserts or refreshes `key`, evicting the LRU entry if at capacity.
    pub fn put(&self, key: Vec<u8>, bytes: Vec<u8>) {
        let mut inner = self.inner.lock().expect("binary cache mutex poisoned");
        inner.put(key, bytes);
    }

    /// Current number of entries held.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("binary cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Thread-safe bounded FIFO. Pushing past `capacity` silently drops the
/// oldest item rather than rejecting the new one.
pub struct FifoCache<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> FifoCache<T> {
    pub fn new(capacity: usize) -> FifoCache<T> {
        FifoCache {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Pushes `item`, dropping the oldest entry first if already at capacity.
    pub fn add(&self, item: T) {
        let mut inner = self.inner.lock().expect("fifo cache mutex poisoned");
        if inner.len() >= self.capacity {
            inner.pop_front();
        }
        inner.push_back(item);
    }

    /// Pops the oldest item, if any.
    pub fn try_get(&self) -> Option<T> {
        let mut inner = self.inner.lock().expect("fifo cache mutex poisoned");
        inner.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("fifo cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_uses_head_and_tail_for_long_payloads() {
        let payload = b"0123456789ABCDEF";
        let key = dedup_key(payload);
        assert_eq!(key, b"0123CDEF");
    }

    #[test]
    fn dedup_key_uses_whole_payload_when_short() {
        let payload = b"short";
        assert_eq!(dedup_key(payload), payload.to_vec());
    }

    #[test]
    fn binary_cache_evicts_lru_entry() {
        let cache = BinaryCache::new(2);
        cache.put(b"a".to_vec(), b"1".to_vec());
        cache.put(b"b".to_vec(), b"2".to_vec());
        cache.try_get(b"a"); // promote "a"
        cache.put(b"c".to_vec(), b"3".to_vec()); // evicts "b"

        assert!(cache.try_get(b"a").is_some());
        assert!(cache.try_get(b"b").is_none());
        assert!(cache.try_get(b"c").is_some());
    }

    #[test]
    fn fifo_cache_drops_oldest_on_overflow() {
        let cache: FifoCache<u32> = FifoCache::new(2);
        cache.add(1);
        cache.add(2);
        cache.add(3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.try_get(), Some(2));
        assert_eq!(cache.try_get(), Some(3));
        assert_eq!(cache.try_get(), None);
    }

    use proptest::prelude::*;

    proptest! {
        /// Identical payloads always produce identical dedup keys.
        #[test]
        fn dedup_key_is_deterministic(payload in proptest::collection::vec(any::<u8>(), 0..256)) {
            prop_assert_eq!(dedup_key(&payload), dedup_key(&payload));
        }

        /// Payloads long enough to use the head/tail rule that differ only in
        /// their first 4 or last 5 bytes produce different keys.
        #[test]
        fn dedup_key_differs_when_head_or_tail_differs(
            mut payload in proptest::collection::vec(any::<u8>(), 16..256),
            flip_in_tail: bool,
        ) {
            let original_key = dedup_key(&payload);
            if flip_in_tail {
                let last = payload.len() - 1;
                payload[last] ^= 0xFF;
            } else {
                payload[0] ^= 0xFF;
            }
            prop_assert_ne!(original_key, dedup_key(&payload));
        }
    }
}
