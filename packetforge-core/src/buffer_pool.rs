//! Size-bucketed pool of byte buffers with rent/return semantics.
//!
//! Buckets are powers of two from 256 B up to (and including) a configurable
//! maximum, default 64 KiB. `rent` hands out the smallest bucket that can hold
//! the request; anything larger than the top bucket allocates directly and is
//! never pooled. Buffers are returned to their bucket's free-list on drop, the
//! free-list content is left untouched unless the caller explicitly asks for
//! zeroing (crypto key material must do this).
use std::sync::{Arc, Mutex};
use zeroize::Zeroize;

/// Smallest bucket size. Requests below this still get a 256 B buffer.
const MIN_BUCKET: usize = 256;

/// Configuration for a [`BufferPool`].
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// `(bucket_size, prewarm_count)` pairs, ascending by size. Sizes need not
    /// be contiguous powers of two, but the pool works best when they are.
    pub buckets: Vec<(usize, usize)>,
    /// Frames larger than this are refused by the transport outright.
    pub max_buffer_size: usize,
    /// Soft cap on how many buffers a single bucket's free-list retains.
    pub soft_cap_per_bucket: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        let mut buckets = Vec::new();
        let mut size = MIN_BUCKET;
        while size <= 65536 {
            buckets.push((size, 0));
            size *= 2;
        }
        BufferPoolConfig {
            buckets,
            max_buffer_size: 65536,
            soft_cap_per_bucket: 64,
        }
    }
}

struct Bucket {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
    soft_cap: usize,
}

struct Inner {
    buckets: Vec<Bucket>,
    max_buffer_size: usize,
}

/// Thread-safe, size-bucketed buffer pool. Cheap to clone (an `Arc` handle).
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl BufferPool {
    /// Builds a pool from the supplied configuration, pre-warming each bucket
    /// with `prewarm_count` zeroed buffers.
    pub fn new(config: BufferPoolConfig) -> BufferPool {
        let mut buckets: Vec<Bucket> = config
            .buckets
            .iter()
            .map(|&(size, prewarm)| {
                let free = (0..prewarm).map(|_| vec![0u8; size]).collect();
                Bucket {
                    size,
                    free: Mutex::new(free),
                    soft_cap: config.soft_cap_per_bucket,
                }
            })
            .collect();
        buckets.sort_by_key(|b| b.size);

        BufferPool {
            inner: Arc::new(Inner {
                buckets,
                max_buffer_size: config.max_buffer_size,
            }),
        }
    }

    /// The configured refusal threshold for inbound frames.
    #[inline]
    pub fn max_buffer_size(&self) -> usize {
        self.inner.max_buffer_size
    }

    /// Finds the bucket index whose size is the smallest one `>= min_size`.
    fn bucket_for(&self, min_size: usize) -> Option<usize> {
        self.inner
            .buckets
            .iter()
            .position(|bucket| bucket.size >= min_size)
    }

    /// Rents a buffer of at least `min_size` bytes. Requests larger than the
    /// top bucket allocate directly and are not returned to any free-list.
    pub fn rent(&self, min_size: usize) -> PooledBuffer {
        match self.bucket_for(min_size) {
            Some(idx) => {
                let bucket = &self.inner.buckets[idx];
                let mut data = {
                    let mut free = bucket.free.lock().expect("buffer pool mutex poisoned");
                    free.pop()
                }
                .unwrap_or_else(|| vec![0u8; bucket.size]);

                if data.len() != bucket.size {
                    data.resize(bucket.size, 0);
                }

                PooledBuffer {
                    pool: Some(self.clone()),
                    bucket_idx: Some(idx),
                    data,
                    used: min_size,
                }
            }
            None => PooledBuffer {
                pool: None,
                bucket_idx: None,
                data: vec![0u8; min_size],
                used: min_size,
            },
        }
    }

    /// Returns a buffer to its bucket's free-list, without clearing its
    /// contents. Called automatically when a [`PooledBuffer`] is dropped.
    fn release(&self, bucket_idx: usize, data: Vec<u8>) {
        let bucket = &self.inner.buckets[bucket_idx];
        let mut free = bucket.free.lock().expect("buffer pool mutex poisoned");
        if free.len() < bucket.soft_cap {
            free.push(data);
        }
    }

    /// Returns a buffer to its bucket's free-list after zeroing its contents.
    /// Required before releasing buffers that held key material.
    pub fn release_zeroed(&self, mut buf: PooledBuffer) {
        buf.data.zeroize();
        // Fall through to the normal drop path, which now returns zeroed bytes.
        drop(buf);
    }
}

/// A buffer rented from a [`BufferPool`]. Returns itself to the pool's
/// free-list on drop unless it came from an oversize, unpooled allocation.
pub struct PooledBuffer {
    pool: Option<BufferPool>,
    bucket_idx: Option<usize>,
    data: Vec<u8>,
    used: usize,
}

impl PooledBuffer {
    /// The logical (requested) length, `<=` the backing bucket's capacity.
    #[inline]
    pub fn len(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Shrinks or grows the logical length within the backing capacity.
    /// Growing beyond the backing allocation's length panics.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.data.len(), "set_len exceeds backing capacity");
        self.used = len;
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.used]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.used]
    }

    /// Full backing capacity, including bytes beyond the logical length.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let (Some(pool), Some(idx)) = (self.pool.take(), self.bucket_idx) {
            let data = std::mem::take(&mut self.data);
            pool.release(idx, data);
        }
    }
}
