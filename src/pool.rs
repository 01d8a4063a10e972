//! Fixed-block memory pool for tensor payloads.
//!
//! Blocks are recycled for the pipeline's running lifetime: an exhausted
//! freelist grows the pool, and returned blocks go back on the freelist
//! rather than to the allocator. `PoolBlock` returns itself on drop, so a
//! tensor referencing pool memory recycles its block when its frame is torn
//! down.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};

struct PoolInner {
    block_size: usize,
    free: Mutex<PoolState>,
}

struct PoolState {
    list: Vec<Box<[u8]>>,
    total: usize,
}

/// Growable freelist of fixed-size byte blocks.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

impl MemoryPool {
    /// Pre-allocate `pool_size` blocks of `block_size` bytes each.
    pub fn new(block_size: usize, pool_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(anyhow!("memory pool block size must be non-zero"));
        }
        let list = (0..pool_size)
            .map(|_| vec![0u8; block_size].into_boxed_slice())
            .collect::<Vec<_>>();
        Ok(Self {
            inner: Arc::new(PoolInner {
                block_size,
                free: Mutex::new(PoolState {
                    list,
                    total: pool_size,
                }),
            }),
        })
    }

    /// Take a block from the freelist, growing the pool if it is empty.
    pub fn allocate(&self) -> PoolBlock {
        let mut state = self.inner.free.lock().expect("pool mutex poisoned");
        let data = match state.list.pop() {
            Some(block) => block,
            None => {
                state.total += 1;
                vec![0u8; self.inner.block_size].into_boxed_slice()
            }
        };
        PoolBlock {
            data: Some(data),
            pool: Arc::clone(&self.inner),
        }
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    pub fn free_blocks(&self) -> usize {
        self.inner.free.lock().expect("pool mutex poisoned").list.len()
    }

    pub fn total_blocks(&self) -> usize {
        self.inner.free.lock().expect("pool mutex poisoned").total
    }
}

/// One block checked out of a [`MemoryPool`]. Returned to the freelist on
/// drop, never to the allocator.
pub struct PoolBlock {
    data: Option<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl PoolBlock {
    pub fn as_slice(&self) -> &[u8] {
        self.data.as_deref().expect("pool block already returned")
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().expect("pool block already returned")
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handle to the pool this block came from, for sibling allocations.
    pub fn pool(&self) -> MemoryPool {
        MemoryPool {
            inner: Arc::clone(&self.pool),
        }
    }
}

impl Drop for PoolBlock {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            let mut state = self.pool.free.lock().expect("pool mutex poisoned");
            state.list.push(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_recycles_blocks() -> Result<()> {
        let pool = MemoryPool::new(64, 2)?;
        assert_eq!(pool.free_blocks(), 2);

        let a = pool.allocate();
        let b = pool.allocate();
        assert_eq!(pool.free_blocks(), 0);
        assert_eq!(a.len(), 64);

        drop(a);
        drop(b);
        assert_eq!(pool.free_blocks(), 2);
        assert_eq!(pool.total_blocks(), 2);
        Ok(())
    }

    #[test]
    fn pool_grows_when_exhausted() -> Result<()> {
        let pool = MemoryPool::new(16, 1)?;
        let a = pool.allocate();
        let b = pool.allocate();
        assert_eq!(pool.total_blocks(), 2);

        drop(a);
        drop(b);
        // Grown capacity is retained, not released.
        assert_eq!(pool.free_blocks(), 2);
        Ok(())
    }

    #[test]
    fn zero_block_size_is_a_config_error() {
        assert!(MemoryPool::new(0, 4).is_err());
    }

    #[test]
    fn block_writes_survive_round_trip() -> Result<()> {
        let pool = MemoryPool::new(8, 1)?;
        let mut block = pool.allocate();
        block.as_mut_slice().copy_from_slice(&[7u8; 8]);
        assert_eq!(block.as_slice(), &[7u8; 8]);
        Ok(())
    }
}
