//! Segregated pool allocator over shared memory regions.
//!
//! [`PoolAllocator`] keeps one free list per power-of-two size class.
//! An empty class refills by carving a fresh upstream region (a *chunk*)
//! into equal blocks; freed blocks go back on their class LIFO, so a
//! deallocate-then-allocate of the same size returns the same block.
//! Requests larger than the configured threshold bypass the pool and get
//! a dedicated region of their own.
//!
//! The upstream [`OrderedRegionSet`] is indexed by address, so any
//! pointer the pool ever returned can be mapped back to its containing
//! region with [`OrderedRegionSet::find_arena`].
//!
//! [`SyncPoolAllocator`] is the same allocator behind a single lock for
//! concurrent producers.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::page::{page_ceil, page_size};
use crate::region_set::{OrderedRegionSet, ShmResource};

/// Smallest block size handed out by any class.
const MIN_BLOCK: usize = 8;

/// Blocks in the first chunk of a class; doubles per refill.
const INITIAL_BLOCKS_PER_CHUNK: usize = 4;

const DEFAULT_MAX_BLOCKS_PER_CHUNK: usize = 256;

/// Pool configuration. Zero means "implementation default"; the values
/// reported by [`PoolAllocator::options`] are normalized.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Soft cap on how many blocks one chunk is carved into.
    pub max_blocks_per_chunk: usize,
    /// Requests above this many bytes (page-ceiled on construction)
    /// bypass the pool and get a dedicated region.
    pub largest_required_pool_block: usize,
}

impl PoolOptions {
    fn normalized(self) -> Self {
        Self {
            max_blocks_per_chunk: if self.max_blocks_per_chunk == 0 {
                DEFAULT_MAX_BLOCKS_PER_CHUNK
            } else {
                self.max_blocks_per_chunk
            },
            largest_required_pool_block: if self.largest_required_pool_block == 0 {
                page_size()
            } else {
                page_ceil(self.largest_required_pool_block)
            },
        }
    }
}

/// Index of the smallest class whose block size covers `request`.
fn class_index(request: usize) -> usize {
    let block = request.max(MIN_BLOCK).next_power_of_two();
    (block.trailing_zeros() - MIN_BLOCK.trailing_zeros()) as usize
}

/// One upstream region carved into equal blocks.
#[derive(Debug)]
struct Chunk {
    base: NonNull<u8>,
    bytes: usize,
}

/// Free list and chunk bookkeeping for one block size.
#[derive(Debug)]
struct SizeClass {
    block_size: usize,
    free: Vec<NonNull<u8>>,
    chunks: Vec<Chunk>,
    next_blocks: usize,
}

impl SizeClass {
    fn new(block_size: usize) -> Self {
        Self {
            block_size,
            free: Vec::new(),
            chunks: Vec::new(),
            next_blocks: INITIAL_BLOCKS_PER_CHUNK,
        }
    }
}

/// Segregated free-list allocator; requires external serialization.
#[derive(Debug)]
pub struct PoolAllocator {
    opts: PoolOptions,
    classes: Vec<SizeClass>,
    /// Base address → requested size of allocations that bypassed the pool.
    dedicated: HashMap<usize, usize>,
    upstream: OrderedRegionSet,
}

impl PoolAllocator {
    /// Create a pool with the given options (zeros mean defaults).
    pub fn with_options(opts: PoolOptions) -> Self {
        let opts = opts.normalized();
        let class_count = class_index(opts.largest_required_pool_block) + 1;
        let classes = (0..class_count)
            .map(|i| SizeClass::new(MIN_BLOCK << i))
            .collect();
        Self {
            opts,
            classes,
            dedicated: HashMap::new(),
            upstream: OrderedRegionSet::new(),
        }
    }

    /// The normalized configuration this pool runs with.
    pub fn options(&self) -> PoolOptions {
        self.opts
    }

    /// The owned upstream region set.
    pub fn upstream(&self) -> &OrderedRegionSet {
        &self.upstream
    }

    /// Return every chunk and dedicated region to the upstream and reset
    /// the per-class growth schedule.
    pub fn release(&mut self) {
        for class in &mut self.classes {
            class.free.clear();
            for chunk in class.chunks.drain(..) {
                if let Err(err) = self.upstream.deallocate(chunk.base, chunk.bytes, 1) {
                    tracing::warn!(%err, "failed to return chunk to upstream");
                }
            }
            class.next_blocks = INITIAL_BLOCKS_PER_CHUNK;
        }
        for (addr, size) in self.dedicated.drain() {
            // SAFETY: addr came from a successful upstream allocation.
            let ptr = unsafe { NonNull::new_unchecked(addr as *mut u8) };
            if let Err(err) = self.upstream.deallocate(ptr, size, 1) {
                tracing::warn!(%err, "failed to return dedicated region to upstream");
            }
        }
        debug_assert!(self.upstream.is_empty());
        tracing::debug!("pool released");
    }

    /// Carve a fresh chunk for class `idx` and thread its blocks onto
    /// the free list.
    fn refill(&mut self, idx: usize) -> Result<()> {
        let (block_size, blocks) = {
            let class = &self.classes[idx];
            (
                class.block_size,
                class.next_blocks.min(self.opts.max_blocks_per_chunk).max(1),
            )
        };
        let bytes = page_ceil(blocks * block_size);
        let base = self.upstream.allocate(bytes, 1)?;

        let class = &mut self.classes[idx];
        // The page-ceil may have bought extra blocks; use them all.
        let count = bytes / block_size;
        class.free.reserve(count);
        for i in 0..count {
            // SAFETY: i * block_size < bytes, inside the fresh region.
            let block = unsafe { NonNull::new_unchecked(base.as_ptr().add(i * block_size)) };
            class.free.push(block);
        }
        class.chunks.push(Chunk { base, bytes });
        class.next_blocks = (blocks * 2).min(self.opts.max_blocks_per_chunk).max(1);
        tracing::debug!(block_size, count, bytes, "pool chunk carved");
        Ok(())
    }
}

impl Default for PoolAllocator {
    fn default() -> Self {
        Self::with_options(PoolOptions::default())
    }
}

impl ShmResource for PoolAllocator {
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "allocation size must be non-zero".to_string(),
            ));
        }
        if align == 0 || !align.is_power_of_two() || align > page_size() {
            return Err(Error::AlignmentUnsupported {
                align,
                page_size: page_size(),
            });
        }

        // A stricter alignment than the natural one bumps the class.
        let request = size.max(align);
        if request > self.opts.largest_required_pool_block {
            let base = self.upstream.allocate(size, align)?;
            self.dedicated.insert(base.as_ptr() as usize, size);
            tracing::trace!(size, align, "pool bypassed for dedicated region");
            return Ok(base);
        }

        let idx = class_index(request);
        if self.classes[idx].free.is_empty() {
            self.refill(idx)?;
        }
        let class = &mut self.classes[idx];
        let block = class
            .free
            .pop()
            .ok_or_else(|| Error::OutOfMemory(class.block_size))?;
        tracing::trace!(size, align, block_size = class.block_size, "pool block served");
        Ok(block)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, align: usize) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        if let Some(dedicated_size) = self.dedicated.remove(&addr) {
            debug_assert_eq!(dedicated_size, size);
            return self.upstream.deallocate(ptr, dedicated_size, align);
        }

        let request = size.max(align);
        if request > self.opts.largest_required_pool_block {
            return Err(Error::InvalidArgument(format!(
                "{:p} is not a dedicated allocation of this pool",
                ptr
            )));
        }
        debug_assert!(
            self.upstream.find_arena(ptr.as_ptr()).is_ok(),
            "deallocated pointer does not belong to this pool"
        );
        self.classes[class_index(request)].free.push(ptr);
        Ok(())
    }
}

// SAFETY: the free-list pointers reference shared mappings owned by the
// upstream set, valid from any thread in this process.
unsafe impl Send for PoolAllocator {}

/// [`PoolAllocator`] behind a single lock; safe for concurrent callers.
#[derive(Debug, Default)]
pub struct SyncPoolAllocator {
    inner: Mutex<PoolAllocator>,
}

impl SyncPoolAllocator {
    /// Create a synchronized pool with the given options.
    pub fn with_options(opts: PoolOptions) -> Self {
        Self {
            inner: Mutex::new(PoolAllocator::with_options(opts)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolAllocator> {
        // A poisoning panic cannot leave the free lists inconsistent:
        // every mutation completes before the lock is released.
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Allocate `size` bytes aligned to `align`.
    pub fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        self.lock().allocate(size, align)
    }

    /// Return an allocation to the pool.
    pub fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: usize) -> Result<()> {
        self.lock().deallocate(ptr, size, align)
    }

    /// Return every chunk and dedicated region to the upstream.
    pub fn release(&self) {
        self.lock().release();
    }

    /// The normalized configuration this pool runs with.
    pub fn options(&self) -> PoolOptions {
        self.lock().options()
    }

    /// Run `f` against the upstream set while holding the pool lock.
    pub fn with_upstream<R>(&self, f: impl FnOnce(&OrderedRegionSet) -> R) -> R {
        f(self.lock().upstream())
    }
}
