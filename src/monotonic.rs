//! Monotonic bump allocator over shared memory regions.
//!
//! [`MonotonicBuffer`] hands out addresses by walking a cursor forward
//! through its current region. Individual deallocation is a no-op; the
//! memory comes back all at once with [`MonotonicBuffer::release`].
//! When a request does not fit, the buffer asks its upstream
//! [`HashedRegionSet`] for a new region and at least doubles the size it
//! will request next time, so a producer that keeps allocating touches
//! the kernel logarithmically often.
//!
//! # Example
//!
//! ```no_run
//! use ipcator::monotonic::MonotonicBuffer;
//! use ipcator::region_set::ShmResource;
//!
//! let mut buf = MonotonicBuffer::with_initial_size(4096)?;
//! let ptr = buf.allocate(100, 8)?;
//! // Publish (name, offset) for the consumer:
//! let region = buf.upstream().last_inserted().unwrap();
//! let offset = ptr.as_ptr() as usize - region.as_ptr() as usize;
//! # let _ = offset;
//! # Ok::<(), ipcator::Error>(())
//! ```

use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::page::{page_ceil, page_size};
use crate::region_set::{HashedRegionSet, ShmResource};

const GROWTH_FACTOR: usize = 2;

/// Bump cursor into the buffer's current region.
#[derive(Debug)]
struct Cursor {
    base: NonNull<u8>,
    len: usize,
    used: usize,
}

/// A growing sequence of creator regions with a forward-only cursor.
///
/// The first region is created lazily on the first allocation. The
/// upstream set is indexed for last-insert, so every pointer this buffer
/// returns lies inside [`HashedRegionSet::last_inserted`].
#[derive(Debug)]
pub struct MonotonicBuffer {
    upstream: HashedRegionSet,
    initial_size: usize,
    next_chunk: usize,
    current: Option<Cursor>,
}

impl MonotonicBuffer {
    /// Create a buffer whose first region will be `initial_size` bytes,
    /// page-ceiled. `initial_size` must be non-zero.
    pub fn with_initial_size(initial_size: usize) -> Result<Self> {
        if initial_size == 0 {
            return Err(Error::InvalidArgument(
                "monotonic buffer initial size must be non-zero".to_string(),
            ));
        }
        let initial_size = page_ceil(initial_size);
        Ok(Self {
            upstream: HashedRegionSet::new(),
            initial_size,
            next_chunk: initial_size,
            current: None,
        })
    }

    /// Discard every region and restore the next-chunk size to the
    /// construction-time initial size.
    pub fn release(&mut self) {
        tracing::debug!(regions = self.upstream.len(), "monotonic buffer released");
        self.current = None;
        self.upstream.clear();
        self.next_chunk = self.initial_size;
    }

    /// The owned upstream region set.
    pub fn upstream(&self) -> &HashedRegionSet {
        &self.upstream
    }
}

impl Default for MonotonicBuffer {
    /// One page of initial capacity.
    fn default() -> Self {
        Self {
            upstream: HashedRegionSet::new(),
            initial_size: page_size(),
            next_chunk: page_size(),
            current: None,
        }
    }
}

impl ShmResource for MonotonicBuffer {
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

        // Fast path: bump within the current region.
        if let Some(cur) = &mut self.current {
            let base_addr = cur.base.as_ptr() as usize;
            let offset = (base_addr + cur.used).next_multiple_of(align) - base_addr;
            if offset + size <= cur.len {
                cur.used = offset + size;
                tracing::trace!(size, align, offset, "bump within current region");
                // SAFETY: offset + size <= len, so the address is inside
                // the live mapping and non-null.
                return Ok(unsafe { NonNull::new_unchecked(cur.base.as_ptr().add(offset)) });
            }
        }

        // Grow: fresh region of at least the geometric next-chunk size.
        let chunk = page_ceil(size).max(self.next_chunk);
        let base = self.upstream.allocate(chunk, align)?;
        self.next_chunk = self.next_chunk.saturating_mul(GROWTH_FACTOR);
        self.current = Some(Cursor {
            base,
            len: chunk,
            used: size,
        });
        tracing::debug!(chunk, next_chunk = self.next_chunk, "monotonic buffer grew");
        Ok(base)
    }

    /// No-op: a monotonic buffer never frees individual allocations.
    fn deallocate(&mut self, _ptr: NonNull<u8>, _size: usize, _align: usize) -> Result<()> {
        Ok(())
    }
}
