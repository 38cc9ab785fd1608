//! # ipcator
//!
//! An inter-process shared-memory allocator for POSIX hosts.
//!
//! A *producer* process carves message objects out of POSIX shared
//! memory regions; *consumer* processes locate them by a stable
//! `(region name, byte offset)` pair and map them on demand. How that
//! pair travels between the processes is up to the application; ipcator
//! is the memory substrate underneath the transport.
//!
//! ## Architecture
//!
//! - [`Region`](region::Region): one `shm_open`+`mmap` mapping with
//!   deterministic creator/accessor lifetime
//! - [`OrderedRegionSet`](region_set::OrderedRegionSet) /
//!   [`HashedRegionSet`](region_set::HashedRegionSet): coarse allocators
//!   owning one region per allocation, with reverse address lookup or
//!   last-insert tracking
//! - [`MonotonicBuffer`](monotonic::MonotonicBuffer): bump allocator
//!   with geometric region growth
//! - [`PoolAllocator`](pool::PoolAllocator) /
//!   [`SyncPoolAllocator`](pool::SyncPoolAllocator): segregated
//!   free-list allocator with a dedicated-region bypass
//! - [`ReaderCache`](reader::ReaderCache): consumer-side mapping cache
//!   with borrow counting and explicit GC
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ipcator::{MonotonicBuffer, ReaderCache, ShmResource};
//!
//! // Producer
//! let mut buf = MonotonicBuffer::default();
//! let ptr = buf.allocate(msg.len(), 1)?;
//! unsafe { std::ptr::copy_nonoverlapping(msg.as_ptr(), ptr.as_ptr(), msg.len()) };
//! let region = buf.upstream().last_inserted().unwrap();
//! send_descriptor(region.name(), offset_of(ptr, region));
//!
//! // Consumer
//! let mut cache = ReaderCache::new();
//! let (name, offset) = recv_descriptor();
//! let first_byte = cache.read::<u8>(&name, offset)?;
//! ```
//!
//! Regions are shared bytes, nothing more: the allocator gives no
//! cross-process ordering. Producers and consumers that need ordered
//! publication place their own synchronizer (for example an atomic flag)
//! in shared memory.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod monotonic;
pub mod name;
pub mod page;
pub mod pool;
pub mod reader;
pub mod region;
pub mod region_set;

pub use error::{Error, Result};
pub use monotonic::MonotonicBuffer;
pub use name::gen_name;
pub use page::{page_ceil, page_size};
pub use pool::{PoolAllocator, PoolOptions, SyncPoolAllocator};
pub use reader::{Borrow, ReaderCache};
pub use region::{Region, RegionMode};
pub use region_set::{HashedRegionSet, OrderedRegionSet, ShmResource};
