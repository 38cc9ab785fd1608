//! Accessor-side region cache.
//!
//! A consumer that receives `(name, offset)` descriptors maps each named
//! region once and reuses the mapping for every subsequent read.
//! [`ReaderCache`] owns those accessor mappings and counts outstanding
//! borrows per entry; [`ReaderCache::gc`] drops exactly the mappings
//! nobody is borrowing.
//!
//! # Example
//!
//! ```no_run
//! use ipcator::reader::ReaderCache;
//!
//! let mut cache = ReaderCache::new();
//! let value = cache.read::<u64>("/ipcator-000001-abc", 16)?;
//! println!("got {}", *value);
//! drop(value);
//! assert_eq!(cache.gc(), 1);
//! # Ok::<(), ipcator::Error>(())
//! ```

use std::cell::Cell;
use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::ops::Deref;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::region::Region;

/// One cached mapping plus its outstanding-borrow count.
#[derive(Debug)]
struct CacheEntry {
    region: Rc<Region>,
    borrows: Rc<Cell<usize>>,
}

impl CacheEntry {
    fn new(region: Region) -> Self {
        Self {
            region: Rc::new(region),
            borrows: Rc::new(Cell::new(0)),
        }
    }
}

/// Maps region names to locally-mapped accessor views.
///
/// Single-threaded by contract: the cache and its [`Borrow`]s stay on
/// one thread. A read-only cache maps regions read-only; a writable one
/// maps them read-write.
#[derive(Debug, Default)]
pub struct ReaderCache {
    entries: HashMap<String, CacheEntry>,
    writable: bool,
}

impl ReaderCache {
    /// A cache whose mappings are read-only.
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache whose mappings are read-write.
    pub fn writable() -> Self {
        Self {
            entries: HashMap::new(),
            writable: true,
        }
    }

    /// Whether this cache maps regions read-write.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Number of cached mappings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no mappings.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Borrow a `T` at `offset` within the named region.
    ///
    /// Maps the region on first use. The returned [`Borrow`] pins the
    /// entry: [`ReaderCache::gc`] will not evict a mapping with live
    /// borrows. A failed bounds or alignment check leaves the cache
    /// untouched.
    ///
    /// `T` must be plain data the producer wrote as raw bytes; reading a
    /// pointer-bearing type through shared memory is meaningless across
    /// processes and is the message schema's responsibility to avoid.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if no such region exists,
    /// [`Error::OutOfBounds`] if `offset + size_of::<T>()` exceeds the
    /// region, [`Error::InvalidArgument`] if `base + offset` is not
    /// aligned for `T`.
    pub fn read<T: Copy>(&mut self, name: &str, offset: usize) -> Result<Borrow<T>> {
        if let Some(entry) = self.entries.get(name) {
            return borrow_at(entry, offset);
        }

        let region = Region::open(name, self.writable)?;
        let entry = CacheEntry::new(region);
        // Checked before insertion, so a failing read caches nothing.
        let borrow = borrow_at(&entry, offset)?;
        self.entries.insert(name.to_string(), entry);
        tracing::debug!(name, "reader cache mapped region");
        Ok(borrow)
    }

    /// The whole mapped region for `name`, mapping it on first use.
    pub fn select(&mut self, name: &str) -> Result<&Region> {
        let entry = match self.entries.entry(name.to_string()) {
            MapEntry::Occupied(occupied) => occupied.into_mut(),
            MapEntry::Vacant(vacant) => {
                let region = Region::open(name, self.writable)?;
                tracing::debug!(name, "reader cache mapped region");
                vacant.insert(CacheEntry::new(region))
            }
        };
        Ok(entry.region.as_ref())
    }

    /// Drop every mapping with zero outstanding borrows.
    ///
    /// Returns how many entries were removed. Borrowed entries are
    /// always retained.
    pub fn gc(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|name, entry| {
            let keep = entry.borrows.get() > 0;
            if !keep {
                tracing::debug!(name = %name, "reader cache dropped idle mapping");
            }
            keep
        });
        before - self.entries.len()
    }
}

/// Bounds-check, alignment-check, and borrow `T` out of an entry.
fn borrow_at<T: Copy>(entry: &CacheEntry, offset: usize) -> Result<Borrow<T>> {
    let len = size_of::<T>();
    let region_len = entry.region.len();
    if offset.checked_add(len).is_none_or(|end| end > region_len) {
        return Err(Error::OutOfBounds {
            offset,
            len,
            region_len,
        });
    }
    let addr = entry.region.as_ptr() as usize + offset;
    if addr % align_of::<T>() != 0 {
        return Err(Error::InvalidArgument(format!(
            "offset {offset} yields address {addr:#x} unaligned for a {len}-byte read"
        )));
    }

    entry.borrows.set(entry.borrows.get() + 1);
    // SAFETY: addr is non-null and offset + size_of::<T>() is inside
    // the mapping.
    let ptr = unsafe { NonNull::new_unchecked(addr as *mut T) };
    Ok(Borrow {
        ptr,
        borrows: Rc::clone(&entry.borrows),
        _region: Rc::clone(&entry.region),
    })
}

/// A scoped borrow of a `T` inside a cached region.
///
/// Dereferences to the value; dropping it decrements the entry's borrow
/// count. The borrow also keeps the mapping itself alive, so it stays
/// valid even if the cache is dropped first.
#[derive(Debug)]
pub struct Borrow<T> {
    ptr: NonNull<T>,
    borrows: Rc<Cell<usize>>,
    _region: Rc<Region>,
}

impl<T> Borrow<T> {
    /// Raw pointer to the borrowed value.
    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }
}

impl<T> Deref for Borrow<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: construction checked bounds and alignment; the Rc on
        // the region keeps the mapping alive.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> Drop for Borrow<T> {
    fn drop(&mut self) {
        self.borrows.set(self.borrows.get() - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::gen_name;

    fn region_with_bytes(bytes: &[u8]) -> (String, Region) {
        let name = gen_name();
        let mut region = Region::create(&name, bytes.len().max(1)).unwrap();
        region.bytes_mut().unwrap()[..bytes.len()].copy_from_slice(bytes);
        (name, region)
    }

    #[test]
    fn test_read_byte() {
        let (name, _creator) = region_with_bytes(&[0, 0, 0, 0, 0, 42, 7]);
        let mut cache = ReaderCache::new();
        let value = cache.read::<u8>(&name, 5).unwrap();
        assert_eq!(*value, 42);
    }

    #[test]
    fn test_read_u32() {
        let (name, _creator) = region_with_bytes(&0xDEAD_BEEF_u32.to_le_bytes());
        let mut cache = ReaderCache::new();
        let value = cache.read::<u32>(&name, 0).unwrap();
        assert_eq!(*value, 0xDEAD_BEEF);
    }

    #[test]
    fn test_mapping_is_reused() {
        let (name, _creator) = region_with_bytes(&[1, 2, 3, 4]);
        let mut cache = ReaderCache::new();
        let a = cache.read::<u8>(&name, 0).unwrap();
        let b = cache.read::<u8>(&name, 1).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!((*a, *b), (1, 2));
    }

    #[test]
    fn test_missing_region() {
        let mut cache = ReaderCache::new();
        assert!(matches!(
            cache.read::<u8>(&gen_name(), 0),
            Err(Error::NotFound(_))
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_out_of_bounds_leaves_cache_untouched() {
        let (name, _creator) = region_with_bytes(&[0; 16]);
        let mut cache = ReaderCache::new();

        // A miss that fails the bounds check is not inserted.
        assert!(matches!(
            cache.read::<u64>(&name, 9),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(cache.is_empty());

        // A hit that fails the bounds check changes nothing either.
        let good = cache.read::<u8>(&name, 0).unwrap();
        assert!(cache.read::<u64>(&name, 9).is_err());
        assert_eq!(cache.len(), 1);
        drop(good);
        assert_eq!(cache.gc(), 1);
    }

    #[test]
    fn test_misaligned_offset_rejected() {
        let (name, _creator) = region_with_bytes(&[0; 16]);
        let mut cache = ReaderCache::new();
        assert!(matches!(
            cache.read::<u32>(&name, 1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_gc_respects_borrows() {
        let (name, _creator) = region_with_bytes(&[9; 8]);
        let mut cache = ReaderCache::new();

        let held = cache.read::<u8>(&name, 0).unwrap();
        assert_eq!(cache.gc(), 0);
        assert_eq!(cache.len(), 1);

        drop(held);
        assert_eq!(cache.gc(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_gc_counts_multiple_borrows() {
        let (name, _creator) = region_with_bytes(&[9; 8]);
        let mut cache = ReaderCache::new();

        let first = cache.read::<u8>(&name, 0).unwrap();
        let second = cache.read::<u8>(&name, 1).unwrap();
        drop(first);
        assert_eq!(cache.gc(), 0);
        drop(second);
        assert_eq!(cache.gc(), 1);
    }

    #[test]
    fn test_select_returns_whole_region() {
        let (name, _creator) = region_with_bytes(&[5; 32]);
        let mut cache = ReaderCache::new();

        let region = cache.select(&name).unwrap();
        assert_eq!(region.len(), 32);
        assert_eq!(region.bytes()[31], 5);
        let base = region.as_ptr();

        // Second select reuses the mapping.
        assert_eq!(cache.select(&name).unwrap().as_ptr(), base);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_writable_cache_can_store() {
        let (name, creator) = region_with_bytes(&[0; 8]);
        let mut cache = ReaderCache::writable();

        let region = cache.select(&name).unwrap();
        let ptr = region.as_mut_ptr().unwrap();
        // SAFETY: offset 3 < 8; the producer side reads it back below.
        unsafe { *ptr.add(3) = 77 };

        assert_eq!(creator.bytes()[3], 77);
    }

    #[test]
    fn test_readonly_cache_maps_readonly() {
        let (name, _creator) = region_with_bytes(&[0; 8]);
        let mut cache = ReaderCache::new();
        assert!(!cache.is_writable());
        let region = cache.select(&name).unwrap();
        assert!(region.as_mut_ptr().is_none());
    }

    #[test]
    fn test_borrow_survives_cache_drop() {
        let (name, _creator) = region_with_bytes(&[1, 2, 3, 4]);
        let mut cache = ReaderCache::new();
        let borrow = cache.read::<u8>(&name, 2).unwrap();
        drop(cache);
        assert_eq!(*borrow, 3);
    }
}
