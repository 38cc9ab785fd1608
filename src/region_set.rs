//! Coarse allocation over sets of creator regions.
//!
//! A region set is the lowest allocator layer: every `allocate` creates
//! one fresh shm object and maps it, every `deallocate` unlinks and
//! unmaps one. The two set types differ only in their index:
//!
//! - [`OrderedRegionSet`] keys regions by base address in a `BTreeMap`,
//!   which buys O(log n) *reverse lookup* (pointer to containing region)
//!   via [`OrderedRegionSet::find_arena`].
//! - [`HashedRegionSet`] keys regions in a `HashMap` and tracks the most
//!   recent insertion for O(1) [`HashedRegionSet::last_inserted`].
//!
//! Both implement [`ShmResource`], the contract the sub-allocators build
//! on.

use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::name::gen_name;
use crate::page::{page_ceil, page_size};
use crate::region::Region;

/// How many fresh names to try when `shm_open` reports a collision.
const MAX_NAME_RETRIES: usize = 4;

/// The low-level memory-resource contract shared by the region sets.
///
/// Allocation returns a non-null, page-aligned pointer or an error;
/// a failed call leaves the resource unchanged. Resources are stateful
/// and not interchangeable: [`ShmResource::is_equal`] compares instance
/// identity, never contents.
pub trait ShmResource {
    /// Allocate `size` bytes aligned to `align` by creating one region.
    ///
    /// `align` must be a power of two no larger than the page size;
    /// regions start on page boundaries, so any such alignment is
    /// satisfied by the base pointer itself.
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>>;

    /// Return the region whose base is `ptr` to the kernel.
    ///
    /// `ptr` must be a value previously returned by `allocate` on this
    /// same resource; anything else is [`Error::InvalidArgument`].
    fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, align: usize) -> Result<()>;

    /// Whether `other` is this very resource.
    fn is_equal(&self, other: &dyn ShmResource) -> bool
    where
        Self: Sized,
    {
        std::ptr::eq(
            self as *const Self as *const u8,
            other as *const dyn ShmResource as *const u8,
        )
    }
}

/// Validate an allocation request and create the backing region,
/// retrying on the (astronomically rare) name collision.
fn create_backing_region(size: usize, align: usize) -> Result<Region> {
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

    let mut attempt = 0;
    loop {
        let name = gen_name();
        match Region::create(&name, size) {
            Err(Error::AlreadyExists(taken)) if attempt + 1 < MAX_NAME_RETRIES => {
                attempt += 1;
                tracing::warn!(name = %taken, attempt, "shm name collision, retrying");
            }
            result => return result,
        }
    }
}

/// Region set ordered by base address; supports reverse lookup.
#[derive(Debug, Default)]
pub struct OrderedRegionSet {
    regions: BTreeMap<usize, Region>,
}

impl OrderedRegionSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The region whose byte range contains `ptr`, in O(log n).
    ///
    /// Returns [`Error::InvalidArgument`] for a pointer inside none of
    /// the set's regions.
    pub fn find_arena(&self, ptr: *const u8) -> Result<&Region> {
        let addr = ptr as usize;
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(ptr))
            .ok_or_else(|| {
                Error::InvalidArgument(format!("pointer {ptr:p} is not inside any region"))
            })
    }

    /// Iterate the regions in base-address order.
    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    /// Number of live regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the set holds no regions.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Drop every region (unlinking and unmapping each).
    pub fn clear(&mut self) {
        self.regions.clear();
    }
}

impl ShmResource for OrderedRegionSet {
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let region = create_backing_region(size, align)?;
        let base = region.base();
        self.regions.insert(base.as_ptr() as usize, region);
        tracing::trace!(size, align, base = ?base, "ordered set allocated region");
        Ok(base)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, _align: usize) -> Result<()> {
        let region = self.regions.remove(&(ptr.as_ptr() as usize)).ok_or_else(|| {
            Error::InvalidArgument(format!("{:p} is not a region base of this set", ptr))
        })?;
        debug_assert!(
            size <= region.len() && region.len() <= page_ceil(size),
            "deallocate size {size} inconsistent with region length {}",
            region.len()
        );
        Ok(())
    }
}

/// Region set hashed by base address; tracks the last insertion.
#[derive(Debug, Default)]
pub struct HashedRegionSet {
    regions: HashMap<usize, Region>,
    last: Option<usize>,
}

impl HashedRegionSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently inserted region, in O(1).
    pub fn last_inserted(&self) -> Option<&Region> {
        self.last.and_then(|addr| self.regions.get(&addr))
    }

    /// Iterate the regions in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    /// Number of live regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the set holds no regions.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Drop every region (unlinking and unmapping each).
    pub fn clear(&mut self) {
        self.regions.clear();
        self.last = None;
    }
}

impl ShmResource for HashedRegionSet {
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let region = create_backing_region(size, align)?;
        let base = region.base();
        let addr = base.as_ptr() as usize;
        self.regions.insert(addr, region);
        self.last = Some(addr);
        tracing::trace!(size, align, base = ?base, "hashed set allocated region");
        Ok(base)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, _align: usize) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let region = self.regions.remove(&addr).ok_or_else(|| {
            Error::InvalidArgument(format!("{:p} is not a region base of this set", ptr))
        })?;
        if self.last == Some(addr) {
            self.last = None;
        }
        debug_assert!(
            size <= region.len() && region.len() <= page_ceil(size),
            "deallocate size {size} inconsistent with region length {}",
            region.len()
        );
        Ok(())
    }
}

/// Re-index a hashed set by address order. Region ownership moves;
/// nothing is unmapped.
impl From<HashedRegionSet> for OrderedRegionSet {
    fn from(mut hashed: HashedRegionSet) -> Self {
        Self {
            regions: hashed.regions.drain().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_returns_page_aligned_pointer() {
        let mut set = OrderedRegionSet::new();
        let ptr = set.allocate(200, 1).unwrap();
        assert_eq!(ptr.as_ptr() as usize % page_size(), 0);
        assert_eq!(set.len(), 1);

        let region = set.iter().next().unwrap();
        assert!(200 <= region.len() && region.len() <= page_ceil(200));
    }

    #[test]
    fn test_deallocate_restores_size() {
        let mut set = OrderedRegionSet::new();
        let keep = set.allocate(100, 1).unwrap();
        let ptr = set.allocate(300, 8).unwrap();
        assert_eq!(set.len(), 2);

        set.deallocate(ptr, 300, 8).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.find_arena(keep.as_ptr()).is_ok());
    }

    #[test]
    fn test_zero_size_rejected_without_side_effects() {
        let mut set = OrderedRegionSet::new();
        assert!(matches!(
            set.allocate(0, 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(set.is_empty());
    }

    #[test]
    fn test_oversized_alignment_rejected() {
        let mut set = HashedRegionSet::new();
        let result = set.allocate(64, page_size() * 2);
        assert!(matches!(result, Err(Error::AlignmentUnsupported { .. })));
        assert!(set.is_empty());

        // Non-power-of-two alignments are rejected too.
        assert!(set.allocate(64, 3).is_err());
    }

    #[test]
    fn test_find_arena_interior_pointer() {
        let mut set = OrderedRegionSet::new();
        let ptr = set.allocate(200, 1).unwrap();
        let _other = set.allocate(200, 1).unwrap();

        // SAFETY: 73 < 200, still inside the first region.
        let interior = unsafe { ptr.as_ptr().add(73) };
        let region = set.find_arena(interior).unwrap();
        assert_eq!(region.as_ptr(), ptr.as_ptr().cast_const());
    }

    #[test]
    fn test_find_arena_foreign_pointer_fails() {
        let mut set = OrderedRegionSet::new();
        let ptr = set.allocate(128, 1).unwrap();

        let local = 0u8;
        assert!(set.find_arena(&local).is_err());
        // One past the end of a region is foreign.
        // SAFETY: pointer arithmetic only; never dereferenced.
        let past_end = unsafe { ptr.as_ptr().add(page_ceil(128)) };
        assert!(set.find_arena(past_end).is_err());
    }

    #[test]
    fn test_deallocate_foreign_pointer_fails() {
        let mut set = OrderedRegionSet::new();
        let _ptr = set.allocate(128, 1).unwrap();

        let foreign = NonNull::new(0x1000 as *mut u8).unwrap();
        assert!(set.deallocate(foreign, 128, 1).is_err());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_last_inserted_tracks_most_recent() {
        let mut set = HashedRegionSet::new();
        assert!(set.last_inserted().is_none());

        let _a = set.allocate(100, 1).unwrap();
        let b = set.allocate(100, 1).unwrap();
        let last = set.last_inserted().unwrap();
        assert_eq!(last.as_ptr(), b.as_ptr().cast_const());

        set.deallocate(b, 100, 1).unwrap();
        assert!(set.last_inserted().is_none());
    }

    #[test]
    fn test_ordered_from_hashed_moves_regions() {
        let mut hashed = HashedRegionSet::new();
        let p1 = hashed.allocate(64, 1).unwrap();
        let p2 = hashed.allocate(64, 1).unwrap();
        let names: Vec<String> =
            hashed.iter().map(|r| r.name().to_string()).collect();

        let ordered = OrderedRegionSet::from(hashed);
        assert_eq!(ordered.len(), 2);
        assert!(ordered.find_arena(p1.as_ptr()).is_ok());
        assert!(ordered.find_arena(p2.as_ptr()).is_ok());
        // The mappings survived the move: the shm objects still exist.
        for name in names {
            assert!(Region::open(&name, false).is_ok());
        }
    }

    #[test]
    fn test_clear_unlinks_regions() {
        let mut set = HashedRegionSet::new();
        let _ptr = set.allocate(64, 1).unwrap();
        let name = set.iter().next().unwrap().name().to_string();

        set.clear();
        assert!(set.is_empty());
        assert!(Region::open(&name, false).is_err());
    }

    #[test]
    fn test_is_equal_is_identity() {
        let set_a = OrderedRegionSet::new();
        let set_b = OrderedRegionSet::new();
        assert!(set_a.is_equal(&set_a));
        assert!(!set_a.is_equal(&set_b));

        let hashed = HashedRegionSet::new();
        assert!(!set_a.is_equal(&hashed));
    }
}
