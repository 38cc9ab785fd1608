//! End-to-end scenarios across the allocator stack.

use ipcator::{
    Error, MonotonicBuffer, PoolAllocator, PoolOptions, ReaderCache, Region, ShmResource,
    gen_name, page_size,
};

#[test]
fn create_then_read_across_mappings() {
    let name = gen_name();
    let mut region = Region::create(&name, 16).unwrap();
    region.bytes_mut().unwrap()[5] = 42;

    let view = Region::open(&name, false).unwrap();
    assert_eq!(view.bytes()[5], 42);
}

#[test]
fn monotonic_growth_spills_into_a_new_region() {
    let page = page_size().max(4096);
    let mut buf = MonotonicBuffer::with_initial_size(page).unwrap();

    let p1 = buf.allocate(100, 1).unwrap();
    let first = buf
        .upstream()
        .last_inserted()
        .unwrap()
        .name()
        .to_string();

    let p2 = buf.allocate(page, 1).unwrap();
    let second = buf.upstream().last_inserted().unwrap();

    assert_ne!(first, second.name());
    assert!(second.len() >= page);
    // p2 lies in the new region, p1 does not.
    let base = second.as_ptr() as usize;
    let addr2 = p2.as_ptr() as usize;
    assert!(addr2 >= base && addr2 < base + second.len());
    let addr1 = p1.as_ptr() as usize;
    assert!(!(addr1 >= base && addr1 < base + second.len()));
}

#[test]
fn reverse_lookup_finds_the_containing_region() {
    let mut set = ipcator::OrderedRegionSet::new();
    let p = set.allocate(200, 1).unwrap();

    // SAFETY: 73 < 200.
    let obj = unsafe { p.as_ptr().add(73) };
    let region = set.find_arena(obj).unwrap();
    assert_eq!(region.as_ptr(), p.as_ptr().cast_const());
}

#[test]
fn pool_reuses_the_freed_block() {
    let mut pool = PoolAllocator::with_options(PoolOptions {
        max_blocks_per_chunk: 64,
        largest_required_pool_block: 64,
    });
    let a = pool.allocate(32, 1).unwrap();
    pool.deallocate(a, 32, 1).unwrap();
    let b = pool.allocate(32, 1).unwrap();
    assert_eq!(a, b);
}

#[test]
fn reader_gc_respects_borrows() {
    let name = gen_name();
    let mut region = Region::create(&name, 8).unwrap();
    region.bytes_mut().unwrap()[0] = 1;

    let mut cache = ReaderCache::new();
    let held = cache.read::<u8>(&name, 0).unwrap();
    assert_eq!(cache.gc(), 0);
    drop(held);
    assert_eq!(cache.gc(), 1);
}

#[test]
fn consumer_outlives_the_creator() {
    let name = gen_name();
    let mut creator = Region::create(&name, 64).unwrap();
    creator.bytes_mut().unwrap()[7] = 99;

    let consumer = Region::open(&name, false).unwrap();
    drop(creator);

    // The unlinked object stays readable through the existing mapping.
    assert_eq!(consumer.bytes()[7], 99);
    // But the name is gone for newcomers.
    assert!(matches!(
        Region::open(&name, false),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn producer_to_consumer_via_descriptor() {
    // Producer: bump-allocate a message and publish (name, offset).
    let message = b"Hello, shared memory!";
    let mut buf = MonotonicBuffer::default();
    let _padding = buf.allocate(3, 1).unwrap();
    let ptr = buf.allocate(message.len(), 1).unwrap();
    // SAFETY: message.len() bytes were just allocated at ptr.
    unsafe {
        std::ptr::copy_nonoverlapping(message.as_ptr(), ptr.as_ptr(), message.len());
    }
    let region = buf.upstream().last_inserted().unwrap();
    let name = region.name().to_string();
    let offset = ptr.as_ptr() as usize - region.as_ptr() as usize;

    // Consumer: map by name and read the bytes at the offset.
    let mut cache = ReaderCache::new();
    let view = cache.select(&name).unwrap();
    assert_eq!(&view.bytes()[offset..offset + message.len()], message);

    let first = cache.read::<u8>(&name, offset).unwrap();
    assert_eq!(*first, b'H');
}

#[test]
fn pool_pointers_resolve_through_the_upstream() {
    let mut pool = PoolAllocator::default();
    let small = pool.allocate(24, 8).unwrap();
    let large = pool.allocate(page_size() * 2, 8).unwrap();

    for ptr in [small, large] {
        assert!(pool.upstream().find_arena(ptr.as_ptr()).is_ok());
    }

    // A pointer from a different allocator is foreign.
    let mut other = MonotonicBuffer::default();
    let foreign = other.allocate(16, 1).unwrap();
    assert!(pool.upstream().find_arena(foreign.as_ptr()).is_err());
}
