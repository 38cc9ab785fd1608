//! Host page size and page-granular rounding.
//!
//! Every shared memory mapping starts on a page boundary and the kernel
//! backs it in page-size units, so the allocators round their region and
//! chunk sizes up to a page multiple before talking to the kernel.

use std::sync::OnceLock;

/// Host page size in bytes, determined once per process.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(rustix::param::page_size)
}

/// Round `n` up to the smallest multiple of the host page size.
///
/// `page_ceil(0)` is 0. The function is idempotent.
///
/// # Example
///
/// ```
/// use ipcator::page::{page_ceil, page_size};
///
/// assert_eq!(page_ceil(0), 0);
/// assert_eq!(page_ceil(1), page_size());
/// assert_eq!(page_ceil(page_size()), page_size());
/// ```
pub fn page_ceil(n: usize) -> usize {
    let page = page_size();
    n.div_ceil(page) * page
}
