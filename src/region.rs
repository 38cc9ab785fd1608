//! POSIX shared memory regions.
//!
//! A [`Region`] is one POSIX shared memory object (`shm_open`) mapped
//! into this process. The process that creates the object is its
//! *creator* and owns the kernel-side name: dropping a creator unlinks
//! the object so no new accessor can open it, while the bytes stay alive
//! until every mapping in every process is gone. An *accessor* only
//! opened an existing object and unmaps on drop.
//!
//! # Example
//!
//! ```no_run
//! use ipcator::region::Region;
//!
//! // Producer side
//! let mut region = Region::create("/ipcator.demo", 4096)?;
//! region.bytes_mut().unwrap()[5] = 42;
//!
//! // Consumer side (same or another process)
//! let view = Region::open("/ipcator.demo", false)?;
//! assert_eq!(view.bytes()[5], 42);
//! # Ok::<(), ipcator::Error>(())
//! ```

use rustix::fs::{self, Mode};
use rustix::io::Errno;
use rustix::mm::{self, MapFlags, ProtFlags};
use rustix::shm;
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::name::validate_name;
use crate::page::page_size;

/// How a [`Region`] relates to the underlying shm object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionMode {
    /// This process created the object; drop unlinks it. Read-write.
    Creator,
    /// Opened an existing object read-write. Drop only unmaps.
    Writer,
    /// Opened an existing object read-only. Drop only unmaps.
    Reader,
}

/// Poll interval used by [`Region::open_with_retry`].
const OPEN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One mapped POSIX shared memory object.
///
/// Move-only: ownership of the mapping transfers with the value, and only
/// `Drop` unmaps. Accessors can be re-opened with [`Region::try_clone`],
/// which yields a second mapping of the same object at a different base.
#[derive(Debug)]
pub struct Region {
    name: String,
    base: NonNull<u8>,
    len: usize,
    mode: RegionMode,
}

impl Region {
    /// Create a new shm object of `size` bytes and map it read-write.
    ///
    /// The open is exclusive: if the name is already taken the call fails
    /// with [`Error::AlreadyExists`]. Any failure after the object was
    /// created rolls it back, so a failed `create` leaves no file behind
    /// and no mapping leaked.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a zero `size` or a malformed name,
    /// [`Error::AlreadyExists`], [`Error::PermissionDenied`],
    /// [`Error::OutOfMemory`].
    pub fn create(name: &str, size: usize) -> Result<Self> {
        validate_name(name)?;
        if size == 0 {
            return Err(Error::InvalidArgument(format!(
                "cannot create zero-sized region {name:?}"
            )));
        }

        let fd = shm::open(
            name,
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::from_raw_mode(0o666),
        )
        .map_err(|err| shm_error(err, name, size))?;

        if let Err(err) = fs::ftruncate(&fd, size as u64) {
            let _ = shm::unlink(name);
            return Err(shm_error(err, name, size));
        }

        // Executable mappings let producers place trampolines in shared
        // memory; some systems forbid PROT_EXEC on shm, so fall back.
        let prot_exec = ProtFlags::READ | ProtFlags::WRITE | ProtFlags::EXEC;
        // SAFETY: the fd refers to an object of exactly `size` bytes and
        // we pick no address, so the kernel chooses a free range.
        let mapped = unsafe {
            mm::mmap(std::ptr::null_mut(), size, prot_exec, MapFlags::SHARED, &fd, 0)
        }
        .or_else(|err| {
            if err == Errno::PERM || err == Errno::ACCESS || err == Errno::NOTSUP {
                // SAFETY: as above, minus PROT_EXEC.
                unsafe {
                    mm::mmap(
                        std::ptr::null_mut(),
                        size,
                        ProtFlags::READ | ProtFlags::WRITE,
                        MapFlags::SHARED,
                        &fd,
                        0,
                    )
                }
            } else {
                Err(err)
            }
        });
        let ptr = match mapped {
            Ok(ptr) => ptr,
            Err(err) => {
                let _ = shm::unlink(name);
                return Err(shm_error(err, name, size));
            }
        };
        // fd closes here; the mapping persists without it.
        drop(fd);

        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::OutOfMemory(size))?;

        tracing::debug!(name, size, "created shm region");
        Ok(Self {
            name: name.to_string(),
            base,
            len: size,
            mode: RegionMode::Creator,
        })
    }

    /// Open an existing shm object and map it.
    ///
    /// The object's size is taken from the kernel (`fstat`); the accessor
    /// never specifies it. A zero-sized object counts as not yet ready
    /// and reports [`Error::NotFound`], because a creator always sizes
    /// the object before anyone is told its name.
    ///
    /// Fails fast; use [`Region::open_with_retry`] to wait for a creator
    /// racing with this call.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`], [`Error::PermissionDenied`],
    /// [`Error::OutOfMemory`], [`Error::InvalidArgument`] for a malformed
    /// name.
    pub fn open(name: &str, writable: bool) -> Result<Self> {
        validate_name(name)?;

        let oflags = if writable {
            shm::OFlags::RDWR
        } else {
            shm::OFlags::RDONLY
        };
        let fd = shm::open(name, oflags, Mode::empty())
            .map_err(|err| shm_error(err, name, 0))?;

        let stat = fs::fstat(&fd).map_err(Error::System)?;
        let len = stat.st_size as usize;
        if len == 0 {
            return Err(Error::NotFound(name.to_string()));
        }

        let prot = if writable {
            ProtFlags::READ | ProtFlags::WRITE
        } else {
            ProtFlags::READ
        };
        // SAFETY: fstat reported the object as `len` bytes; mapping the
        // whole object at a kernel-chosen address.
        let ptr = unsafe {
            mm::mmap(std::ptr::null_mut(), len, prot, MapFlags::SHARED, &fd, 0)
        }
        .map_err(|err| shm_error(err, name, len))?;

        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::OutOfMemory(len))?;

        tracing::debug!(name, len, writable, "opened shm region");
        Ok(Self {
            name: name.to_string(),
            base,
            len,
            mode: if writable {
                RegionMode::Writer
            } else {
                RegionMode::Reader
            },
        })
    }

    /// Open an existing shm object, polling until it appears and has a
    /// non-zero size, or `timeout` elapses.
    ///
    /// This is the rendezvous variant of [`Region::open`] for accessors
    /// that may start before the creator has finished sizing the object.
    /// The wait is bounded; on expiry the last [`Error::NotFound`] is
    /// returned.
    pub fn open_with_retry(name: &str, writable: bool, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::open(name, writable) {
                Err(Error::NotFound(_)) if Instant::now() < deadline => {
                    std::thread::sleep(OPEN_POLL_INTERVAL);
                }
                result => return result,
            }
        }
    }

    /// The shm object name, e.g. `/ipcator-000001-…`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length of the mapping in bytes. Immutable after construction.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Regions are never empty; present for slice-like symmetry.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// How this region relates to the underlying object.
    pub fn mode(&self) -> RegionMode {
        self.mode
    }

    /// Whether stores through this mapping are permitted.
    pub fn is_writable(&self) -> bool {
        !matches!(self.mode, RegionMode::Reader)
    }

    /// Base pointer of the mapping. Always page-aligned.
    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    /// Mutable base pointer, or `None` for a read-only mapping.
    ///
    /// Writes through this pointer need external synchronization; the
    /// kernel shares these bytes with every process that mapped the
    /// object.
    pub fn as_mut_ptr(&self) -> Option<*mut u8> {
        self.is_writable().then(|| self.base.as_ptr())
    }

    /// The mapped bytes.
    ///
    /// Other processes can mutate the underlying memory concurrently;
    /// readers that can observe torn writes must synchronize at the
    /// message layer.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: base..base+len is a live mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    /// The mapped bytes, mutably. `None` for a read-only mapping.
    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        self.is_writable().then(|| {
            // SAFETY: live writable mapping, exclusive &mut self within
            // this process.
            unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
        })
    }

    /// Re-open the same object as a second, independent mapping.
    ///
    /// Only accessors can be cloned this way; a creator is the single
    /// owner of the kernel object. The clone has its own base address.
    pub fn try_clone(&self) -> Result<Self> {
        match self.mode {
            RegionMode::Creator => Err(Error::InvalidArgument(format!(
                "creator region {:?} cannot be cloned; open an accessor instead",
                self.name
            ))),
            RegionMode::Writer => Self::open(&self.name, true),
            RegionMode::Reader => Self::open(&self.name, false),
        }
    }

    /// Touch every page so the kernel backs the whole region now.
    ///
    /// Advisory only; useful for latency-sensitive producers.
    pub fn prefault(&self) {
        let ptr = self.base.as_ptr();
        for offset in (0..self.len).step_by(page_size()) {
            // SAFETY: offset < len; volatile read defeats dead-load
            // elimination.
            unsafe {
                std::ptr::read_volatile(ptr.add(offset));
            }
        }
    }

    /// Base of the mapping as a `NonNull`, for the allocator layers.
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Whether `ptr` points into this mapping.
    pub(crate) fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.len
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.mode == RegionMode::Creator {
            // After this, new opens of the name fail; existing mappings
            // (here and in other processes) stay valid until unmapped.
            if let Err(err) = shm::unlink(self.name.as_str()) {
                tracing::warn!(name = %self.name, %err, "shm_unlink failed");
            }
        }
        // SAFETY: base/len describe the mapping made in the constructor.
        if let Err(err) = unsafe { mm::munmap(self.base.as_ptr().cast(), self.len) } {
            tracing::warn!(name = %self.name, %err, "munmap failed");
        }
    }
}

/// Two regions are equal iff they map the same-named object.
impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Region {}

impl Hash for Region {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

// SAFETY: the mapping is valid from any thread; the kernel reference-
// counts the object. Mutation requires &mut Region or a raw pointer the
// caller synchronizes.
unsafe impl Send for Region {}
// SAFETY: shared access only reads through a stable base pointer.
unsafe impl Sync for Region {}

/// Map an errno from the shm/mmap path onto the documented error kinds.
fn shm_error(err: Errno, name: &str, size: usize) -> Error {
    if err == Errno::EXIST {
        Error::AlreadyExists(name.to_string())
    } else if err == Errno::NOENT {
        Error::NotFound(name.to_string())
    } else if err == Errno::ACCESS || err == Errno::PERM {
        Error::PermissionDenied(name.to_string())
    } else if err == Errno::NOMEM || err == Errno::MFILE || err == Errno::NFILE {
        Error::OutOfMemory(size)
    } else {
        Error::System(err)
    }
}
