//! Shared memory region management

use crate::{poll_until, PlatformUtils, Result, SharedMemoryError, WaitOptions};
use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::fs::File;
use std::ptr::NonNull;
use tracing::{debug, info, instrument, warn};

/// Outcome of a create-or-attach call
#[derive(Debug)]
pub enum Provisioned<T> {
    /// This process created the object and owns its name
    Created(T),
    /// The object already existed; this process attached to it
    Existing(T),
}

impl<T> Provisioned<T> {
    /// Whether this call created the object
    pub fn was_created(&self) -> bool {
        matches!(self, Provisioned::Created(_))
    }

    /// Unwrap the provisioned object
    pub fn into_inner(self) -> T {
        match self {
            Provisioned::Created(value) | Provisioned::Existing(value) => value,
        }
    }
}

/// Shared memory region handle
///
/// Mapped read/write. The handle hands out bounds-checked byte access through
/// `&self`: the memory is concurrently written by the peer process, so Rust
/// aliasing rules cannot be expressed over it and every access copies.
pub struct SharedRegion {
    /// POSIX name, `None` for anonymous regions
    name: Option<String>,
    /// Region size in bytes
    size: usize,
    /// Start of the mapping
    ptr: NonNull<u8>,
    /// Keeps the mapping alive
    _map: MmapMut,
    /// Whether this process created the region
    is_creator: bool,
    /// Skip unlinking on drop
    persist: bool,
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("is_creator", &self.is_creator)
            .finish()
    }
}

impl SharedRegion {
    /// Create a new named region of `size` bytes; fails if the name exists
    #[instrument(level = "debug")]
    pub fn create(name: &str, size: usize) -> Result<Self> {
        PlatformUtils::validate_name(name)?;
        validate_region_size(size)?;

        let fd = nix::sys::mman::shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| match e {
            Errno::EEXIST => SharedMemoryError::AlreadyExists(name.to_string()),
            e => SharedMemoryError::from_errno(e, format!("shm_open({}) failed", name)),
        })?;

        let file = File::from(fd);
        let map = unlink_on_error(
            name,
            file.set_len(size as u64)
                .map_err(SharedMemoryError::from)
                .and_then(|()| map_file(&file, size)),
        )?;
        info!("Created shared region {} ({} bytes)", name, size);
        Ok(Self::from_map(Some(name.to_string()), map, true))
    }

    /// Create the region, or attach to it if another process got there first
    pub fn create_or_attach(name: &str, size: usize, options: &WaitOptions) -> Result<Provisioned<Self>> {
        match Self::create(name, size) {
            Ok(region) => Ok(Provisioned::Created(region)),
            Err(SharedMemoryError::AlreadyExists(_)) => {
                debug!("Shared region {} already exists, attaching", name);
                Self::attach(name, size, options).map(Provisioned::Existing)
            }
            Err(err) => Err(err),
        }
    }

    /// Wait until a region named `name` exists with at least
    /// `expected_min_size` bytes (and never zero), then map it.
    #[instrument(level = "debug", skip(options))]
    pub fn attach(name: &str, expected_min_size: usize, options: &WaitOptions) -> Result<Self> {
        PlatformUtils::validate_name(name)?;
        let min_size = expected_min_size.max(1);

        let region = poll_until(name, options, || try_open(name, min_size))?;
        info!("Attached shared region {} ({} bytes)", name, region.size);
        Ok(region)
    }

    /// Process-local region with the same access API, for loopback runs and tests
    pub fn anonymous(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(SharedMemoryError::OutOfRange { offset: 0, len: 0, size: 0 });
        }
        let map = MmapMut::map_anon(size)?;
        Ok(Self::from_map(None, map, true))
    }

    /// Remove a region name; returns whether it existed
    pub fn unlink(name: &str) -> Result<bool> {
        PlatformUtils::validate_name(name)?;
        match nix::sys::mman::shm_unlink(name) {
            Ok(()) => {
                debug!("Unlinked shared region {}", name);
                Ok(true)
            }
            Err(Errno::ENOENT) => Ok(false),
            Err(e) => Err(SharedMemoryError::from_errno(e, format!("shm_unlink({}) failed", name))),
        }
    }

    fn from_map(name: Option<String>, mut map: MmapMut, is_creator: bool) -> Self {
        let size = map.len();
        // memmap2 never hands out a null mapping for a non-empty length
        let ptr = NonNull::new(map.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            name,
            size,
            ptr,
            _map: map,
            is_creator,
            persist: false,
        }
    }

    /// Region name, `None` when anonymous
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Region size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this process created the region
    pub fn is_creator(&self) -> bool {
        self.is_creator
    }

    /// Keep the name alive after this handle drops
    pub fn persist(&mut self) {
        self.persist = true;
    }

    /// Check that `[offset, offset + len)` lies inside the region
    pub fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(SharedMemoryError::OutOfRange { offset, len, size: self.size }),
        }
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the region
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len())?;
        // SAFETY: the range was checked against the mapping length and `dst`
        // cannot overlap a mapping this handle owns.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copy `src` into the region starting at `offset`
    pub fn write_bytes(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_range(offset, src.len())?;
        // SAFETY: as in `read_bytes`; the mapping is PROT_WRITE.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
        }
        Ok(())
    }

    /// Volatile read of a native-endian i32 the peer may change at any time
    pub fn read_i32(&self, offset: usize) -> Result<i32> {
        self.check_range(offset, 4)?;
        // SAFETY: in bounds; `[u8; 4]` has alignment 1.
        let bytes = unsafe { std::ptr::read_volatile(self.ptr.as_ptr().add(offset) as *const [u8; 4]) };
        Ok(i32::from_ne_bytes(bytes))
    }

    /// Volatile write of a native-endian i32
    pub fn write_i32(&self, offset: usize, value: i32) -> Result<()> {
        self.check_range(offset, 4)?;
        // SAFETY: in bounds; `[u8; 4]` has alignment 1.
        unsafe {
            std::ptr::write_volatile(self.ptr.as_ptr().add(offset) as *mut [u8; 4], value.to_ne_bytes());
        }
        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let (Some(name), true, false) = (&self.name, self.is_creator, self.persist) {
            if let Err(err) = Self::unlink(name) {
                warn!("Failed to unlink shared region {}: {}", name, err);
            }
        }
    }
}

// SAFETY: the mapping is process-wide and every access is a bounds-checked
// copy; cross-thread ordering is the caller's protocol, as it is cross-process.
unsafe impl Send for SharedRegion {}
// SAFETY: see above.
unsafe impl Sync for SharedRegion {}

fn try_open(name: &str, min_size: usize) -> Result<Option<SharedRegion>> {
    let fd = match nix::sys::mman::shm_open(name, OFlag::O_RDWR, Mode::empty()) {
        Ok(fd) => fd,
        Err(Errno::ENOENT) => return Ok(None),
        Err(e) => return Err(SharedMemoryError::from_errno(e, format!("shm_open({}) failed", name))),
    };

    let file = File::from(fd);
    let size = file.metadata()?.len() as usize;
    if size < min_size {
        // Creator has not sized it yet
        return Ok(None);
    }

    let map = map_file(&file, size)?;
    Ok(Some(SharedRegion::from_map(Some(name.to_string()), map, false)))
}

/// A half-created region must not keep its name, or every later `create`
/// fails with `AlreadyExists`
fn unlink_on_error<T>(name: &str, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        warn!("Creating shared region {} failed, unlinking: {}", name, err);
        if let Err(unlink_err) = SharedRegion::unlink(name) {
            warn!("Failed to unlink shared region {}: {}", name, unlink_err);
        }
    }
    result
}

fn map_file(file: &File, size: usize) -> Result<MmapMut> {
    // SAFETY: the file is a shm object; concurrent modification by the peer
    // is the point of the mapping and all access goes through raw copies.
    let map = unsafe { MmapOptions::new().len(size).map_mut(file) }
        .map_err(|e| SharedMemoryError::Platform(format!("mmap failed: {}", e)))?;
    Ok(map)
}

/// Validate region size
fn validate_region_size(size: usize) -> Result<()> {
    const MAX_SIZE: usize = 1024 * 1024 * 1024; // 1GB

    if size == 0 || size > MAX_SIZE {
        return Err(SharedMemoryError::OutOfRange { offset: 0, len: size, size: MAX_SIZE });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn unique(prefix: &str) -> String {
        PlatformUtils::generate_region_name(prefix)
    }

    #[test]
    fn test_region_creation_and_attach() {
        let name = unique("region_attach");
        let region = SharedRegion::create(&name, 4096).unwrap();
        assert_eq!(region.name(), Some(name.as_str()));
        assert_eq!(region.size(), 4096);
        assert!(region.is_creator());

        region.write_bytes(100, b"hello").unwrap();

        let attached = SharedRegion::attach(&name, 4096, &WaitOptions::with_timeout(Duration::from_secs(1))).unwrap();
        assert!(!attached.is_creator());
        let mut buf = [0u8; 5];
        attached.read_bytes(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_create_or_attach_is_tagged() {
        let name = unique("region_tagged");
        let options = WaitOptions::with_timeout(Duration::from_secs(1));

        let first = SharedRegion::create_or_attach(&name, 4096, &options).unwrap();
        assert!(first.was_created());
        let second = SharedRegion::create_or_attach(&name, 4096, &options).unwrap();
        assert!(!second.was_created());
        assert_eq!(second.into_inner().size(), 4096);
    }

    #[test]
    fn test_creator_unlinks_on_drop() {
        let name = unique("region_drop");
        drop(SharedRegion::create(&name, 4096).unwrap());
        assert!(!SharedRegion::unlink(&name).unwrap());

        let mut kept = SharedRegion::create(&name, 4096).unwrap();
        kept.persist();
        drop(kept);
        assert!(SharedRegion::unlink(&name).unwrap());
    }

    #[test]
    fn test_attach_times_out_without_region() {
        let name = unique("region_missing");
        let poll = Duration::from_millis(25);
        let options = WaitOptions::fixed(Duration::from_millis(150), poll);

        let started = Instant::now();
        let err = SharedRegion::attach(&name, 16, &options).unwrap_err();
        assert!(matches!(err, SharedMemoryError::ResourceUnavailable { .. }));
        assert!(started.elapsed() <= Duration::from_millis(150) + poll + Duration::from_millis(50));
    }

    #[test]
    fn test_attach_waits_for_minimum_size() {
        let name = unique("region_small");
        let _small = SharedRegion::create(&name, 64).unwrap();
        let options = WaitOptions::fixed(Duration::from_millis(60), Duration::from_millis(10));
        let err = SharedRegion::attach(&name, 128, &options).unwrap_err();
        assert!(matches!(err, SharedMemoryError::ResourceUnavailable { .. }));
    }

    #[test]
    fn test_bounds_checks() {
        let region = SharedRegion::anonymous(48).unwrap();
        assert!(region.write_bytes(40, &[1u8; 8]).is_ok());
        assert!(matches!(
            region.write_bytes(41, &[1u8; 8]),
            Err(SharedMemoryError::OutOfRange { offset: 41, len: 8, size: 48 })
        ));
        assert!(region.read_i32(usize::MAX).is_err());

        region.write_i32(44, -7).unwrap();
        assert_eq!(region.read_i32(44).unwrap(), -7);
    }

    #[test]
    fn test_failed_create_releases_name() {
        let name = unique("region_half_created");
        let mut region = SharedRegion::create(&name, 4096).unwrap();
        region.persist();
        drop(region);

        let failed: Result<()> = Err(SharedMemoryError::Platform("mmap failed".into()));
        assert!(unlink_on_error(&name, failed).is_err());

        // The name is free again
        let recreated = SharedRegion::create(&name, 4096).unwrap();
        assert!(recreated.is_creator());
    }

    #[test]
    fn test_name_validation() {
        assert!(SharedRegion::create("", 4096).is_err());
        assert!(SharedRegion::create("test\0name", 4096).is_err());
        assert!(SharedRegion::create(&unique("zero"), 0).is_err());
    }
}
