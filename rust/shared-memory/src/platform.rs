//! Platform helpers: naming conventions and memory fences

use crate::{Result, SharedMemoryError};

/// Longest name accepted for regions and semaphores (NAME_MAX minus the
/// `sem.` prefix glibc adds under /dev/shm)
pub const MAX_NAME_LEN: usize = 251;

/// Suffix joining a base region name and a slot number
pub const SLOT_NAME_SEPARATOR: &str = "_BUF_";

/// Platform-specific utilities
pub struct PlatformUtils;

impl PlatformUtils {
    /// Get current process ID
    pub fn get_process_id() -> u32 {
        std::process::id()
    }

    /// Name of the `index`-th buffer of a multi-slot set: `<base>_BUF_<index>`
    pub fn slot_region_name(base: &str, index: usize) -> String {
        format!("{}{}{}", base, SLOT_NAME_SEPARATOR, index)
    }

    /// Per-process replica of a name, used when several workers share a host
    pub fn process_scoped_name(base: &str, process_index: usize) -> String {
        format!("{}_{}", base, process_index)
    }

    /// Generate a name that cannot collide with a concurrent run
    pub fn generate_region_name(prefix: &str) -> String {
        format!(
            "{}_{}_{}",
            prefix,
            Self::get_process_id(),
            uuid::Uuid::new_v4().simple()
        )
    }

    /// Check a region or semaphore name before it reaches the OS
    pub fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(SharedMemoryError::InvalidName(format!(
                "name length must be 1..={}, got {}",
                MAX_NAME_LEN,
                name.len()
            )));
        }

        if name.contains('\0') {
            return Err(SharedMemoryError::InvalidName(format!(
                "{:?} contains a null byte",
                name
            )));
        }

        // Only a leading slash is portable for POSIX IPC names
        if name.trim_start_matches('/').contains('/') {
            return Err(SharedMemoryError::InvalidName(format!(
                "{:?} contains an interior slash",
                name
            )));
        }

        Ok(())
    }
}

/// Memory fences bracketing accesses to memory another process writes
pub struct MemoryBarriers;

impl MemoryBarriers {
    /// Acquire barrier, issued before reading data the peer published
    pub fn acquire_barrier() {
        std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
    }

    /// Release barrier, issued after writing data the peer will read
    pub fn release_barrier() {
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_naming_conventions() {
        assert_eq!(PlatformUtils::slot_region_name("model_shm", 2), "model_shm_BUF_2");
        assert_eq!(PlatformUtils::process_scoped_name("/python_sem", 3), "/python_sem_3");

        let generated = PlatformUtils::generate_region_name("test");
        assert!(generated.starts_with("test_"));
        assert_ne!(generated, PlatformUtils::generate_region_name("test"));
    }

    #[test]
    fn test_name_validation() {
        assert!(PlatformUtils::validate_name("model_shm").is_ok());
        assert!(PlatformUtils::validate_name("/python_sem").is_ok());
        assert!(PlatformUtils::validate_name("").is_err());
        assert!(PlatformUtils::validate_name("bad\0name").is_err());
        assert!(PlatformUtils::validate_name("/a/b").is_err());
        assert!(PlatformUtils::validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }
}
