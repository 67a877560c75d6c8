//! A many-entity read-write mutex shared by uncoordinated processes through
//! nothing but byte range locks on one file.

mod config;
mod lock_files;

use std::fmt;

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::io_handle::ExtentGuard;

pub use config::{DEFAULT_LOCK_FILE_NAME, FsMutexConfig, SpinPolicy};
pub use lock_files::FilesystemMutex;

const OFFSET_RANGE: u64 = i64::MAX as u64;

/// One thing to exclude others from, shared or exclusively.
///
/// The value doubles as the byte offset locked in the shared file, so every
/// participating process must derive it the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Entity {
    value: u64,
    exclusive: bool,
}

impl Entity {
    /// `value` is reduced below `i64::MAX`, which keeps the one byte lock at
    /// that offset inside the range a POSIX `off_t` can express.
    pub fn new(value: u64, exclusive: bool) -> Self {
        Entity {
            value: value % OFFSET_RANGE,
            exclusive,
        }
    }

    pub fn shared(value: u64) -> Self {
        Entity::new(value, false)
    }

    pub fn exclusive(value: u64) -> Self {
        Entity::new(value, true)
    }

    /// Hashes an arbitrary name with SHA-256 and keeps the first eight bytes.
    pub fn from_name(name: impl AsRef<[u8]>, exclusive: bool) -> Self {
        let digest = Sha256::digest(name.as_ref());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        Entity::new(u64::from_le_bytes(head), exclusive)
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

/// Folds duplicate values into one entity, exclusive if any duplicate was.
/// First occurrence decides the position.
pub(crate) fn coalesce(entities: &[Entity]) -> Vec<Entity> {
    let mut out: Vec<Entity> = Vec::with_capacity(entities.len());
    for e in entities {
        match out.iter_mut().find(|o| o.value == e.value) {
            Some(seen) => seen.exclusive |= e.exclusive,
            None => out.push(*e),
        }
    }
    out
}

/// A set of entities locked together by `FilesystemMutex::lock`.
///
/// Entities are listed in the order they were finally acquired, which need
/// not be the order they were asked for.
#[derive(Default)]
pub struct EntitiesGuard<'m> {
    entities: Vec<Entity>,
    extents: Vec<ExtentGuard<'m>>,
}

impl<'m> EntitiesGuard<'m> {
    pub(crate) fn new(entities: Vec<Entity>, extents: Vec<ExtentGuard<'m>>) -> Self {
        EntitiesGuard { entities, extents }
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn is_locked(&self) -> bool {
        self.extents.iter().any(|e| e.is_locked())
    }

    /// Unlocks every entity still held, last acquired first. Calling it
    /// again, or dropping the guard afterwards, unlocks nothing more.
    pub fn unlock(&mut self) -> Result<()> {
        let mut outcome = Ok(());
        while let Some(mut extent) = self.extents.pop() {
            if let Err(e) = extent.unlock() {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }

    /// Detaches without unlocking. Pass the result to
    /// `FilesystemMutex::unlock` later.
    pub fn release(&mut self) -> Vec<Entity> {
        for extent in self.extents.iter_mut() {
            extent.release();
        }
        self.extents.clear();
        std::mem::take(&mut self.entities)
    }
}

impl Drop for EntitiesGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            tracing::debug!(%e, "unlocking entities on drop failed");
        }
    }
}

impl fmt::Debug for EntitiesGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitiesGuard")
            .field("entities", &self.entities)
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_value_fits_signed_offset() {
        let e = Entity::exclusive(u64::MAX);
        assert!(e.value() < i64::MAX as u64);
        assert!(e.is_exclusive());
        assert_eq!(Entity::shared(42).value(), 42);
        assert!(!Entity::shared(42).is_exclusive());
        assert_eq!(Entity::new(i64::MAX as u64, false).value(), 0);
    }

    #[test]
    fn test_from_name_is_stable() {
        let a = Entity::from_name("volumes/pv-1", true);
        let b = Entity::from_name(b"volumes/pv-1", false);
        assert_eq!(a.value(), b.value());
        assert_ne!(a, b);
        assert_ne!(a.value(), Entity::from_name("volumes/pv-2", true).value());
        assert!(a.value() < i64::MAX as u64);
    }

    #[test]
    fn test_coalesce_keeps_order_and_strongest_mode() {
        let merged = coalesce(&[
            Entity::shared(3),
            Entity::shared(1),
            Entity::exclusive(3),
            Entity::shared(1),
        ]);
        assert_eq!(merged, vec![Entity::exclusive(3), Entity::shared(1)]);
        assert!(coalesce(&[]).is_empty());
    }

    #[test]
    fn test_default_guard_is_empty() {
        let mut guard = EntitiesGuard::default();
        assert!(!guard.is_locked());
        assert!(guard.entities().is_empty());
        guard.unlock().unwrap();
        assert!(guard.release().is_empty());
    }
}
