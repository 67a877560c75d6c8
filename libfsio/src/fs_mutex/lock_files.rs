use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use rand::seq::SliceRandom;

use super::config::{FsMutexConfig, Spinner};
use super::{EntitiesGuard, Entity, coalesce};
use crate::deadline::{Deadline, DeadlineTimer};
use crate::error::{Error, Result};
use crate::file_handle::FileHandle;
use crate::handle::{Caching, Creation, HandleFlags, Mode};
use crate::io_handle::{ExtentGuard, IoHandle};
use crate::path_discovery::PathDiscovery;

/// Many-entity compatibility mutex over one lock file in a directory.
///
/// Each entity is a one byte range lock at its value's offset. A set is
/// taken by trying every entity without waiting; on any conflict whatever
/// was taken is released, the order is shuffled and the round repeats.
/// Randomising the order is what breaks the symmetry between processes
/// asking for overlapping sets in opposite orders.
///
/// Caveats:
/// - waiters spin, there is no way to sleep until an entity frees up;
/// - a holder that dies while holding entities is not detected here,
///   although the kernel drops its locks when its descriptors close;
/// - nothing bounds how long an entity may be held.
///
/// Locks belong to the open file description, so every owner (a process,
/// or a thread wanting exclusion from its siblings) constructs its own
/// mutex.
#[derive(Debug)]
pub struct FilesystemMutex {
    dir: PathBuf,
    config: FsMutexConfig,
    lock_file: OnceCell<FileHandle>,
}

impl FilesystemMutex {
    /// Binds to `dir`. Nothing is created until the first lock.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FilesystemMutex {
            dir: dir.into(),
            config: FsMutexConfig::default(),
            lock_file: OnceCell::new(),
        }
    }

    pub fn with_config(dir: impl Into<PathBuf>, config: FsMutexConfig) -> Result<Self> {
        config.validate()?;
        Ok(FilesystemMutex {
            dir: dir.into(),
            config,
            lock_file: OnceCell::new(),
        })
    }

    /// Binds to `namespace` under the storage backed temporary directory,
    /// or the memory backed one if no storage backed directory exists. The
    /// namespace directory is created if missing.
    pub fn in_temporary_directory(discovery: &PathDiscovery, namespace: &str) -> Result<Self> {
        if namespace.is_empty() || namespace.contains('/') || namespace == ".." {
            return Err(Error::InvalidInput(format!(
                "namespace must be a plain directory name, got {namespace:?}"
            )));
        }
        let base = match discovery.storage_backed_temporary_files_directory() {
            Ok(dir) => dir,
            Err(Error::NotFound(_)) => discovery.memory_backed_temporary_files_directory()?,
            Err(e) => return Err(e),
        };
        let dir = base.join(namespace);
        std::fs::create_dir_all(&dir)?;
        Ok(FilesystemMutex::new(dir))
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &FsMutexConfig {
        &self.config
    }

    pub fn lock_file_path(&self) -> PathBuf {
        self.dir.join(&self.config.lock_file_name)
    }

    fn lock_file(&self) -> Result<&IoHandle> {
        let file: &IoHandle = self.lock_file.get_or_try_init(|| {
            let path = self.lock_file_path();
            tracing::debug!(path = %path.display(), "opening shared lock file");
            FileHandle::open(
                &path,
                Mode::Write,
                Creation::IfNeeded,
                Caching::Temporary,
                HandleFlags::empty(),
            )
        })?;
        Ok(file)
    }

    /// Locks every entity in `entities` or none of them.
    ///
    /// Duplicated values are locked once, exclusively if any duplicate
    /// asks for that. The deadline is checked before each retry and, from
    /// the second round on, before each entity. At least one full round is
    /// always attempted and a zero deadline means exactly one.
    /// Running out of time, or of `max_attempts`, is `TimedOut` with
    /// nothing held.
    pub fn lock(&self, entities: &[Entity], d: Option<Deadline>) -> Result<EntitiesGuard<'_>> {
        let timer = DeadlineTimer::start(d);
        let mut order = coalesce(entities);
        if order.is_empty() {
            return Ok(EntitiesGuard::default());
        }
        let file = self.lock_file()?;
        let mut spinner = Spinner::new(self.config.spin);
        let mut rng = rand::rng();
        let mut rounds: u64 = 0;
        loop {
            rounds += 1;
            // the first round always runs to completion
            let bound = (rounds > 1).then_some(&timer);
            match lock_round(file, &order, bound) {
                Ok(extents) => {
                    if rounds > 1 {
                        tracing::debug!(rounds, entities = order.len(), "entity set acquired after contention");
                    }
                    return Ok(EntitiesGuard::new(order, extents));
                }
                Err(Error::TimedOut) => {}
                Err(e) => return Err(e),
            }
            if timer.expired() || self.config.max_attempts.is_some_and(|max| rounds >= max) {
                tracing::debug!(rounds, "giving up on contended entity set");
                return Err(Error::TimedOut);
            }
            if rounds.is_power_of_two() {
                tracing::debug!(rounds, entities = order.len(), "entity set contended, retrying");
            }
            order.shuffle(&mut rng);
            spinner.spin(timer.remaining());
        }
    }

    /// One round only.
    pub fn try_lock(&self, entities: &[Entity]) -> Result<EntitiesGuard<'_>> {
        self.lock(entities, Some(Deadline::zero()))
    }

    /// Releases the byte lock of every listed entity, in any order. Only
    /// what is listed is touched. Every entity is attempted even if one
    /// fails; the first failure is reported.
    pub fn unlock(&self, entities: &[Entity]) -> Result<()> {
        let Some(file) = self.lock_file.get() else {
            return Ok(());
        };
        let mut outcome = Ok(());
        for entity in coalesce(entities) {
            if let Err(e) = file.unlock(entity.value(), 1) {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }
}

/// Tries each entity without waiting. On the first failure everything
/// taken so far is unlocked, newest first, and that failure is returned.
/// With a `timer`, an expired deadline before any entity fails the round
/// as `TimedOut`.
fn lock_round<'a>(
    file: &'a IoHandle,
    order: &[Entity],
    timer: Option<&DeadlineTimer>,
) -> Result<Vec<ExtentGuard<'a>>> {
    let mut held: Vec<ExtentGuard<'a>> = Vec::with_capacity(order.len());
    for entity in order {
        let attempt = if timer.is_some_and(DeadlineTimer::expired) {
            Err(Error::TimedOut)
        } else {
            file.try_lock(entity.value(), 1, entity.is_exclusive())
        };
        match attempt {
            Ok(extent) => held.push(extent),
            Err(e) => {
                while let Some(mut extent) = held.pop() {
                    if let Err(undo) = extent.unlock() {
                        tracing::warn!(%undo, "failed to unwind a partial entity lock");
                    }
                }
                return Err(e);
            }
        }
    }
    Ok(held)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_mutex::SpinPolicy;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn test_lock_file_created_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let mutex = FilesystemMutex::new(dir.path());
        assert!(!mutex.lock_file_path().exists());
        mutex.unlock(&[Entity::exclusive(1)]).unwrap();
        assert!(!mutex.lock_file_path().exists());

        let guard = mutex.lock(&[Entity::exclusive(1)], None).unwrap();
        assert!(guard.is_locked());
        assert!(dir.path().join("lockfile").exists());
    }

    #[test]
    fn test_exclusive_excludes_other_instances() {
        let dir = tempfile::tempdir().unwrap();
        let a = FilesystemMutex::new(dir.path());
        let b = FilesystemMutex::new(dir.path());

        let held = a.lock(&[Entity::exclusive(10), Entity::shared(20)], None).unwrap();
        assert!(matches!(b.try_lock(&[Entity::shared(10)]), Err(Error::TimedOut)));
        // shared entities stay compatible
        let mut shared = b.try_lock(&[Entity::shared(20)]).unwrap();
        shared.unlock().unwrap();
        assert!(matches!(b.try_lock(&[Entity::exclusive(20)]), Err(Error::TimedOut)));

        drop(held);
        b.try_lock(&[Entity::exclusive(10), Entity::exclusive(20)]).unwrap();
    }

    #[test]
    fn test_failed_lock_holds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let a = FilesystemMutex::new(dir.path());
        let b = FilesystemMutex::new(dir.path());
        let c = FilesystemMutex::new(dir.path());

        let _blocker = a.lock(&[Entity::exclusive(2)], None).unwrap();
        let began = Instant::now();
        let res = b.lock(
            &[Entity::exclusive(1), Entity::exclusive(2), Entity::exclusive(3)],
            Some(Deadline::after(Duration::from_millis(30))),
        );
        assert!(matches!(res, Err(Error::TimedOut)));
        assert!(began.elapsed() >= Duration::from_millis(30));

        // nothing b touched is left locked
        c.try_lock(&[Entity::exclusive(1), Entity::exclusive(3)]).unwrap();
    }

    #[test]
    fn test_round_stops_once_deadline_passes() {
        let dir = tempfile::tempdir().unwrap();
        let mutex = FilesystemMutex::new(dir.path());
        let file = mutex.lock_file().unwrap();
        let order = [Entity::exclusive(1), Entity::exclusive(2)];

        let expired = DeadlineTimer::start(Some(Deadline::zero()));
        assert!(matches!(
            lock_round(file, &order, Some(&expired)),
            Err(Error::TimedOut)
        ));
        let held = lock_round(file, &order, None).unwrap();
        assert_eq!(held.len(), 2);
    }

    #[test]
    fn test_max_attempts_bounds_rounds() {
        let dir = tempfile::tempdir().unwrap();
        let holder = FilesystemMutex::new(dir.path());
        let config = FsMutexConfig {
            spin: SpinPolicy::Backoff {
                initial_micros: 10,
                max_micros: 100,
            },
            max_attempts: Some(3),
            ..Default::default()
        };
        let waiter = FilesystemMutex::with_config(dir.path(), config).unwrap();

        let _held = holder.lock(&[Entity::exclusive(5)], None).unwrap();
        let res = waiter.lock(&[Entity::shared(5)], None);
        assert!(matches!(res, Err(Error::TimedOut)));
    }

    #[test]
    fn test_guard_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let a = FilesystemMutex::new(dir.path());
        let b = FilesystemMutex::new(dir.path());

        let mut guard = a.lock(&[Entity::exclusive(7), Entity::exclusive(8)], None).unwrap();
        guard.unlock().unwrap();
        assert!(!guard.is_locked());
        guard.unlock().unwrap();

        // a relocks 7; the spent guard must not free it on drop
        let _again = a.lock(&[Entity::exclusive(7)], None).unwrap();
        drop(guard);
        assert!(matches!(b.try_lock(&[Entity::exclusive(7)]), Err(Error::TimedOut)));
        b.try_lock(&[Entity::exclusive(8)]).unwrap();
    }

    #[test]
    fn test_released_entities_unlock_through_mutex() {
        let dir = tempfile::tempdir().unwrap();
        let a = FilesystemMutex::new(dir.path());
        let b = FilesystemMutex::new(dir.path());

        let entities = [Entity::from_name("alpha", true), Entity::from_name("beta", true)];
        let mut guard = a.lock(&entities, None).unwrap();
        let detached = guard.release();
        drop(guard);
        assert_eq!(detached.len(), 2);
        assert!(matches!(b.try_lock(&entities[..1]), Err(Error::TimedOut)));

        // a partial unlock leaves the rest held
        a.unlock(&detached[..1]).unwrap();
        assert!(matches!(b.try_lock(&entities), Err(Error::TimedOut)));
        b.try_lock(&entities[..1]).unwrap();

        a.unlock(&detached).unwrap();
        b.try_lock(&entities).unwrap();
    }

    #[test]
    fn test_empty_and_duplicate_entities() {
        let dir = tempfile::tempdir().unwrap();
        let a = FilesystemMutex::new(dir.path());
        let b = FilesystemMutex::new(dir.path());

        let empty = a.lock(&[], Some(Deadline::zero())).unwrap();
        assert!(!empty.is_locked());
        assert!(!a.lock_file_path().exists());

        let guard = a
            .lock(&[Entity::shared(4), Entity::exclusive(4)], None)
            .unwrap();
        assert_eq!(guard.entities(), &[Entity::exclusive(4)]);
        assert!(matches!(b.try_lock(&[Entity::shared(4)]), Err(Error::TimedOut)));
    }

    #[test]
    fn test_opposite_orders_make_progress() {
        const ROUNDS: usize = 200;
        let dir = tempfile::tempdir().unwrap();
        let inside = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = [
            vec![Entity::exclusive(1), Entity::shared(2)],
            vec![Entity::shared(2), Entity::exclusive(1)],
        ]
        .into_iter()
        .map(|set| {
            let path = dir.path().to_path_buf();
            let inside = Arc::clone(&inside);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mutex = FilesystemMutex::new(path);
                for _ in 0..ROUNDS {
                    let guard = mutex
                        .lock(&set, Some(Deadline::after(Duration::from_secs(30))))
                        .unwrap();
                    assert!(!inside.swap(true, Ordering::SeqCst), "entity 1 held twice");
                    std::thread::yield_now();
                    inside.store(false, Ordering::SeqCst);
                    drop(guard);
                    done.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 2 * ROUNDS);
    }

    #[test]
    fn test_in_temporary_directory() {
        let base = tempfile::tempdir().unwrap();
        let discovery = PathDiscovery::with_candidates(vec![base.path().to_path_buf()]);
        assert!(matches!(
            FilesystemMutex::in_temporary_directory(&discovery, "a/b"),
            Err(Error::InvalidInput(_))
        ));

        let mutex = match FilesystemMutex::in_temporary_directory(&discovery, "fslock-test") {
            Ok(mutex) => mutex,
            // scratch space on a filesystem neither pattern knows
            Err(Error::NotFound(_)) => return,
            Err(e) => panic!("{e}"),
        };
        assert_eq!(mutex.path(), base.path().join("fslock-test"));
        assert!(mutex.path().is_dir());
        mutex.try_lock(&[Entity::exclusive(9)]).unwrap();
    }
}
