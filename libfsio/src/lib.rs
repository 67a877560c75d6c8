//! Native file handles with deterministic caching semantics, deadline
//! bounded scatter-gather i/o and byte range locks, plus a many-entity
//! mutex shared between processes through a lock file.

pub mod deadline;
pub mod error;
pub mod file_handle;
pub mod fs_mutex;
pub mod handle;
pub mod io_handle;
pub mod native;
pub mod path_discovery;
mod sys;

// re-export selected public API
pub use deadline::Deadline;
pub use error::{Error, Result};
pub use file_handle::FileHandle;
pub use fs_mutex::{EntitiesGuard, Entity, FilesystemMutex, FsMutexConfig, SpinPolicy};
pub use handle::{Caching, Creation, Handle, HandleFlags, Mode};
pub use io_handle::{ExtentGuard, IoHandle, IoRequest, IoResult, RequestExtent};
pub use native::{Disposition, NativeHandle};
pub use path_discovery::{DiscoveredPath, PathDiscovery, Source};
