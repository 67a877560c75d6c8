//! Finds directories usable for temporary and lock files, and tells apart
//! the ones backed by storage from the ones backed by memory.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::error::{Error, Result};

static STORAGE_BACKED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:btrfs|cifs|exfat|ext[2-4]|f2fs|hfs|apfs|jfs|lxfs|nfs[1-9]?|lustre|nilf2|ufs|vfat|xfs|zfs|msdosfs|newnfs|ntfs|smbfs|unionfs|fat|fat32|overlay2?)$",
    )
    .expect("storage backed pattern")
});
static MEMORY_BACKED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:tmpfs|ramfs)$").expect("memory backed pattern"));
static NETWORK_BACKED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:cifs|nfs[1-9]?|lustre|smbfs)$").expect("network backed pattern")
});

const ENV_VARS: [&str; 6] = ["TMPDIR", "TMP", "TEMP", "TEMPDIR", "XDG_RUNTIME_DIR", "XDG_CACHE_HOME"];

/// Where a candidate directory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Passed in by the caller.
    Local,
    Environment,
    /// Asked of the operating system.
    System,
    Hardcoded,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Source::Local => "local",
            Source::Environment => "environment",
            Source::System => "system",
            Source::Hardcoded => "hardcoded",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredPath {
    pub path: PathBuf,
    pub source: Source,
    /// `(st_dev, st_ino)` of the directory when it was probed. Anyone opening
    /// the path later can compare against it to detect a swapped directory.
    pub identity: Option<(u64, u64)>,
    pub fs_type: Option<String>,
}

impl DiscoveredPath {
    fn candidate(path: PathBuf, source: Source) -> Self {
        DiscoveredPath {
            path,
            source,
            identity: None,
            fs_type: None,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.identity.is_some()
    }

    pub fn is_storage_backed(&self) -> bool {
        self.fs_type.as_deref().is_some_and(|t| STORAGE_BACKED.is_match(t))
    }

    pub fn is_memory_backed(&self) -> bool {
        self.fs_type.as_deref().is_some_and(|t| MEMORY_BACKED.is_match(t))
    }

    pub fn is_networked(&self) -> bool {
        self.fs_type.as_deref().is_some_and(|t| NETWORK_BACKED.is_match(t))
    }
}

#[derive(Default)]
struct Cache {
    all: Option<Vec<DiscoveredPath>>,
    verified: Option<Vec<DiscoveredPath>>,
}

/// Discovery service. Lists are built on first use and kept until a
/// refresh; a mutex is held while building them.
pub struct PathDiscovery {
    candidates: Option<Vec<PathBuf>>,
    cache: Mutex<Cache>,
}

impl Default for PathDiscovery {
    fn default() -> Self {
        PathDiscovery::new()
    }
}

impl PathDiscovery {
    pub fn new() -> Self {
        PathDiscovery {
            candidates: None,
            cache: Mutex::new(Cache::default()),
        }
    }

    /// Considers only `candidates`, ignoring the environment and the
    /// system defaults.
    pub fn with_candidates(candidates: Vec<PathBuf>) -> Self {
        PathDiscovery {
            candidates: Some(candidates),
            cache: Mutex::new(Cache::default()),
        }
    }

    /// Every potential temporary directory, unprobed, best first.
    ///
    /// `overrides` go before everything else and `fallbacks` after the
    /// system provided directories. Both only take effect when the list is
    /// built, which is on the first call or when `refresh` is set. A
    /// refresh also discards the verified list.
    pub fn all_temporary_directories(
        &self,
        refresh: bool,
        fallbacks: &[PathBuf],
        overrides: &[PathBuf],
    ) -> Vec<DiscoveredPath> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if refresh || cache.all.is_none() {
            cache.all = Some(self.build(fallbacks, overrides));
            cache.verified = None;
        }
        cache.all.clone().unwrap_or_default()
    }

    /// The candidates which could actually be written to, each carrying its
    /// identity and filesystem type. This creates a file in every candidate
    /// so is slow, but it happens once per list.
    pub fn verified_temporary_directories(&self) -> Vec<DiscoveredPath> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(verified) = &cache.verified {
            return verified.clone();
        }
        let all = match cache.all.take() {
            Some(all) => all,
            None => self.build(&[], &[]),
        };
        let verified: Vec<DiscoveredPath> = all
            .iter()
            .filter_map(|candidate| match probe(&candidate.path) {
                Ok((identity, fs_type)) => Some(DiscoveredPath {
                    identity: Some(identity),
                    fs_type,
                    ..candidate.clone()
                }),
                Err(e) => {
                    tracing::trace!(path = %candidate.path.display(), %e, "temporary directory rejected");
                    None
                }
            })
            .collect();
        if verified.is_empty() {
            tracing::warn!("no writable temporary directory found");
        }
        cache.all = Some(all);
        cache.verified = Some(verified.clone());
        verified
    }

    pub fn storage_backed_temporary_files_directory(&self) -> Result<PathBuf> {
        self.first_verified(DiscoveredPath::is_storage_backed, "storage backed")
            .map(|d| d.path)
    }

    pub fn storage_backed_temporary_files_directory_is_networked(&self) -> Result<bool> {
        self.first_verified(DiscoveredPath::is_storage_backed, "storage backed")
            .map(|d| d.is_networked())
    }

    pub fn memory_backed_temporary_files_directory(&self) -> Result<PathBuf> {
        self.first_verified(DiscoveredPath::is_memory_backed, "memory backed")
            .map(|d| d.path)
    }

    pub fn memory_backed_temporary_files_directory_is_networked(&self) -> Result<bool> {
        self.first_verified(DiscoveredPath::is_memory_backed, "memory backed")
            .map(|d| d.is_networked())
    }

    fn first_verified(&self, accept: fn(&DiscoveredPath) -> bool, what: &str) -> Result<DiscoveredPath> {
        self.verified_temporary_directories()
            .into_iter()
            .find(|d| accept(d))
            .ok_or_else(|| Error::NotFound(format!("no {what} temporary directory")))
    }

    fn build(&self, fallbacks: &[PathBuf], overrides: &[PathBuf]) -> Vec<DiscoveredPath> {
        match &self.candidates {
            Some(only) => dedup(
                overrides
                    .iter()
                    .chain(only)
                    .chain(fallbacks)
                    .map(|p| DiscoveredPath::candidate(p.clone(), Source::Local))
                    .collect(),
            ),
            None => candidates(
                |key| std::env::var_os(key),
                is_privileged(),
                dirs::cache_dir(),
                nix::unistd::geteuid().as_raw(),
                fallbacks,
                overrides,
            ),
        }
    }
}

fn is_privileged() -> bool {
    use nix::unistd::{getegid, geteuid, getgid, getuid};
    getuid() != geteuid() || getgid() != getegid()
}

/// Builds the ranked candidate list. The environment is skipped entirely
/// when running set-uid or set-gid.
fn candidates(
    env: impl Fn(&str) -> Option<OsString>,
    privileged: bool,
    system_cache: Option<PathBuf>,
    euid: u32,
    fallbacks: &[PathBuf],
    overrides: &[PathBuf],
) -> Vec<DiscoveredPath> {
    let mut out: Vec<DiscoveredPath> = overrides
        .iter()
        .map(|p| DiscoveredPath::candidate(p.clone(), Source::Local))
        .collect();

    if !privileged {
        for key in ENV_VARS {
            if let Some(value) = env(key).filter(|v| !v.is_empty()) {
                out.push(DiscoveredPath::candidate(value.into(), Source::Environment));
            }
        }
        if let Some(home) = env("HOME").filter(|v| !v.is_empty()) {
            out.push(DiscoveredPath::candidate(
                PathBuf::from(home).join(".cache"),
                Source::Environment,
            ));
        }
    }
    if let Some(cache) = system_cache {
        out.push(DiscoveredPath::candidate(cache, Source::System));
    }
    out.extend(
        fallbacks
            .iter()
            .map(|p| DiscoveredPath::candidate(p.clone(), Source::Local)),
    );
    let run_user = format!("/run/user/{euid}");
    for hard in ["/tmp", "/var/tmp", run_user.as_str(), "/run/shm", "/"] {
        out.push(DiscoveredPath::candidate(PathBuf::from(hard), Source::Hardcoded));
    }
    dedup(out)
}

fn dedup(list: Vec<DiscoveredPath>) -> Vec<DiscoveredPath> {
    let mut seen = HashSet::new();
    list.into_iter()
        .filter(|d| seen.insert(d.path.clone()))
        .collect()
}

/// Proves `dir` writable by creating and removing a non-empty file in it.
fn probe(dir: &Path) -> Result<((u64, u64), Option<String>)> {
    let mut scratch = tempfile::Builder::new()
        .prefix(".libfsio-probe-")
        .tempfile_in(dir)?;
    scratch.write_all(b"probe")?;
    scratch.as_file().sync_data()?;
    drop(scratch);

    let st = nix::sys::stat::stat(dir)?;
    #[allow(clippy::unnecessary_cast)]
    let identity = (st.st_dev as u64, st.st_ino as u64);
    Ok((identity, fs_type_name(dir)?))
}

#[cfg(target_os = "linux")]
fn fs_type_name(dir: &Path) -> Result<Option<String>> {
    let st = nix::sys::statfs::statfs(dir)?;
    #[allow(clippy::unnecessary_cast)]
    let magic = st.filesystem_type().0 as u32;
    Ok(linux_fs_name(magic).map(str::to_string))
}

#[cfg(not(target_os = "linux"))]
fn fs_type_name(_dir: &Path) -> Result<Option<String>> {
    Ok(None)
}

/// Superblock magic numbers from `linux/magic.h`.
#[cfg(target_os = "linux")]
fn linux_fs_name(magic: u32) -> Option<&'static str> {
    let name = match magic {
        0x9123_683e => "btrfs",
        0xff53_4d42 | 0xfe53_4d42 => "cifs",
        0x2011_bab0 => "exfat",
        0xef53 => "ext4",
        0xf2f5_2010 => "f2fs",
        0x4244 | 0x482b => "hfs",
        0x3153_464a => "jfs",
        0x6969 => "nfs",
        0x0bd0_0bd0 => "lustre",
        0x3434 => "nilfs2",
        0x0001_1954 => "ufs",
        0x4d44 => "vfat",
        0x5846_5342 => "xfs",
        0x2fc1_2fc1 => "zfs",
        0x5346_544e => "ntfs",
        0x517b => "smbfs",
        0x794c_7630 => "overlay",
        0x0102_1994 => "tmpfs",
        0x8584_58f6 => "ramfs",
        0xca45_1a4e => "bcachefs",
        0x6573_5546 => "fuse",
        0x0102_1997 => "v9fs",
        0x7371_7368 => "squashfs",
        0x9fa0 => "proc",
        0x6265_6572 => "sysfs",
        _ => return None,
    };
    Some(name)
}
