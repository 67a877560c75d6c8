use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_LOCK_FILE_NAME: &str = "lockfile";

/// What a contending process does between acquisition rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SpinPolicy {
    /// Give up the rest of the time slice and retry at once.
    #[default]
    Yield,
    /// Sleep, doubling from `initial_micros` up to `max_micros`.
    Backoff { initial_micros: u64, max_micros: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsMutexConfig {
    /// Name of the shared lock file inside the bound directory. Every
    /// participating process must agree on it.
    pub lock_file_name: String,
    pub spin: SpinPolicy,
    /// Give up with `TimedOut` after this many rounds.
    pub max_attempts: Option<u64>,
}

impl Default for FsMutexConfig {
    fn default() -> Self {
        FsMutexConfig {
            lock_file_name: DEFAULT_LOCK_FILE_NAME.to_string(),
            spin: SpinPolicy::default(),
            max_attempts: None,
        }
    }
}

impl FsMutexConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: FsMutexConfig = serde_json::from_str(&text)
            .map_err(|e| Error::InvalidInput(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.lock_file_name.as_str();
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(Error::InvalidInput(format!(
                "lock file name must be a plain file name, got {:?}",
                self.lock_file_name
            )));
        }
        if let SpinPolicy::Backoff {
            initial_micros,
            max_micros,
        } = self.spin
        {
            if initial_micros == 0 || initial_micros > max_micros {
                return Err(Error::InvalidInput(format!(
                    "backoff needs 0 < initial ({initial_micros}) <= max ({max_micros})"
                )));
            }
        }
        if self.max_attempts == Some(0) {
            return Err(Error::InvalidInput("max_attempts must be positive".into()));
        }
        Ok(())
    }
}

/// Carries out a `SpinPolicy` across the rounds of one lock call.
pub(crate) struct Spinner {
    policy: SpinPolicy,
    nap: Duration,
}

impl Spinner {
    pub(crate) fn new(policy: SpinPolicy) -> Self {
        let nap = match policy {
            SpinPolicy::Yield => Duration::ZERO,
            SpinPolicy::Backoff { initial_micros, .. } => Duration::from_micros(initial_micros),
        };
        Spinner { policy, nap }
    }

    /// Never sleeps past `remaining`.
    pub(crate) fn spin(&mut self, remaining: Option<Duration>) {
        match self.policy {
            SpinPolicy::Yield => std::thread::yield_now(),
            SpinPolicy::Backoff { max_micros, .. } => {
                let nap = remaining.map_or(self.nap, |r| self.nap.min(r));
                std::thread::sleep(nap);
                self.nap = (self.nap * 2).min(Duration::from_micros(max_micros));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FsMutexConfig::default();
        assert_eq!(config.lock_file_name, "lockfile");
        assert_eq!(config.spin, SpinPolicy::Yield);
        assert!(config.max_attempts.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_with_partial_fields() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("fsmutex.json");
        std::fs::write(
            &path,
            r#"{"spin": {"kind": "backoff", "initial_micros": 10, "max_micros": 1000}, "max_attempts": 5}"#,
        )?;
        let config = FsMutexConfig::from_file(&path)?;
        assert_eq!(config.lock_file_name, DEFAULT_LOCK_FILE_NAME);
        assert_eq!(
            config.spin,
            SpinPolicy::Backoff {
                initial_micros: 10,
                max_micros: 1000
            }
        );
        assert_eq!(config.max_attempts, Some(5));
        Ok(())
    }

    #[test]
    fn test_rejects_bad_config() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"lock_file_name": "../escape"}"#)?;
        assert!(matches!(FsMutexConfig::from_file(&path), Err(Error::InvalidInput(_))));

        std::fs::write(&path, "not json")?;
        assert!(matches!(FsMutexConfig::from_file(&path), Err(Error::InvalidInput(_))));

        let config = FsMutexConfig {
            spin: SpinPolicy::Backoff {
                initial_micros: 100,
                max_micros: 10,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        for name in [".", ".."] {
            let config = FsMutexConfig {
                lock_file_name: name.to_string(),
                ..Default::default()
            };
            assert!(matches!(config.validate(), Err(Error::InvalidInput(_))), "{name}");
        }
        Ok(())
    }

    #[test]
    fn test_backoff_respects_remaining_budget() {
        let mut spinner = Spinner::new(SpinPolicy::Backoff {
            initial_micros: 50_000,
            max_micros: 50_000,
        });
        let began = std::time::Instant::now();
        spinner.spin(Some(Duration::from_millis(1)));
        assert!(began.elapsed() < Duration::from_millis(40));
    }
}
