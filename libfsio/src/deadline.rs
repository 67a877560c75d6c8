use std::time::{Duration, Instant, SystemTime};

/// A time bound for an operation. `None` in an `Option<Deadline>` means
/// wait forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Measured on the steady clock from the moment the call begins.
    Relative(Duration),
    /// A point on the wall clock.
    Absolute(SystemTime),
}

impl Deadline {
    /// Zero relative deadline: try once, never wait.
    pub const fn zero() -> Self {
        Deadline::Relative(Duration::ZERO)
    }

    pub fn after(d: Duration) -> Self {
        Deadline::Relative(d)
    }

    pub fn at(t: SystemTime) -> Self {
        Deadline::Absolute(t)
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Deadline::Relative(d) if d.is_zero())
    }
}

impl From<Duration> for Deadline {
    fn from(d: Duration) -> Self {
        Deadline::Relative(d)
    }
}

impl From<SystemTime> for Deadline {
    fn from(t: SystemTime) -> Self {
        Deadline::Absolute(t)
    }
}

/// A deadline pinned to the moment a call started.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeadlineTimer {
    deadline: Option<Deadline>,
    began: Instant,
}

impl DeadlineTimer {
    pub(crate) fn start(deadline: Option<Deadline>) -> Self {
        DeadlineTimer {
            deadline,
            began: Instant::now(),
        }
    }

    pub(crate) fn is_infinite(&self) -> bool {
        self.deadline.is_none()
    }

    /// Time left, `None` when infinite. Saturates at zero.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        match self.deadline? {
            Deadline::Relative(budget) => Some(budget.saturating_sub(self.began.elapsed())),
            Deadline::Absolute(end) => Some(
                end.duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO),
            ),
        }
    }

    pub(crate) fn expired(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }
}
