//! Process lifecycle status.

/// Lifecycle of a single process stage.
///
/// `NotStarted → Running → {Completed, TimedOut, Failed}`. Terminal states
/// only leave via an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProcessStatus {
    /// Constructed but never spawned.
    #[default]
    NotStarted,
    /// Spawned and not yet reaped.
    Running,
    /// Exited on its own (or was killed on request) and has been reaped.
    Completed,
    /// Killed because the configured deadline passed.
    TimedOut,
    /// Could not be spawned at all.
    Failed,
}

impl ProcessStatus {
    /// True once the stage can no longer change without a reset.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed | ProcessStatus::TimedOut | ProcessStatus::Failed
        )
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::NotStarted => write!(f, "NotStarted"),
            ProcessStatus::Running => write!(f, "Running"),
            ProcessStatus::Completed => write!(f, "Completed"),
            ProcessStatus::TimedOut => write!(f, "TimedOut"),
            ProcessStatus::Failed => write!(f, "Failed"),
        }
    }
}
