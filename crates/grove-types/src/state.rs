//! Instance lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The lifecycle state of a supervised instance.
///
/// `Running`/`Waiting` are interchangeable publications of the same live
/// state: an instance idle for more than 2 s is reported as `Waiting`.
/// `Attached` and `Checking` are transient live states. The remaining four
/// are terminal: no transition leaves them except an explicit restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Running,
    Waiting,
    Attached,
    Checking,
    Exited,
    Crashed,
    Killed,
    Finished,
}

impl InstanceState {
    /// Whether this state admits no further transitions without a restart.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceState::Exited
                | InstanceState::Crashed
                | InstanceState::Killed
                | InstanceState::Finished
        )
    }

    /// The wire/persisted spelling of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Running => "RUNNING",
            InstanceState::Waiting => "WAITING",
            InstanceState::Attached => "ATTACHED",
            InstanceState::Checking => "CHECKING",
            InstanceState::Exited => "EXITED",
            InstanceState::Crashed => "CRASHED",
            InstanceState::Killed => "KILLED",
            InstanceState::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
