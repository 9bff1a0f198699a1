//! Terminal color helpers for CLI output.

use grove_types::InstanceState;

pub const RESET: &str = "\x1b[0m";
pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const RED: &str = "\x1b[31m";
pub const GREEN: &str = "\x1b[32m";
pub const YELLOW: &str = "\x1b[33m";
pub const CYAN: &str = "\x1b[36m";

/// The color a state renders with in listings.
pub fn state_color(state: InstanceState) -> &'static str {
    match state {
        InstanceState::Running => GREEN,
        InstanceState::Waiting | InstanceState::Killed => YELLOW,
        InstanceState::Attached | InstanceState::Checking => CYAN,
        InstanceState::Crashed => RED,
        InstanceState::Exited | InstanceState::Finished => DIM,
    }
}
