use std::fmt;

use serde::Serialize;

use crate::script::SystemCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SystemState {
    Idle,
    Running,
    Paused,
    Stopping,
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SystemState::Idle => "IDLE",
            SystemState::Running => "RUNNING",
            SystemState::Paused => "PAUSED",
            SystemState::Stopping => "STOPPING",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub to: SystemState,
    pub clear_queue: bool,
}

/// The allowed state changes. `None` means the command does nothing in `from`.
///
/// A STOP while already STOPPING gives up on the sequence in flight.
pub fn transition(from: SystemState, command: SystemCommand, in_flight: bool) -> Option<Transition> {
    let to = |to| Some(Transition { to, clear_queue: false });
    let cleared = |to| Some(Transition { to, clear_queue: true });
    match (from, command) {
        (SystemState::Idle | SystemState::Paused, SystemCommand::Play) => to(SystemState::Running),
        (SystemState::Running, SystemCommand::Pause) => to(SystemState::Paused),
        (SystemState::Running | SystemState::Paused, SystemCommand::Idle | SystemCommand::Stop) => {
            cleared(if in_flight { SystemState::Stopping } else { SystemState::Idle })
        }
        (SystemState::Idle, SystemCommand::Idle | SystemCommand::Stop) => cleared(SystemState::Idle),
        (SystemState::Stopping, SystemCommand::Stop) => cleared(SystemState::Idle),
        _ => None,
    }
}
