use std::fmt;

use serde::{Deserialize, Serialize};

/// One axis controller on the bus, addressed by a single lower case letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisId {
    X,
    Y,
    Z,
    T,
    G,
}

impl AxisId {
    pub const ALL: [AxisId; 5] = [AxisId::X, AxisId::Y, AxisId::Z, AxisId::T, AxisId::G];

    pub fn as_char(self) -> char {
        match self {
            AxisId::X => 'x',
            AxisId::Y => 'y',
            AxisId::Z => 'z',
            AxisId::T => 't',
            AxisId::G => 'g',
        }
    }
    pub fn from_char(value: char) -> Option<AxisId> {
        match value.to_ascii_lowercase() {
            'x' => Some(AxisId::X),
            'y' => Some(AxisId::Y),
            'z' => Some(AxisId::Z),
            't' => Some(AxisId::T),
            'g' => Some(AxisId::G),
            _ => None,
        }
    }
    /// Accepts exactly one character, in either case.
    pub fn parse(text: &str) -> Option<AxisId> {
        let mut chars = text.chars();
        match (chars.next(), chars.next()) {
            (Some(value), None) => AxisId::from_char(value),
            _ => None,
        }
    }
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandCode {
    None,
    Run,
    Zero,
    SetSpeed,
    Set,
    Wait,
    Group,
    Detect,
}

impl CommandCode {
    pub fn code(self) -> u8 {
        match self {
            CommandCode::None => 0,
            CommandCode::Run => 1,
            CommandCode::Zero => 2,
            CommandCode::SetSpeed => 6,
            CommandCode::Set => 7,
            CommandCode::Wait => 8,
            CommandCode::Group => 9,
            CommandCode::Detect => 10,
        }
    }
    pub fn from_code(code: u8) -> Option<CommandCode> {
        Some(match code {
            0 => CommandCode::None,
            1 => CommandCode::Run,
            2 => CommandCode::Zero,
            6 => CommandCode::SetSpeed,
            7 => CommandCode::Set,
            8 => CommandCode::Wait,
            9 => CommandCode::Group,
            10 => CommandCode::Detect,
            _ => return None,
        })
    }
    /// Codes after which the receiving axis reports a finished motion.
    pub fn is_motion(self) -> bool {
        matches!(self, CommandCode::Run | CommandCode::Zero | CommandCode::Group)
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
