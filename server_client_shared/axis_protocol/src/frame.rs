use std::fmt;

use itertools::Itertools;
use nom::{
    bytes::complete::{take_until, take_while1, take_while_m_n},
    character::complete::{char, digit1},
    combinator::{all_consuming, opt, rest},
    sequence::{delimited, preceded, separated_pair, tuple},
    IResult,
};
use thiserror::Error;

use crate::axis::{AxisId, CommandCode};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed line {0:?}")]
    Malformed(String),
    #[error("unknown target {0:?}")]
    UnknownTarget(String),
    #[error("unknown command code {0:?}")]
    UnknownCode(String),
    #[error("checksum mismatch: frame carries {carried:02X}, content hashes to {computed:02X}")]
    ChecksumMismatch { carried: u8, computed: u8 },
}

/// One instruction for one axis controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveCommand {
    pub target: AxisId,
    pub code: CommandCode,
    pub params: Option<String>,
}

impl SlaveCommand {
    pub fn new(target: AxisId, code: CommandCode, params: Option<String>) -> Self {
        SlaveCommand {
            target,
            code,
            params: params.filter(|params| !params.is_empty()),
        }
    }
}

impl fmt::Display for SlaveCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.params {
            Some(params) => write!(f, "{};{};{}", self.target, self.code, params),
            None => write!(f, "{};{}", self.target, self.code),
        }
    }
}

/// CRC8 with polynomial 0x07 and a zero initial value, most significant bit first.
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |crc, byte| {
        (0..8).fold(crc ^ byte, |crc, _| {
            if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            }
        })
    })
}

/// Renders commands as they go on the wire, without the trailing newline.
///
/// A lone command is sent as a plain line; anything more is wrapped as
/// `#cmd,cmd*XX#` where `XX` is the CRC8 of the text between `#` and `*`.
pub fn encode_frame(commands: &[SlaveCommand]) -> Option<String> {
    match commands {
        [] => None,
        [single] => Some(single.to_string()),
        _ => {
            let content = commands.iter().join(",");
            let checksum = crc8(content.as_bytes());
            Some(format!("#{}*{:02X}#", content, checksum))
        }
    }
}

fn frame_parts(input: &str) -> IResult<&str, (&str, &str)> {
    delimited(
        char('#'),
        separated_pair(
            take_until("*"),
            char('*'),
            take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
        ),
        char('#'),
    )(input)
}

fn command_parts(input: &str) -> IResult<&str, (&str, &str, Option<&str>)> {
    tuple((
        take_while1(|c: char| c.is_ascii_alphanumeric()),
        preceded(char(';'), digit1),
        opt(preceded(char(';'), rest)),
    ))(input)
}

fn parse_command(text: &str) -> Result<SlaveCommand, FrameError> {
    let (_, (target, code, params)) =
        all_consuming(command_parts)(text).map_err(|_| FrameError::Malformed(text.to_string()))?;
    let target = AxisId::parse(target).ok_or_else(|| FrameError::UnknownTarget(target.to_string()))?;
    let code = code
        .parse::<u8>()
        .ok()
        .and_then(CommandCode::from_code)
        .ok_or_else(|| FrameError::UnknownCode(code.to_string()))?;
    Ok(SlaveCommand::new(target, code, params.map(str::to_string)))
}

/// Validates a `#...*XX#` frame and splits it into its commands.
pub fn decode_frame(frame: &str) -> Result<Vec<SlaveCommand>, FrameError> {
    let (_, (content, checksum)) =
        all_consuming(frame_parts)(frame).map_err(|_| FrameError::Malformed(frame.to_string()))?;
    let carried =
        u8::from_str_radix(checksum, 16).map_err(|_| FrameError::Malformed(frame.to_string()))?;
    let computed = crc8(content.as_bytes());
    if carried != computed {
        return Err(FrameError::ChecksumMismatch { carried, computed });
    }
    content.split(',').map(parse_command).collect()
}

/// Decodes one received line, framed or plain.
pub fn decode_line(line: &str) -> Result<Vec<SlaveCommand>, FrameError> {
    let line = line.trim();
    if line.starts_with('#') {
        decode_frame(line)
    } else {
        parse_command(line).map(|command| vec![command])
    }
}
