use std::fmt;

use nom::{
    bytes::complete::tag_no_case,
    character::complete::{alpha1, char, digit1, one_of},
    combinator::{all_consuming, map, opt, recognize},
    error::{Error, ErrorKind},
    multi::many1,
    sequence::{pair, preceded, terminated, tuple},
    IResult,
};
use serde::{Deserialize, Serialize};

use super::tokenizer::{find_matching, split_top_level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SystemCommand {
    Idle,
    Play,
    Pause,
    Stop,
}

impl SystemCommand {
    pub fn parse(text: &str) -> Option<SystemCommand> {
        let text = text.trim();
        [SystemCommand::Idle, SystemCommand::Play, SystemCommand::Pause, SystemCommand::Stop]
            .into_iter()
            .find(|command| text.eq_ignore_ascii_case(command.word()))
    }
    pub fn word(self) -> &'static str {
        match self {
            SystemCommand::Idle => "IDLE",
            SystemCommand::Play => "PLAY",
            SystemCommand::Pause => "PAUSE",
            SystemCommand::Stop => "STOP",
        }
    }
}

impl fmt::Display for SystemCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.word())
    }
}

/// `X(100,d50)`: a target word and its comma separated arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionTerm {
    pub target: String,
    pub args: Vec<String>,
}

impl MotionTerm {
    /// Arguments as they travel on the wire, where `,` is reserved for batches.
    pub fn params(&self) -> Option<String> {
        if self.args.is_empty() {
            None
        } else {
            Some(self.args.join(";"))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Function { name: String, body: String },
    Call(String),
    Group(Vec<MotionTerm>),
    Set(bool),
    Wait,
    Detect,
    Speed { axis: Option<String>, value: String },
    Zero,
    Move(Vec<MotionTerm>),
    System(SystemCommand),
    Malformed(String),
    Unknown,
}

fn enclosed(input: &str, open: char) -> IResult<&str, &str> {
    if !input.starts_with(open) {
        return Err(nom::Err::Error(Error::new(input, ErrorKind::Char)));
    }
    match find_matching(input, 0) {
        Some(close) => Ok((&input[close + 1..], &input[1..close])),
        None => Err(nom::Err::Error(Error::new(input, ErrorKind::TakeUntil))),
    }
}
fn parenthesized(input: &str) -> IResult<&str, &str> {
    enclosed(input, '(')
}
fn braced(input: &str) -> IResult<&str, &str> {
    enclosed(input, '{')
}

fn is_argument(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '+')
}

fn motion_term(input: &str) -> IResult<&str, MotionTerm> {
    map(pair(alpha1, parenthesized), |(target, inner): (&str, &str)| MotionTerm {
        target: target.to_string(),
        args: split_top_level(inner, b',')
            .into_iter()
            .filter(|arg| !arg.is_empty())
            .map(str::to_string)
            .collect(),
    })(input)
}

fn valid_terms(terms: &[MotionTerm]) -> bool {
    !terms.is_empty()
        && terms
            .iter()
            .all(|term| !term.args.is_empty() && term.args.iter().all(|arg| is_argument(arg)))
}

/// Axis terms of a coordinate move, e.g. `X(100)Y(50)` or `X(100,d20),Z(5)`.
pub fn parse_motion(text: &str) -> Option<Vec<MotionTerm>> {
    let (_, terms) = all_consuming(many1(terminated(motion_term, opt(char(',')))))(text).ok()?;
    Some(terms)
}

/// Sub-commands of `GROUP(...)`, split on the commas outside nested brackets.
pub fn parse_group(text: &str) -> Option<Vec<MotionTerm>> {
    let (_, inner) = all_consuming(preceded(tag_no_case("GROUP"), parenthesized))(text).ok()?;
    split_top_level(inner, b',')
        .into_iter()
        .map(|part| all_consuming(motion_term)(part).ok().map(|(_, term)| term))
        .collect()
}

fn number(input: &str) -> IResult<&str, &str> {
    recognize(tuple((opt(char('-')), digit1, opt(pair(char('.'), digit1)))))(input)
}

/// `SPEED;500` or `SPEED;x;700`.
pub fn parse_speed(text: &str) -> Option<(Option<String>, String)> {
    let (_, (axis, value)) = all_consuming(preceded(
        tag_no_case("SPEED;"),
        pair(opt(terminated(alpha1, char(';'))), number),
    ))(text)
    .ok()?;
    Some((axis.map(str::to_string), value.to_string()))
}

fn set_level(input: &str) -> IResult<&str, char> {
    preceded(tag_no_case("SET"), preceded(char('('), terminated(one_of("01"), char(')'))))(input)
}

fn parse_set(text: &str) -> Option<bool> {
    let (_, level) = all_consuming(set_level)(text).ok()?;
    Some(level == '1')
}

fn parse_function(text: &str) -> Option<(String, String)> {
    let (_, (name, body)) =
        all_consuming(preceded(tag_no_case("FUNC"), pair(parenthesized, braced)))(text).ok()?;
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), body.to_string()))
}

fn parse_call(text: &str) -> Option<String> {
    let (_, name) = all_consuming(preceded(tag_no_case("CALL"), parenthesized))(text).ok()?;
    (!name.is_empty()).then(|| name.to_string())
}

fn has_prefix(text: &str, prefix: &str) -> bool {
    text.get(..prefix.len())
        .map_or(false, |head| head.eq_ignore_ascii_case(prefix))
}

pub fn is_function_definition(text: &str) -> bool {
    has_prefix(text, "FUNC(")
}

/// Classifies one whitespace-free statement.
pub fn classify(text: &str) -> StatementKind {
    if let Some(command) = SystemCommand::parse(text) {
        return StatementKind::System(command);
    }
    if text.eq_ignore_ascii_case("WAIT") {
        return StatementKind::Wait;
    }
    if text.eq_ignore_ascii_case("DETECT") {
        return StatementKind::Detect;
    }
    if text.eq_ignore_ascii_case("ZERO") {
        return StatementKind::Zero;
    }
    if is_function_definition(text) {
        return match parse_function(text) {
            Some((name, body)) => StatementKind::Function { name, body },
            None => StatementKind::Malformed("unbalanced function definition".to_string()),
        };
    }
    if has_prefix(text, "CALL(") {
        return match parse_call(text) {
            Some(name) => StatementKind::Call(name),
            None => StatementKind::Malformed("expected CALL(name)".to_string()),
        };
    }
    if has_prefix(text, "GROUP(") {
        return match parse_group(text) {
            Some(terms) if valid_terms(&terms) => StatementKind::Group(terms),
            _ => StatementKind::Malformed("expected GROUP(target(params), ...)".to_string()),
        };
    }
    if has_prefix(text, "SET(") {
        return match parse_set(text) {
            Some(level) => StatementKind::Set(level),
            None => StatementKind::Malformed("expected SET(0) or SET(1)".to_string()),
        };
    }
    if has_prefix(text, "SPEED;") || text.eq_ignore_ascii_case("SPEED") {
        return match parse_speed(text) {
            Some((axis, value)) => StatementKind::Speed { axis, value },
            None => StatementKind::Malformed("expected SPEED;value or SPEED;axis;value".to_string()),
        };
    }
    match parse_motion(text) {
        Some(terms) if terms.iter().all(|term| term.target.len() == 1) => {
            if valid_terms(&terms) {
                StatementKind::Move(terms)
            } else {
                StatementKind::Malformed("move arguments must be numbers or d<delay>".to_string())
            }
        }
        _ => StatementKind::Unknown,
    }
}
