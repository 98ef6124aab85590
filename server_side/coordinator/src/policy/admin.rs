//! `TIMEOUT;...` console commands.
use nom::{
    branch::alt,
    bytes::complete::tag_no_case,
    character::complete::{char, digit1},
    combinator::{all_consuming, map, map_res, value},
    sequence::{pair, preceded},
    IResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    MaxWait,
    Strategy,
    Warning,
    Retry,
    Save,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    Set(ConfigField, u64),
    ResetStats,
    Status,
}

fn field(input: &str) -> IResult<&str, ConfigField> {
    alt((
        value(ConfigField::MaxWait, tag_no_case("MAX")),
        value(ConfigField::Strategy, tag_no_case("STRATEGY")),
        value(ConfigField::Warning, tag_no_case("WARN")),
        value(ConfigField::Retry, tag_no_case("RETRY")),
        value(ConfigField::Save, tag_no_case("SAVE")),
    ))(input)
}

fn admin_command(input: &str) -> IResult<&str, AdminCommand> {
    preceded(
        tag_no_case("TIMEOUT;"),
        alt((
            value(AdminCommand::ResetStats, tag_no_case("RESET_STATS")),
            value(AdminCommand::ResetStats, tag_no_case("RESET")),
            value(AdminCommand::Status, tag_no_case("STATUS")),
            map(
                pair(field, preceded(char(';'), map_res(digit1, str::parse::<u64>))),
                |(field, amount)| AdminCommand::Set(field, amount),
            ),
        )),
    )(input)
}

/// Whether `text` is addressed to the timeout policy at all.
pub fn is_admin(text: &str) -> bool {
    text.get(..7).map_or(false, |head| head.eq_ignore_ascii_case("TIMEOUT"))
}

pub fn parse_admin(text: &str) -> Option<AdminCommand> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let parsed = all_consuming(admin_command)(compact.as_str())
        .ok()
        .map(|(_, command)| command);
    parsed
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_fields() {
        assert_eq!(parse_admin("TIMEOUT;MAX;5000"), Some(AdminCommand::Set(ConfigField::MaxWait, 5000)));
        assert_eq!(parse_admin("timeout;strategy;3"), Some(AdminCommand::Set(ConfigField::Strategy, 3)));
        assert_eq!(parse_admin("TIMEOUT; WARN; 4"), Some(AdminCommand::Set(ConfigField::Warning, 4)));
        assert_eq!(parse_admin("TIMEOUT;RETRY;2"), Some(AdminCommand::Set(ConfigField::Retry, 2)));
        assert_eq!(parse_admin("TIMEOUT;SAVE;1"), Some(AdminCommand::Set(ConfigField::Save, 1)));
    }
    #[test]
    fn test_parse_actions() {
        assert_eq!(parse_admin("TIMEOUT;RESET"), Some(AdminCommand::ResetStats));
        assert_eq!(parse_admin("TIMEOUT;RESET_STATS"), Some(AdminCommand::ResetStats));
        assert_eq!(parse_admin("TIMEOUT;STATUS"), Some(AdminCommand::Status));
    }
    #[test]
    fn test_rejects_garbage() {
        assert_eq!(parse_admin("TIMEOUT;MAX"), None);
        assert_eq!(parse_admin("TIMEOUT;MAX;-1"), None);
        assert_eq!(parse_admin("TIMEOUT;LATER;1"), None);
        assert!(is_admin("timeout;whatever"));
        assert!(!is_admin("WAIT"));
    }
}
