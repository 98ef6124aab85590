//! Splitting scripts into statements.
//!
//! Every bracket lookup goes through [`find_matching`], so `GROUP(...)`,
//! `FUNC(...){...}` and move arguments all nest the same way.

/// Index of the bracket closing the one at `open_at`, counting nested pairs of
/// the same kind. `None` when `open_at` is not `(`/`{` or the pair never closes.
pub fn find_matching(text: &str, open_at: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let open = *bytes.get(open_at)?;
    let close = match open {
        b'(' => b')',
        b'{' => b'}',
        _ => return None,
    };
    let mut depth = 0usize;
    for (offset, &byte) in bytes[open_at..].iter().enumerate() {
        if byte == open {
            depth += 1;
        } else if byte == close {
            depth -= 1;
            if depth == 0 {
                return Some(open_at + offset);
            }
        }
    }
    None
}

/// Splits on `separator` wherever it is outside every bracket pair. An
/// unclosed bracket swallows the rest of the text into the last piece.
pub fn split_top_level(text: &str, separator: u8) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut position = 0;
    while position < bytes.len() {
        match bytes[position] {
            b'(' | b'{' => match find_matching(text, position) {
                Some(close) => position = close + 1,
                None => position = bytes.len(),
            },
            byte if byte == separator => {
                pieces.push(&text[start..position]);
                position += 1;
                start = position;
            }
            _ => position += 1,
        }
    }
    pieces.push(&text[start..]);
    pieces
}

fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Raw top-level pieces of a script: `;` separates statements and a closing
/// `}` at top level also ends one, so `FUNC(a){...}CALL(a)` is two statements.
fn raw_statements(script: &str) -> Vec<String> {
    let bytes = script.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut position = 0;
    while position < bytes.len() {
        match bytes[position] {
            b'(' => match find_matching(script, position) {
                Some(close) => position = close + 1,
                None => position = bytes.len(),
            },
            b'{' => match find_matching(script, position) {
                Some(close) => {
                    statements.push(&script[start..=close]);
                    position = close + 1;
                    start = position;
                }
                None => position = bytes.len(),
            },
            b';' => {
                statements.push(&script[start..position]);
                position += 1;
                start = position;
            }
            _ => position += 1,
        }
    }
    statements.push(&script[start..]);
    statements
        .into_iter()
        .map(strip_whitespace)
        .filter(|statement| !statement.is_empty())
        .collect()
}

fn is_axis_word(token: &str) -> bool {
    let mut chars = token.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c.is_ascii_alphabetic())
}

/// Whitespace-free statements of `script`, with `SPEED;v` and `SPEED;axis;v`
/// rejoined into single statements.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut tokens = raw_statements(script).into_iter().peekable();
    while let Some(token) = tokens.next() {
        if !token.eq_ignore_ascii_case("SPEED") {
            statements.push(token);
            continue;
        }
        let mut joined = token;
        if let Some(next) = tokens.next() {
            let is_axis = is_axis_word(&next);
            joined.push(';');
            joined.push_str(&next);
            if is_axis {
                if let Some(value) = tokens.next() {
                    joined.push(';');
                    joined.push_str(&value);
                }
            }
        }
        statements.push(joined);
    }
    statements
}
