//! Script text → command sequence.
//!
//! The engine only depends on the [`Parse`] trait; [`CommandParser`] is the
//! parser shipped with the crate.  The syntax is deliberately small:
//!
//! ```text
//! # comment
//! set greeting, "hello"          # positional args, comma separated
//! call m, 1, 2, verbose: true    # named args use `key: value`
//! check_x then echo "yes" else echo "no"
//! macro greet, (echo "hi $1")    # parenthesised blocks are kept unparsed
//! ```
//!
//! Statements end at `;` or a newline.  `&` runs the next command only if
//! the previous one succeeded, `|` only if it failed; `then`/`else` are
//! rewritten to those before parsing.  Preprocessing keeps every character
//! in place so reported positions match the original text.

use crate::error::ParseError;

use super::command::{Command, Separator, SourcePosition};
use super::value::Value;

/// Anything that can turn script text into a command sequence.
pub trait Parse: Send + Sync {
    fn parse(&self, source: &str, filename: &str) -> Result<Vec<Command>, ParseError>;
}

/// The default paw parser.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandParser;

impl Parse for CommandParser {
    fn parse(&self, source: &str, filename: &str) -> Result<Vec<Command>, ParseError> {
        let prepared = normalize_keywords(&remove_comments(source));
        parse_sequence(&prepared, filename).map_err(|e| e.with_context(source))
    }
}

// ── Preprocessing ─────────────────────────────────────────────────────────────

/// Blank out `#` comments.  A `#` only starts a comment at the beginning of
/// a word; comments run to the end of the line.
pub fn remove_comments(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut in_quote = false;
    let mut escaped = false;
    let mut in_comment = false;
    let mut prev: Option<char> = None;

    for ch in src.chars() {
        if in_comment {
            if ch == '\n' {
                in_comment = false;
                out.push(ch);
            } else {
                out.push(' ');
            }
        } else if in_quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_quote = false;
            }
            out.push(ch);
        } else if ch == '"' {
            in_quote = true;
            out.push(ch);
        } else if ch == '#' && prev.map_or(true, starts_word) {
            in_comment = true;
            out.push(' ');
        } else {
            out.push(ch);
        }
        prev = Some(ch);
    }
    out
}

fn starts_word(prev: char) -> bool {
    prev.is_whitespace() || matches!(prev, ';' | '&' | '|' | '(' | ',')
}

/// Rewrite the `then` and `else` keywords to `&` and `|`, padded with
/// spaces to the keyword's width.
pub fn normalize_keywords(src: &str) -> String {
    let chars: Vec<char> = src.chars().collect();
    let mut out = String::with_capacity(src.len());
    let mut in_quote = false;
    let mut escaped = false;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if in_quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_quote = false;
            }
        } else if ch == '"' {
            in_quote = true;
        } else if i == 0 || !is_word_char(chars[i - 1]) {
            if let Some(replacement) = keyword_at(&chars, i) {
                out.push_str(replacement);
                i += 4;
                continue;
            }
        }
        out.push(ch);
        i += 1;
    }
    out
}

fn keyword_at(chars: &[char], i: usize) -> Option<&'static str> {
    let end = i + 4;
    if end > chars.len() || chars.get(end).is_some_and(|&c| is_word_char(c)) {
        return None;
    }
    match chars[i..end] {
        ['t', 'h', 'e', 'n'] => Some("&   "),
        ['e', 'l', 's', 'e'] => Some("|   "),
        _ => None,
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '~' | '$' | '-')
}

// ── Statement splitting ───────────────────────────────────────────────────────

struct Statement {
    text: String,
    position: SourcePosition,
    separator: Separator,
}

/// Parse preprocessed text into commands.
pub fn parse_sequence(src: &str, filename: &str) -> Result<Vec<Command>, ParseError> {
    split_statements(src, filename)?
        .into_iter()
        .map(parse_command)
        .collect()
}

fn split_statements(src: &str, filename: &str) -> Result<Vec<Statement>, ParseError> {
    let pos = |line: usize, column: usize| SourcePosition::new(filename, line, column);

    let mut out = Vec::new();
    let mut current = String::new();
    let mut start: Option<SourcePosition> = None;
    let mut pending = Separator::Sequence;
    let mut opens: Vec<SourcePosition> = Vec::new();
    let mut quote_start: Option<SourcePosition> = None;
    let mut escaped = false;
    let (mut line, mut column) = (1usize, 0usize);

    for ch in src.chars() {
        if ch == '\n' {
            line += 1;
            column = 0;
        } else {
            column += 1;
        }

        if quote_start.is_some() {
            current.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                quote_start = None;
            }
            continue;
        }

        let separator = match ch {
            ';' | '\n' if opens.is_empty() => Some(Separator::Sequence),
            '&' if opens.is_empty() => Some(Separator::Then),
            '|' if opens.is_empty() => Some(Separator::Else),
            _ => None,
        };
        if let Some(separator) = separator {
            if let Some(position) = start.take() {
                out.push(Statement {
                    text: current.trim_end().to_owned(),
                    position,
                    separator: pending,
                });
                pending = separator;
            } else if separator != Separator::Sequence {
                pending = separator;
            }
            current.clear();
            continue;
        }

        match ch {
            '"' => quote_start = Some(pos(line, column)),
            '(' => opens.push(pos(line, column)),
            ')' => {
                if opens.pop().is_none() {
                    return Err(ParseError::new("unexpected ')'", pos(line, column)));
                }
            }
            _ => {}
        }
        if start.is_none() {
            if ch.is_whitespace() {
                continue;
            }
            start = Some(pos(line, column));
        }
        current.push(ch);
    }

    if let Some(p) = quote_start {
        return Err(ParseError::new("unterminated string", p));
    }
    if let Some(p) = opens.pop() {
        return Err(ParseError::new("unclosed '('", p));
    }
    if let Some(position) = start {
        out.push(Statement {
            text: current.trim_end().to_owned(),
            position,
            separator: pending,
        });
    }
    Ok(out)
}

// ── Commands and arguments ────────────────────────────────────────────────────

fn parse_command(stmt: Statement) -> Result<Command, ParseError> {
    let text = stmt.text.as_str();
    let name_end = text
        .find(|c: char| c.is_whitespace() || c == ',')
        .unwrap_or(text.len());
    let name = &text[..name_end];
    if name.is_empty() || name.contains(['"', '(', ')']) {
        return Err(ParseError::new("expected a command name", stmt.position));
    }

    let mut cmd = Command::new(name, stmt.position.clone());
    cmd.separator = stmt.separator;

    let rest = text[name_end..].trim();
    if rest.is_empty() {
        return Ok(cmd);
    }
    for raw in split_top_level(rest, ',') {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ParseError::new("empty argument", stmt.position));
        }
        match split_named(raw) {
            Some((key, value)) => {
                let value = parse_value(value, &stmt.position)?;
                cmd.named_args.insert(key.to_owned(), value);
            }
            None => cmd.args.push(parse_value(raw, &stmt.position)?),
        }
        cmd.raw_args.push(raw.to_owned());
    }
    Ok(cmd)
}

/// Split on `delim` outside quotes and parentheses.
fn split_top_level(s: &str, delim: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut escaped = false;
    let mut last = 0;

    for (i, ch) in s.char_indices() {
        if in_quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_quote = false;
            }
            continue;
        }
        match ch {
            '"' => in_quote = true,
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            c if c == delim && depth == 0 => {
                parts.push(&s[last..i]);
                last = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[last..]);
    parts
}

/// `key: value` where key is an identifier.
fn split_named(raw: &str) -> Option<(&str, &str)> {
    let colon = raw.find(':')?;
    let key = &raw[..colon];
    let value = raw[colon + 1..].trim();
    let mut chars = key.chars();
    let ident = chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '-');
    (ident && !value.is_empty()).then_some((key, value))
}

fn parse_value(raw: &str, position: &SourcePosition) -> Result<Value, ParseError> {
    if let Some(body) = raw.strip_prefix('"') {
        return unquote(body, position).map(Value::Str);
    }
    if raw.starts_with('(') {
        return match matching_paren(raw) {
            Some(close) if close == raw.len() - 1 => Ok(Value::Block(raw[1..close].to_owned())),
            _ => Err(ParseError::new(
                "unexpected text after ')'",
                position.clone(),
            )),
        };
    }
    match raw {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        _ => {}
    }
    if looks_numeric(raw) {
        if let Ok(n) = raw.parse::<i64>() {
            return Ok(Value::Int(n));
        }
        if let Ok(x) = raw.parse::<f64>() {
            return Ok(Value::Float(x));
        }
    }
    Ok(Value::Symbol(raw.to_owned()))
}

fn looks_numeric(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some('-' | '+' | '.') => chars.next().is_some_and(|c| c.is_ascii_digit()),
        _ => false,
    }
}

/// Decode the body of a string literal (after the opening quote).
fn unquote(body: &str, position: &SourcePosition) -> Result<String, ParseError> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('0') => out.push('\0'),
                Some(c @ ('\\' | '"')) => out.push(c),
                Some(c) => {
                    out.push('\\');
                    out.push(c);
                }
                None => out.push('\\'),
            },
            '"' => {
                return if chars.as_str().trim().is_empty() {
                    Ok(out)
                } else {
                    Err(ParseError::new(
                        "unexpected text after string",
                        position.clone(),
                    ))
                };
            }
            c => out.push(c),
        }
    }
    Err(ParseError::new("unterminated string", position.clone()))
}

/// Byte index of the `)` matching the `(` at the start of `s`.
fn matching_paren(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut escaped = false;
    for (i, ch) in s.char_indices() {
        if in_quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_quote = false;
            }
            continue;
        }
        match ch {
            '"' => in_quote = true,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Vec<Command> {
        CommandParser.parse(src, "test.paw").unwrap()
    }

    #[test]
    fn simple_command() {
        let cmds = parse("echo \"hello\", 42, 2.5, true, word");
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].name, "echo");
        assert_eq!(
            cmds[0].args,
            vec![
                Value::Str("hello".into()),
                Value::Int(42),
                Value::Float(2.5),
                Value::Bool(true),
                Value::Symbol("word".into()),
            ]
        );
        assert_eq!(cmds[0].raw_args[0], "\"hello\"");
    }

    #[test]
    fn named_args() {
        let cmds = parse("call m, 1, verbose: true, label: \"a, b\"");
        assert_eq!(cmds[0].args, vec![Value::Symbol("m".into()), Value::Int(1)]);
        assert_eq!(cmds[0].named_args["verbose"], Value::Bool(true));
        assert_eq!(cmds[0].named_args["label"], Value::Str("a, b".into()));
    }

    #[test]
    fn separators_and_keywords() {
        let cmds = parse("a; b & c | d\ne then f else g");
        let seps: Vec<_> = cmds.iter().map(|c| (c.name.as_str(), c.separator)).collect();
        assert_eq!(
            seps,
            vec![
                ("a", Separator::Sequence),
                ("b", Separator::Sequence),
                ("c", Separator::Then),
                ("d", Separator::Else),
                ("e", Separator::Sequence),
                ("f", Separator::Then),
                ("g", Separator::Else),
            ]
        );
    }

    #[test]
    fn trailing_then_carries_over_newline() {
        let cmds = parse("check &\n\n  act");
        assert_eq!(cmds[1].separator, Separator::Then);
    }

    #[test]
    fn keywords_inside_strings_untouched() {
        let cmds = parse("echo \"then else\"");
        assert_eq!(cmds[0].args[0], Value::Str("then else".into()));
        assert_eq!(normalize_keywords("thenx elsewhere"), "thenx elsewhere");
    }

    #[test]
    fn comments_removed() {
        let cmds = parse("# header\necho 1 # trailing\necho \"# kept\"");
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].args, vec![Value::Int(1)]);
        assert_eq!(cmds[1].args[0], Value::Str("# kept".into()));
    }

    #[test]
    fn blocks_span_lines() {
        let cmds = parse("macro greet, (\n  echo \"hi\"; echo $1\n)\ngreet");
        assert_eq!(cmds.len(), 2);
        assert_eq!(
            cmds[0].args[1],
            Value::Block("\n  echo \"hi\"; echo $1\n".into())
        );
        assert_eq!(cmds[1].position.line, 4);
    }

    #[test]
    fn positions() {
        let cmds = parse("a\n   b 1; c");
        assert_eq!(cmds[1].position, SourcePosition::new("test.paw", 2, 4));
        assert_eq!(cmds[2].position, SourcePosition::new("test.paw", 2, 9));
    }

    #[test]
    fn escapes() {
        let cmds = parse(r#"echo "a\tb\n\"q\"""#);
        assert_eq!(cmds[0].args[0], Value::Str("a\tb\n\"q\"".into()));
    }

    #[test]
    fn errors_carry_position() {
        let err = CommandParser.parse("ok\necho (oops", "e.paw").unwrap_err();
        assert_eq!(err.message, "unclosed '('");
        assert_eq!(err.position, SourcePosition::new("e.paw", 2, 6));
        assert_eq!(err.context.last().map(String::as_str), Some("     ^"));

        let err = CommandParser.parse("echo \"open", "e.paw").unwrap_err();
        assert_eq!(err.message, "unterminated string");

        let err = CommandParser.parse("echo )", "e.paw").unwrap_err();
        assert_eq!(err.message, "unexpected ')'");

        let err = CommandParser.parse("echo 1,, 2", "e.paw").unwrap_err();
        assert_eq!(err.message, "empty argument");
    }

    #[test]
    fn empty_source() {
        assert!(parse("").is_empty());
        assert!(parse("  \n ; \n# only a comment").is_empty());
    }
}
