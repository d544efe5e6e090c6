//! SQL literal rendering for the shell backend.
//!
//! The `sqlite3` shell has no parameter binding, so every value is spliced
//! into the statement text as a literal. Everything that reaches the shell
//! goes through [`render_literal`] and [`bind`]; nothing else builds SQL from
//! caller data.

use crate::db::backend::{Params, SqlValue};
use crate::error::{StoreError, StoreResult};

/// Render one value as a SQL literal.
///
/// Text is single-quoted with embedded quotes doubled. Text containing NUL
/// bytes cannot be spelled as a quoted literal, so it is emitted as a cast
/// hex blob instead. Non-finite reals become NULL.
pub fn render_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Integer(i) => i.to_string(),
        SqlValue::Real(f) if f.is_finite() => format!("{f:?}"),
        SqlValue::Real(_) => "NULL".to_string(),
        SqlValue::Text(s) if s.contains('\0') => {
            format!("CAST(X'{}' AS TEXT)", hex::encode_upper(s.as_bytes()))
        }
        SqlValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
        SqlValue::Blob(b) => format!("X'{}'", hex::encode_upper(b)),
    }
}

/// Substitute `params` into the placeholders of `sql`.
///
/// Recognises `?`, `?NNN`, `:name`, `@name` and `$name` outside of quoted
/// strings, quoted identifiers and comments.
pub fn bind(sql: &str, params: &Params) -> StoreResult<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len() + 32);
    let mut next_positional = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '`' => {
                let end = skip_quoted(&chars, i, c);
                out.extend(&chars[i..end]);
                i = end;
            }
            '[' => {
                let end = chars[i..]
                    .iter()
                    .position(|&ch| ch == ']')
                    .map_or(chars.len(), |p| i + p + 1);
                out.extend(&chars[i..end]);
                i = end;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                let end = chars[i..]
                    .iter()
                    .position(|&ch| ch == '\n')
                    .map_or(chars.len(), |p| i + p);
                out.extend(&chars[i..end]);
                i = end;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let end = find_comment_end(&chars, i + 2);
                out.extend(&chars[i..end]);
                i = end;
            }
            '?' => {
                let digits_end = scan_while(&chars, i + 1, |ch| ch.is_ascii_digit());
                let index = if digits_end > i + 1 {
                    let n: String = chars[i + 1..digits_end].iter().collect();
                    let n: usize = n
                        .parse()
                        .map_err(|_| StoreError::backend(format!("bad placeholder ?{n}")))?;
                    next_positional = n;
                    n.checked_sub(1)
                        .ok_or_else(|| StoreError::backend("placeholder ?0 is invalid"))?
                } else {
                    next_positional += 1;
                    next_positional - 1
                };
                out.push_str(&render_literal(positional(params, index)?));
                i = digits_end;
            }
            ':' | '@' | '$' if chars.get(i + 1).is_some_and(|ch| is_ident_start(*ch)) => {
                let name_end = scan_while(&chars, i + 1, is_ident_char);
                let name: String = chars[i + 1..name_end].iter().collect();
                out.push_str(&render_literal(named(params, &name)?));
                i = name_end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    Ok(out)
}

fn positional(params: &Params, index: usize) -> StoreResult<&SqlValue> {
    match params {
        Params::Positional(values) => values
            .get(index)
            .ok_or_else(|| StoreError::backend(format!("missing parameter #{}", index + 1))),
        _ => Err(StoreError::backend("statement expects positional parameters")),
    }
}

fn named<'a>(params: &'a Params, name: &str) -> StoreResult<&'a SqlValue> {
    match params {
        Params::Named(values) => values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| StoreError::backend(format!("missing parameter :{name}"))),
        _ => Err(StoreError::backend("statement expects named parameters")),
    }
}

/// Index just past the closing quote, honouring doubled-quote escapes.
fn skip_quoted(chars: &[char], start: usize, quote: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

fn find_comment_end(chars: &[char], from: usize) -> usize {
    let mut i = from;
    while i + 1 < chars.len() {
        if chars[i] == '*' && chars[i + 1] == '/' {
            return i + 2;
        }
        i += 1;
    }
    chars.len()
}

fn scan_while(chars: &[char], from: usize, pred: impl Fn(char) -> bool) -> usize {
    let mut i = from;
    while i < chars.len() && pred(chars[i]) {
        i += 1;
    }
    i
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
