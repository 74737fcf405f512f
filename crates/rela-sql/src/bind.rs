//! Positional parameter binding
//!
//! Callers always write `?` placeholders (`??` for a literal question mark).
//! Before a statement reaches an engine the placeholders are rewritten into
//! the engine's native convention, or replaced by escaped literals when the
//! engine has no out-of-band parameters.

use rela_core::{EngineError, EngineResult, Value};

use crate::dialect::{Dialect, PlaceholderStyle};

#[derive(Debug, PartialEq)]
enum Piece<'a> {
    Sql(&'a str),
    /// `??`, emitted as a single `?`
    LiteralQuestion,
    Placeholder,
}

/// Splits a statement on placeholders, skipping string literals, quoted
/// identifiers, comments and dollar-quoted bodies.
fn split(sql: &str, dialect: Dialect) -> Vec<Piece<'_>> {
    let bytes = sql.as_bytes();
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                let backslash = dialect.backslash_escapes()
                    || (dialect == Dialect::Postgres
                        && i > 0
                        && matches!(bytes[i - 1], b'E' | b'e')
                        && (i < 2 || !is_ident_byte(bytes[i - 2])));
                i = skip_quoted(bytes, i, b'\'', backslash);
            }
            b'"' => i = skip_quoted(bytes, i, b'"', dialect == Dialect::MySql),
            b'`' => i = skip_quoted(bytes, i, b'`', false),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = match sql[i..].find('\n') {
                    Some(off) => i + off + 1,
                    None => bytes.len(),
                };
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            b'$' if dialect.dollar_quotes() && (i == 0 || !is_ident_byte(bytes[i - 1])) => {
                i = skip_dollar_quoted(sql, i);
            }
            b'?' => {
                if start < i {
                    pieces.push(Piece::Sql(&sql[start..i]));
                }
                if bytes.get(i + 1) == Some(&b'?') {
                    pieces.push(Piece::LiteralQuestion);
                    i += 2;
                } else {
                    pieces.push(Piece::Placeholder);
                    i += 1;
                }
                start = i;
            }
            _ => i += 1,
        }
    }

    if start < bytes.len() {
        pieces.push(Piece::Sql(&sql[start..]));
    }
    pieces
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

/// Returns the index just past the closing quote (or the end of input).
fn skip_quoted(bytes: &[u8], open: usize, quote: u8, backslash: bool) -> usize {
    let mut i = open + 1;
    while i < bytes.len() {
        let b = bytes[i];
        if backslash && b == b'\\' {
            i += 2;
            continue;
        }
        if b == quote {
            // doubled quote stays inside the literal
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn skip_block_comment(bytes: &[u8], open: usize) -> usize {
    let mut depth = 0usize;
    let mut i = open;
    while i < bytes.len() {
        if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
            depth -= 1;
            i += 2;
            if depth == 0 {
                return i;
            }
        } else {
            i += 1;
        }
    }
    bytes.len()
}

fn skip_dollar_quoted(sql: &str, open: usize) -> usize {
    let rest = &sql[open + 1..];
    let tag_len = rest
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
        .count();
    if rest.as_bytes().get(tag_len) != Some(&b'$') {
        // `$1` or a lone dollar sign
        return open + 1;
    }
    // `$5` style positional references are not tags
    if tag_len > 0 && rest.as_bytes()[0].is_ascii_digit() {
        return open + 1;
    }
    let delimiter = &sql[open..open + tag_len + 2];
    let body_start = open + tag_len + 2;
    match sql[body_start..].find(delimiter) {
        Some(off) => body_start + off + delimiter.len(),
        None => sql.len(),
    }
}

/// Number of `?` placeholders in a statement.
pub fn count_placeholders(sql: &str, dialect: Dialect) -> usize {
    split(sql, dialect)
        .iter()
        .filter(|p| **p == Piece::Placeholder)
        .count()
}

fn check_count(expected: usize, supplied: usize) -> EngineResult<()> {
    if expected != supplied {
        return Err(EngineError::execution_error(format!(
            "statement has {} placeholder(s) but {} parameter(s) were supplied",
            expected, supplied
        )));
    }
    Ok(())
}

/// Rewrites `?` placeholders into `style`.
///
/// `Inline` styles are not handled here; use [`inline_params`].
pub fn rewrite_placeholders(
    sql: &str,
    dialect: Dialect,
    style: PlaceholderStyle,
    param_count: usize,
) -> EngineResult<String> {
    let pieces = split(sql, dialect);
    let found = pieces.iter().filter(|p| **p == Piece::Placeholder).count();
    check_count(found, param_count)?;

    let mut out = String::with_capacity(sql.len() + param_count * 2);
    let mut n = 0;
    for piece in pieces {
        match piece {
            Piece::Sql(s) => out.push_str(s),
            Piece::LiteralQuestion => out.push('?'),
            Piece::Placeholder => {
                n += 1;
                match style {
                    PlaceholderStyle::Dollar => out.push_str(&format!("${}", n)),
                    PlaceholderStyle::Colon => out.push_str(&format!(":p{}", n)),
                    PlaceholderStyle::QuestionMark => out.push('?'),
                    PlaceholderStyle::Inline => {
                        return Err(EngineError::unsupported(
                            "inline binding requires parameter values",
                        ))
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Replaces `?` placeholders with literals rendered by `dialect`.
///
/// This is the single escaping routine used by every engine without native
/// parameter binding.
pub fn inline_params(sql: &str, dialect: Dialect, params: &[Value]) -> EngineResult<String> {
    let pieces = split(sql, dialect);
    let found = pieces.iter().filter(|p| **p == Piece::Placeholder).count();
    check_count(found, params.len())?;

    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut values = params.iter();
    for piece in pieces {
        match piece {
            Piece::Sql(s) => out.push_str(s),
            Piece::LiteralQuestion => out.push('?'),
            Piece::Placeholder => {
                let value = values
                    .next()
                    .ok_or_else(|| EngineError::execution_error("missing parameter value"))?;
                out.push_str(&dialect.format_literal(value)?);
            }
        }
    }
    Ok(out)
}

/// Prepares a statement for `dialect`.
///
/// Without parameters the statement passes through untouched, so engine
/// operators spelled with `?` (PostgreSQL `jsonb ? key`) need no escaping in
/// unparameterized SQL.
pub fn prepare(sql: &str, dialect: Dialect, params: &[Value]) -> EngineResult<String> {
    if params.is_empty() {
        return Ok(sql.to_string());
    }
    match dialect.placeholder_style() {
        PlaceholderStyle::Inline => inline_params(sql, dialect, params),
        style => rewrite_placeholders(sql, dialect, style, params.len()),
    }
}
