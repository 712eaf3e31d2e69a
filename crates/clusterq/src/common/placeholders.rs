//! Single-pass interpolation of delimiter-bounded tokens.
//!
//! A token starts with the delimiter and is followed by either a decimal index
//! (`%0`, resolved against positional values) or an identifier (`%name`, resolved
//! against named values). Both forms may be wrapped in braces (`%{name}`) to separate
//! them from adjacent text. A doubled delimiter (`%%`) stands for a literal delimiter.
use nom::branch::alt;
use nom::character::complete::char;
use nom::combinator::map;
use nom::sequence::delimited;
use thiserror::Error;

use crate::Map;
use crate::common::parser::{NomResult, p_identifier, p_index};

/// Delimiter used by configuration templates (header lines, paths, messages).
pub const TEMPLATE_DELIMITER: &str = "%";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterpolationError {
    #[error("undefined interpolation variable `{0}`")]
    Undefined(String),
    #[error("invalid interpolation token `{0}`")]
    Invalid(String),
}

#[derive(Debug, Eq, PartialEq)]
pub enum StringPart<'a> {
    Verbatim(&'a str),
    /// Doubled delimiter, rendered as a single delimiter.
    Escaped(&'a str),
    Index(&'a str),
    Name(&'a str),
    /// Delimiter that is not followed by a valid token.
    Malformed(&'a str),
}

/// Result of a safe interpolation.
#[derive(Debug, Eq, PartialEq)]
pub struct SafeInterpolation {
    pub text: String,
    /// Tokens that were left untouched, in order of appearance.
    pub unresolved: Vec<String>,
}

fn p_key(input: &str) -> NomResult<'_, StringPart<'_>> {
    alt((
        map(p_index, StringPart::Index),
        map(p_identifier, StringPart::Name),
    ))(input)
}

fn p_token(input: &str) -> NomResult<'_, StringPart<'_>> {
    alt((delimited(char('{'), p_key, char('}')), p_key))(input)
}

/// Splits `data` into verbatim text and tokens introduced by `delimiter`.
///
/// # Example
/// ```rust
/// use clusterq::common::placeholders::{parse_interpolated_string, StringPart};
///
/// assert_eq!(parse_interpolated_string("a%0b%{c}d", "%"), vec![
///     StringPart::Verbatim("a"),
///     StringPart::Index("0"),
///     StringPart::Verbatim("b"),
///     StringPart::Name("c"),
///     StringPart::Verbatim("d"),
/// ]);
/// ```
pub fn parse_interpolated_string<'a>(data: &'a str, delimiter: &str) -> Vec<StringPart<'a>> {
    tokenize(data, delimiter)
        .into_iter()
        .map(|(part, _)| part)
        .collect()
}

/// Returns each part together with the exact source text it was parsed from.
fn tokenize<'a>(data: &'a str, delimiter: &str) -> Vec<(StringPart<'a>, &'a str)> {
    let mut parts = vec![];
    if delimiter.is_empty() {
        if !data.is_empty() {
            parts.push((StringPart::Verbatim(data), data));
        }
        return parts;
    }

    let mut rest = data;
    while let Some(position) = rest.find(delimiter) {
        if position > 0 {
            parts.push((StringPart::Verbatim(&rest[..position]), &rest[..position]));
        }
        let token_start = position + delimiter.len();
        let after = &rest[token_start..];
        if after.starts_with(delimiter) {
            let raw = &rest[position..token_start + delimiter.len()];
            parts.push((StringPart::Escaped(&rest[position..token_start]), raw));
            rest = &after[delimiter.len()..];
            continue;
        }
        match p_token(after) {
            Ok((tail, part)) => {
                let end = rest.len() - tail.len();
                parts.push((part, &rest[position..end]));
                rest = tail;
            }
            Err(_) => {
                let end = token_start + after.chars().next().map(char::len_utf8).unwrap_or(0);
                let token = &rest[position..end];
                parts.push((StringPart::Malformed(token), token));
                rest = &rest[end..];
            }
        }
    }
    if !rest.is_empty() {
        parts.push((StringPart::Verbatim(rest), rest));
    }
    parts
}

fn lookup<'a>(
    part: &StringPart,
    positional: &'a [String],
    named: &'a Map<String, String>,
) -> Option<&'a str> {
    match part {
        StringPart::Index(index) => index
            .parse::<usize>()
            .ok()
            .and_then(|index| positional.get(index))
            .map(|value| value.as_str()),
        StringPart::Name(name) => named.get(*name).map(|value| value.as_str()),
        _ => None,
    }
}

/// Replaces every token of `text` by its value.
///
/// Fails with [`InterpolationError::Undefined`] when an index or a name has no value and
/// with [`InterpolationError::Invalid`] when the delimiter is not followed by a valid token.
pub fn interpolate(
    text: &str,
    delimiter: &str,
    positional: &[String],
    named: &Map<String, String>,
) -> Result<String, InterpolationError> {
    let mut buffer = String::with_capacity(text.len());
    for part in parse_interpolated_string(text, delimiter) {
        match part {
            StringPart::Verbatim(data) => buffer.push_str(data),
            StringPart::Escaped(delimiter) => buffer.push_str(delimiter),
            StringPart::Malformed(token) => {
                return Err(InterpolationError::Invalid(token.to_string()));
            }
            StringPart::Index(key) | StringPart::Name(key) => {
                match lookup(&part, positional, named) {
                    Some(value) => buffer.push_str(value),
                    None => return Err(InterpolationError::Undefined(key.to_string())),
                }
            }
        }
    }
    Ok(buffer)
}

/// Like [`interpolate`], but tokens that cannot be resolved (including malformed ones) are
/// copied to the output untouched and reported in [`SafeInterpolation::unresolved`].
pub fn interpolate_safe(
    text: &str,
    delimiter: &str,
    positional: &[String],
    named: &Map<String, String>,
) -> SafeInterpolation {
    let mut buffer = String::with_capacity(text.len());
    let mut unresolved = vec![];
    for (part, raw) in tokenize(text, delimiter) {
        match part {
            StringPart::Verbatim(data) => buffer.push_str(data),
            StringPart::Escaped(delimiter) => buffer.push_str(delimiter),
            StringPart::Malformed(token) => {
                buffer.push_str(token);
                unresolved.push(token.to_string());
            }
            StringPart::Index(key) | StringPart::Name(key) => {
                match lookup(&part, positional, named) {
                    Some(value) => buffer.push_str(value),
                    None => {
                        buffer.push_str(raw);
                        unresolved.push(key.to_string());
                    }
                }
            }
        }
    }
    SafeInterpolation {
        text: buffer,
        unresolved,
    }
}

/// Interpolates a configuration template that only uses named values.
pub fn fill_template(
    template: &str,
    values: &Map<String, String>,
) -> Result<String, InterpolationError> {
    interpolate(template, TEMPLATE_DELIMITER, &[], values)
}
