use anyhow::anyhow;
use chumsky::Parser;
use chumsky::error::{Simple, SimpleReason};
use chumsky::primitive::end;
use colored::Colorize;
use itertools::Itertools;

/// Parser over the characters of a single-line expression.
pub trait CharParser<T>: Parser<char, T, Error = Simple<char>> + Sized {
    fn parse_text(&self, input: &str) -> anyhow::Result<T> {
        self.parse(input)
            .map_err(|errors| anyhow!("{}", describe_error(input, &errors)))
    }
}
impl<T, P> CharParser<T> for P where P: Parser<char, T, Error = Simple<char>> {}

fn highlight(text: String) -> String {
    if cfg!(test) {
        text
    } else {
        text.red().bold().to_string()
    }
}

/// Describes the first error and points at its position in `input`:
///
/// ```text
/// Unexpected `)`, expected role
///   inp and )
///           ^
/// ```
pub fn describe_error(input: &str, errors: &[Simple<char>]) -> String {
    let Some(error) = errors.first() else {
        return "Unknown parsing error".to_string();
    };

    let mut message = match (error.reason(), error.found()) {
        (SimpleReason::Custom(reason), _) => reason.clone(),
        (_, Some(found)) => format!("Unexpected `{found}`"),
        (_, None) => "Unexpected end of input".to_string(),
    };
    let expected = error
        .expected()
        .map(|expected| match expected {
            Some(expected) => format!("`{expected}`"),
            None => "end of input".to_string(),
        })
        .sorted()
        .join(" or ");
    match (error.label(), expected.is_empty()) {
        (Some(label), true) => message.push_str(&format!(", expected {label}")),
        (Some(label), false) => message.push_str(&format!(" in {label}, expected {expected}")),
        (None, false) => message.push_str(&format!(", expected {expected}")),
        (None, true) => {}
    }

    if input.is_empty() {
        return format!("{message} (the input was empty)");
    }
    let span = error.span();
    let width = span.end.saturating_sub(span.start).max(1);
    format!(
        "{message}\n  {input}\n  {}{}",
        " ".repeat(span.start),
        highlight("^".repeat(width))
    )
}

/// Fails when the input continues after what `parser` accepted.
pub fn all_consuming<T>(parser: impl CharParser<T>) -> impl CharParser<T> {
    parser.then_ignore(end())
}
