//! `nom` building blocks of the interpolation token syntax.
use nom::IResult;
use nom::bytes::complete::take_while;
use nom::character::complete::{digit1, satisfy};
use nom::combinator::recognize;
use nom::sequence::pair;

pub type NomResult<'a, Ret> = IResult<&'a str, Ret>;

/// Parses an identifier: an ASCII letter or underscore followed by any number of ASCII
/// letters, digits or underscores.
pub fn p_identifier(input: &str) -> NomResult<'_, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

/// Parses a non-empty run of decimal digits.
pub fn p_index(input: &str) -> NomResult<'_, &str> {
    digit1(input)
}
