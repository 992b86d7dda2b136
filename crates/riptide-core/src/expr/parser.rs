//! nom parser for condition expressions.
//!
//! Precedence, loosest first: `||`, `&&`, unary `!`, primary. Primaries are
//! parenthesized expressions, function calls, literals, and identifiers.

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0, none_of},
    combinator::{all_consuming, map, map_res, opt, recognize},
    error::ParseError,
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, tuple},
};

use super::{Expr, Value};
use crate::error::EngineError;

fn ws<'a, F, O, E: ParseError<&'a str>>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where
    F: FnMut(&'a str) -> IResult<&'a str, O, E>,
{
    delimited(multispace0, inner, multispace0)
}

/// Identifiers: letters/underscore, then letters, digits, `_`, `-`, and `.`
/// for dotted paths like `tasks.build.exit_code`.
fn parse_identifier(input: &str) -> IResult<&str, String> {
    map(
        recognize(pair(
            alt((alpha1, tag("_"))),
            many0(alt((alphanumeric1, tag("_"), tag("-"), tag(".")))),
        )),
        String::from,
    )(input)
}

fn parse_number(input: &str) -> IResult<&str, Value> {
    map_res(
        recognize(tuple((
            opt(char('-')),
            digit1,
            opt(tuple((char('.'), digit1))),
        ))),
        |s: &str| s.parse::<f64>().map(Value::Number),
    )(input)
}

fn parse_string_literal(input: &str) -> IResult<&str, Value> {
    alt((
        map(
            delimited(
                char('"'),
                many0(alt((
                    map(tag("\\\""), |_| '"'),
                    map(tag("\\\\"), |_| '\\'),
                    map(tag("\\n"), |_| '\n'),
                    map(tag("\\t"), |_| '\t'),
                    none_of("\"\\"),
                ))),
                char('"'),
            ),
            |chars| Value::Str(chars.into_iter().collect()),
        ),
        map(
            delimited(char('\''), take_while(|c| c != '\''), char('\'')),
            |s: &str| Value::Str(s.to_string()),
        ),
    ))(input)
}

/// A name followed by an argument list is a call; a bare name is a boolean
/// literal (`true`/`false`) or an identifier.
fn parse_call_or_ident(input: &str) -> IResult<&str, Expr> {
    let (rest, name) = parse_identifier(input)?;
    let (after_args, args) = opt(delimited(
        ws(char('(')),
        separated_list0(ws(char(',')), parse_or),
        ws(char(')')),
    ))(rest)?;

    match args {
        Some(args) => Ok((after_args, Expr::Call { name, args })),
        None => {
            let expr = match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                _ => Expr::Ident(name),
            };
            Ok((rest, expr))
        }
    }
}

/// Primaries strip their own surrounding whitespace, so every composite
/// parser sees clean token boundaries.
fn parse_primary(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        delimited(char('('), parse_or, char(')')),
        map(parse_string_literal, Expr::Literal),
        map(parse_number, Expr::Literal),
        parse_call_or_ident,
    )))(input)
}

fn parse_unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(char('!')), parse_unary), |e| {
            Expr::Not(Box::new(e))
        }),
        parse_primary,
    ))(input)
}

fn parse_and(input: &str) -> IResult<&str, Expr> {
    let (rest, first) = parse_unary(input)?;
    let (rest, others) = many0(preceded(ws(tag("&&")), parse_unary))(rest)?;
    Ok((
        rest,
        others
            .into_iter()
            .fold(first, |acc, e| Expr::And(Box::new(acc), Box::new(e))),
    ))
}

fn parse_or(input: &str) -> IResult<&str, Expr> {
    let (rest, first) = parse_and(input)?;
    let (rest, others) = many0(preceded(ws(tag("||")), parse_and))(rest)?;
    Ok((
        rest,
        others
            .into_iter()
            .fold(first, |acc, e| Expr::Or(Box::new(acc), Box::new(e))),
    ))
}

/// Parse a complete expression, rejecting trailing input.
pub fn parse(input: &str) -> Result<Expr, EngineError> {
    all_consuming(ws(parse_or))(input)
        .map(|(_, expr)| expr)
        .map_err(|e| EngineError::ExpressionEvaluation {
            expr: input.to_string(),
            reason: format!("parse error: {e}"),
        })
}
