//! Filter and sort expressions using nom.
//!
//! ```text
//! status = 'open' and amount >= 10 or region in ('eu', 'us')
//! closed_at is not null and score >=? @threshold
//! name like 'A%'
//! ```
//!
//! `and` binds tighter than `or`. A `?` after an operator also matches rows
//! where a compared column is null. `@name` compares against another column.

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, tag_no_case, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{map, not, opt, recognize, value},
    error::{Error, ErrorKind},
    multi::{fold_many0, many0, separated_list0, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use rust_decimal::Decimal;

use crate::ast::{AndOr, Column, Compare, Filter, Sort, SortDirection, Table};
use crate::error::{EtlError, EtlResult};
use crate::types::Value;

/// Right-hand side of a clause, before column lookup.
#[derive(Debug, Clone, PartialEq)]
enum Operand<'a> {
    None,
    Value(Value),
    Column(&'a str),
}

#[derive(Debug, Clone, PartialEq)]
struct Clause<'a> {
    column: &'a str,
    compare: Compare,
    allow_null: bool,
    operand: Operand<'a>,
}

/// Parse a filter chain against `table`'s columns.
pub fn parse_filters(input: &str, table: &Table) -> EtlResult<Vec<Filter>> {
    let text = input.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let (first, rest) = finish(text, pair(parse_clause, many0(pair(parse_and_or, parse_clause)))(text))?;

    // Each combinator links the clause before it to the one after.
    let mut clauses = vec![first];
    let mut links = Vec::new();
    for (and_or, clause) in rest {
        links.push(and_or);
        clauses.push(clause);
    }
    links.push(AndOr::And);

    clauses
        .into_iter()
        .zip(links)
        .map(|(clause, and_or)| resolve_clause(text, table, clause, and_or))
        .collect()
}

/// Parse `a desc, b` against `table`'s columns.
pub fn parse_sorts(input: &str, table: &Table) -> EtlResult<Vec<Sort>> {
    let text = input.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let items = finish(
        text,
        separated_list1(
            delimited(multispace0, char(','), multispace0),
            pair(parse_identifier, opt(preceded(multispace1, parse_direction))),
        )(text),
    )?;
    items
        .into_iter()
        .map(|(name, direction)| {
            let column = lookup(text, table, name)?;
            Ok(match direction.unwrap_or_default() {
                SortDirection::Ascending => Sort::asc(column),
                SortDirection::Descending => Sort::desc(column),
            })
        })
        .collect()
}

/// Turn a nom result into a value, requiring all input to be consumed.
fn finish<'a, T>(text: &'a str, result: IResult<&'a str, T>) -> EtlResult<T> {
    match result {
        Ok((rest, parsed)) => {
            let rest = rest.trim_start();
            if rest.is_empty() {
                Ok(parsed)
            } else {
                Err(EtlError::parse(
                    offset(text, rest),
                    format!("unexpected trailing input '{}'", rest),
                ))
            }
        }
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => Err(EtlError::parse(
            offset(text, e.input),
            format!("syntax error near '{}'", snippet(e.input)),
        )),
        Err(nom::Err::Incomplete(_)) => Err(EtlError::parse(text.len(), "unexpected end of input")),
    }
}

/// Byte offset of `part` within `text`; `part` must be a slice of `text`.
fn offset(text: &str, part: &str) -> usize {
    (part.as_ptr() as usize).saturating_sub(text.as_ptr() as usize)
}

fn snippet(input: &str) -> &str {
    match input.char_indices().nth(16) {
        Some((end, _)) => &input[..end],
        None => input,
    }
}

fn lookup(text: &str, table: &Table, name: &str) -> EtlResult<Column> {
    table.column(name).cloned().ok_or_else(|| {
        EtlError::parse(
            offset(text, name),
            format!("unknown column '{}' in table '{}'", name, table.name),
        )
    })
}

fn resolve_clause(text: &str, table: &Table, clause: Clause<'_>, and_or: AndOr) -> EtlResult<Filter> {
    let left = lookup(text, table, clause.column)?;
    let typed = |value: Value| -> EtlResult<Value> {
        if value.is_null() || left.is_array() || clause.compare == Compare::Like {
            return Ok(value);
        }
        left.convert(&value)
            .map_err(|e| EtlError::parse(offset(text, clause.column), e.to_string()))
    };

    let mut filter = match clause.operand {
        Operand::None => Filter::null(left.clone(), clause.compare == Compare::IsNull),
        Operand::Column(name) => Filter::columns(left.clone(), clause.compare, lookup(text, table, name)?),
        Operand::Value(Value::Array(items)) => {
            let items = items.into_iter().map(&typed).collect::<EtlResult<Vec<_>>>()?;
            Filter::value(left.clone(), clause.compare, Value::Array(items))
        }
        Operand::Value(value) => Filter::value(left.clone(), clause.compare, typed(value)?),
    };
    filter.allow_null = clause.allow_null;
    filter.and_or = and_or;
    Ok(filter)
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Column name.
fn parse_identifier(input: &str) -> IResult<&str, &str> {
    take_while1(is_identifier_char)(input)
}

/// A case-insensitive keyword not followed by more identifier characters.
fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag_no_case(word), not(take_while1(is_identifier_char)))
}

fn parse_and_or(input: &str) -> IResult<&str, AndOr> {
    delimited(
        multispace1,
        alt((value(AndOr::And, keyword("and")), value(AndOr::Or, keyword("or")))),
        multispace1,
    )(input)
}

fn parse_direction(input: &str) -> IResult<&str, SortDirection> {
    alt((
        value(SortDirection::Descending, keyword("desc")),
        value(SortDirection::Ascending, keyword("asc")),
    ))(input)
}

fn parse_clause(input: &str) -> IResult<&str, Clause<'_>> {
    let (input, column) = parse_identifier(input)?;
    let (input, _) = multispace0(input)?;
    let (input, (compare, allow_null, operand)) =
        alt((parse_null_test, parse_in_list, parse_like, parse_comparison))(input)?;
    Ok((
        input,
        Clause {
            column,
            compare,
            allow_null,
            operand,
        },
    ))
}

type Tail<'a> = (Compare, bool, Operand<'a>);

/// `is null` / `is not null`
fn parse_null_test(input: &str) -> IResult<&str, Tail<'_>> {
    let (input, _) = terminated(keyword("is"), multispace1)(input)?;
    let (input, negated) = opt(terminated(keyword("not"), multispace1))(input)?;
    let (input, _) = keyword("null")(input)?;
    let compare = if negated.is_some() {
        Compare::IsNotNull
    } else {
        Compare::IsNull
    };
    Ok((input, (compare, false, Operand::None)))
}

/// `in (…)` / `not in (…)`
fn parse_in_list(input: &str) -> IResult<&str, Tail<'_>> {
    let (input, negated) = opt(terminated(keyword("not"), multispace1))(input)?;
    let (input, _) = keyword("in")(input)?;
    let (input, _) = multispace0(input)?;
    let (input, items) = delimited(
        pair(char('('), multispace0),
        separated_list0(delimited(multispace0, char(','), multispace0), parse_literal),
        pair(multispace0, char(')')),
    )(input)?;
    let compare = if negated.is_some() {
        Compare::NotIn
    } else {
        Compare::In
    };
    Ok((input, (compare, false, Operand::Value(Value::Array(items)))))
}

/// `like 'pattern'`
fn parse_like(input: &str) -> IResult<&str, Tail<'_>> {
    let (input, _) = keyword("like")(input)?;
    let (input, _) = multispace0(input)?;
    let (input, pattern) = parse_quoted(input)?;
    Ok((input, (Compare::Like, false, Operand::Value(pattern))))
}

/// `op[?] literal` / `op[?] @column`
fn parse_comparison(input: &str) -> IResult<&str, Tail<'_>> {
    let (input, compare) = alt((
        value(Compare::GreaterThanEqual, tag(">=")),
        value(Compare::LessThanEqual, tag("<=")),
        value(Compare::NotEqual, tag("!=")),
        value(Compare::NotEqual, tag("<>")),
        value(Compare::Equal, char('=')),
        value(Compare::GreaterThan, char('>')),
        value(Compare::LessThan, char('<')),
    ))(input)?;
    let (input, allow_null) = opt(char('?'))(input)?;
    let (input, _) = multispace0(input)?;
    let (input, operand) = alt((
        map(preceded(char('@'), parse_identifier), Operand::Column),
        map(parse_literal, Operand::Value),
    ))(input)?;
    Ok((input, (compare, allow_null.is_some(), operand)))
}

fn parse_literal(input: &str) -> IResult<&str, Value> {
    alt((
        value(Value::Null, keyword("null")),
        value(Value::Bool(true), keyword("true")),
        value(Value::Bool(false), keyword("false")),
        parse_number,
        parse_quoted,
    ))(input)
}

/// Integer, or decimal when there is a fraction.
fn parse_number(input: &str) -> IResult<&str, Value> {
    let (rest, text) = recognize(tuple((opt(char('-')), digit1, opt(pair(char('.'), digit1)))))(input)?;
    let parsed = if text.contains('.') {
        text.parse::<Decimal>().ok().map(Value::Decimal)
    } else {
        text.parse::<i64>().ok().map(Value::Int)
    };
    match parsed {
        Some(number) => Ok((rest, number)),
        None => Err(nom::Err::Error(Error::new(input, ErrorKind::Digit))),
    }
}

/// Single-quoted string; `''` is a literal quote.
fn parse_quoted(input: &str) -> IResult<&str, Value> {
    let (input, text) = delimited(
        char('\''),
        fold_many0(
            alt((is_not("'"), value("'", tag("''")))),
            String::new,
            |mut text, part| {
                text.push_str(part);
                text
            },
        ),
        char('\''),
    )(input)?;
    Ok((input, Value::String(text)))
}
