//! Tokenizer for the expression language, built from nom combinators.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{anychar, char, digit1, one_of, satisfy},
    combinator::{map, map_res, opt, recognize, value},
    multi::fold_many0,
    sequence::{delimited, preceded},
};

use super::ExprError;

/// A lexical token with its byte offset in the source.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Plus,
    Minus,
    Star,
    Slash,
    DoubleSlash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Split `source` into tokens.
pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut input = source;

    loop {
        input = input.trim_start_matches(|c: char| c.is_ascii_whitespace());
        if input.is_empty() {
            return Ok(tokens);
        }

        let offset = source.len() - input.len();
        match token(input) {
            Ok((rest, kind)) => {
                tokens.push(Token { kind, offset });
                input = rest;
            }
            Err(_) => return Err(lex_error(input, offset)),
        }
    }
}

fn lex_error(input: &str, offset: usize) -> ExprError {
    match input.chars().next() {
        Some('\'' | '"') => ExprError::new(offset, "unterminated string literal"),
        Some(c) => ExprError::new(offset, format!("unexpected character '{}'", c)),
        None => ExprError::new(offset, "unexpected end of expression"),
    }
}

fn token(input: &str) -> IResult<&str, TokenKind> {
    alt((
        map(number, TokenKind::Number),
        map(identifier, |name: &str| TokenKind::Ident(name.to_string())),
        map(string, TokenKind::Str),
        double_operator,
        single_operator,
    ))
    .parse(input)
}

/// Digits, an optional fraction and an optional exponent.
///
/// A `.` only belongs to the number when a digit follows, so `tlist.1.x`
/// stays a chain of accesses.
fn number(input: &str) -> IResult<&str, f64> {
    map_res(
        recognize((
            digit1,
            opt((char('.'), digit1)),
            opt((one_of("eE"), opt(one_of("+-")), digit1)),
        )),
        str::parse::<f64>,
    )
    .parse(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize((
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))
    .parse(input)
}

pub(super) fn string(input: &str) -> IResult<&str, String> {
    alt((quoted('\''), quoted('"'))).parse(input)
}

fn quoted<'a>(quote: char) -> impl FnMut(&'a str) -> IResult<&'a str, String> {
    move |input| {
        delimited(
            char(quote),
            fold_many0(
                alt((
                    preceded(char('\\'), map(anychar, unescape)),
                    satisfy(move |c| c != quote && c != '\\'),
                )),
                String::new,
                |mut text: String, c: char| {
                    text.push(c);
                    text
                },
            ),
            char(quote),
        )
        .parse(input)
    }
}

fn unescape(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        other => other,
    }
}

fn double_operator(input: &str) -> IResult<&str, TokenKind> {
    alt((
        value(TokenKind::DoubleSlash, tag("//")),
        value(TokenKind::EqEq, tag("==")),
        value(TokenKind::NotEq, tag("!=")),
        value(TokenKind::Le, tag("<=")),
        value(TokenKind::Ge, tag(">=")),
    ))
    .parse(input)
}

fn single_operator(input: &str) -> IResult<&str, TokenKind> {
    alt((
        value(TokenKind::Dot, char('.')),
        value(TokenKind::Comma, char(',')),
        value(TokenKind::LParen, char('(')),
        value(TokenKind::RParen, char(')')),
        value(TokenKind::LBracket, char('[')),
        value(TokenKind::RBracket, char(']')),
        value(TokenKind::Plus, char('+')),
        value(TokenKind::Minus, char('-')),
        value(TokenKind::Star, char('*')),
        value(TokenKind::Slash, char('/')),
        value(TokenKind::Percent, char('%')),
        value(TokenKind::Lt, char('<')),
        value(TokenKind::Gt, char('>')),
    ))
    .parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_field_path() {
        assert_eq!(
            kinds("data.BME280.Temperature"),
            vec![
                TokenKind::Ident("data".into()),
                TokenKind::Dot,
                TokenKind::Ident("BME280".into()),
                TokenKind::Dot,
                TokenKind::Ident("Temperature".into()),
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(kinds("1.5"), vec![TokenKind::Number(1.5)]);
        assert_eq!(kinds("2e3"), vec![TokenKind::Number(2000.0)]);
        assert_eq!(
            kinds("tlist.1"),
            vec![
                TokenKind::Ident("tlist".into()),
                TokenKind::Dot,
                TokenKind::Number(1.0)
            ]
        );
    }

    #[test]
    fn test_strings() {
        assert_eq!(kinds("'ON'"), vec![TokenKind::Str("ON".into())]);
        assert_eq!(kinds(r#""a\"b""#), vec![TokenKind::Str("a\"b".into())]);
        assert_eq!(kinds("'ü'"), vec![TokenKind::Str("ü".into())]);
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("a // 2 >= 1 != b"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::DoubleSlash,
                TokenKind::Number(2.0),
                TokenKind::Ge,
                TokenKind::Number(1.0),
                TokenKind::NotEq,
                TokenKind::Ident("b".into()),
            ]
        );
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("'abc").unwrap_err();
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn test_unexpected_character() {
        let err = tokenize("data;").unwrap_err();
        assert_eq!(err.offset, 4);
    }
}
