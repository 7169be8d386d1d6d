//! String templates with embedded `{expr}` placeholders.
//!
//! Used for label names such as `"relay_{tlist[1]}"`. `{{` and `}}` produce
//! literal braces.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{is_not, tag},
    character::complete::{char, none_of},
    combinator::{map, recognize, value},
    multi::many0_count,
    sequence::delimited,
};

use super::eval::{Context, EvalError};
use super::lexer::string;
use super::value::to_label_value;
use super::{Expr, ExprError};

#[derive(Debug, Clone)]
enum Part {
    Text(String),
    Expr(Expr),
}

/// A compiled template.
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Piece<'a> {
    Text(&'a str),
    Brace(char),
    Placeholder(&'a str),
}

fn piece(input: &str) -> IResult<&str, Piece<'_>> {
    alt((
        value(Piece::Brace('{'), tag("{{")),
        value(Piece::Brace('}'), tag("}}")),
        map(delimited(char('{'), placeholder_body, char('}')), Piece::Placeholder),
        map(is_not("{}"), Piece::Text),
    ))
    .parse(input)
}

/// Expression text up to the closing `}`, skipping over quoted strings.
fn placeholder_body(input: &str) -> IResult<&str, &str> {
    recognize(many0_count(alt((
        recognize(string),
        recognize(none_of("}'\"")),
    ))))
    .parse(input)
}

impl Template {
    /// Compile a template, parsing every placeholder.
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let mut parts = Vec::new();
        let mut text = String::new();
        let mut input = source;

        while !input.is_empty() {
            let offset = source.len() - input.len();
            let (rest, piece) = piece(input).map_err(|_| {
                if input.starts_with('}') {
                    ExprError::new(offset, "single '}' in template")
                } else {
                    ExprError::new(offset, "unclosed '{' in template")
                }
            })?;

            match piece {
                Piece::Text(literal) => text.push_str(literal),
                Piece::Brace(c) => text.push(c),
                Piece::Placeholder(body) => {
                    let start = offset + 1;
                    let expr = Expr::parse(body)
                        .map_err(|e| ExprError::new(start + e.offset, e.message))?;

                    if !text.is_empty() {
                        parts.push(Part::Text(std::mem::take(&mut text)));
                    }
                    parts.push(Part::Expr(expr));
                }
            }
            input = rest;
        }

        if !text.is_empty() {
            parts.push(Part::Text(text));
        }

        Ok(Self {
            source: source.to_string(),
            parts,
        })
    }

    /// The template as written.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the template contains no placeholders.
    pub fn is_literal(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, Part::Text(_)))
    }

    /// Render the template against a message context.
    pub fn render(&self, ctx: &Context<'_>) -> Result<String, EvalError> {
        let mut output = String::new();
        for part in &self.parts {
            match part {
                Part::Text(text) => output.push_str(text),
                Part::Expr(expr) => {
                    let value = expr.eval(ctx)?;
                    output.push_str(&to_label_value(&value)?);
                }
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(template: &str) -> Result<String, EvalError> {
        let data = json!({"Relay": 2, "Name": "plug"});
        let segments = vec!["stat".to_string(), "plug1".to_string()];
        let ctx = Context {
            topic: "stat/plug1",
            segments: &segments,
            payload: b"",
            data: &data,
        };
        Template::parse(template).unwrap().render(&ctx)
    }

    #[test]
    fn test_literal() {
        assert!(Template::parse("sensor").unwrap().is_literal());
        assert_eq!(render("sensor").unwrap(), "sensor");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(render("relay_{data.Relay}").unwrap(), "relay_2");
        assert_eq!(render("{tlist[1]}-{data.Name}").unwrap(), "plug1-plug");
        assert_eq!(render("{format('{}', 'x')}").unwrap(), "x");
        assert!(!Template::parse("a{tlist[0]}").unwrap().is_literal());
    }

    #[test]
    fn test_escapes() {
        assert_eq!(render("{{literal}}").unwrap(), "{literal}");
        assert_eq!(render("{'}'}_x").unwrap(), "}_x");
    }

    #[test]
    fn test_parse_errors() {
        assert!(Template::parse("relay_{data.Relay").is_err());
        assert!(Template::parse("a}b").is_err());
        assert_eq!(Template::parse("ab{'x}").unwrap_err().offset, 2);
        let err = Template::parse("x{1 +}").unwrap_err();
        assert_eq!(err.offset, 5);
    }

    #[test]
    fn test_eval_errors() {
        assert!(matches!(
            render("{data.Missing}").unwrap_err(),
            EvalError::MissingField(_)
        ));
    }
}
