//! Expression evaluation over JSON values.

use std::borrow::Cow;
use std::cmp::Ordering;

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{is_not, tag},
    character::complete::{char, digit1, space0},
    combinator::{map, map_res, opt, value},
    sequence::delimited,
};
use serde_json::{Map, Value};
use thiserror::Error;

use super::parser::{Ast, BinaryOp};
use super::value::{display, truthy};

/// Failure to evaluate an expression against a message.
///
/// These are expected routinely, e.g. when a device omits a field.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("missing field '{0}'")]
    MissingField(String),

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("result is not a finite number")]
    NonFinite,

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("function '{name}' takes {expected} argument(s), got {got}")]
    ArgumentCount {
        name: String,
        expected: &'static str,
        got: usize,
    },

    #[error("cannot convert '{0}' to a number")]
    InvalidNumber(String),

    #[error("invalid format string: {0}")]
    InvalidFormat(String),

    #[error("invalid label name '{0}'")]
    InvalidLabelName(String),
}

/// Variables visible to an expression.
///
/// Values are resolved on first use and borrowed from the message where
/// possible.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    /// Full topic string.
    pub topic: &'a str,
    /// Topic split into segments.
    pub segments: &'a [String],
    /// Raw payload.
    pub payload: &'a [u8],
    /// Parsed payload.
    pub data: &'a Value,
}

impl<'a> Context<'a> {
    fn variable(&self, name: &str) -> Result<Cow<'a, Value>, EvalError> {
        match name {
            "data" | "payload" => Ok(Cow::Borrowed(self.data)),
            "topic" => Ok(Cow::Owned(Value::String(self.topic.to_string()))),
            "tlist" => Ok(Cow::Owned(self.segment_list())),
            "msg" => {
                let mut msg = Map::new();
                msg.insert("topic".into(), Value::String(self.topic.to_string()));
                msg.insert(
                    "payload".into(),
                    Value::String(String::from_utf8_lossy(self.payload).into_owned()),
                );
                msg.insert("data".into(), self.data.clone());
                msg.insert("tlist".into(), self.segment_list());
                Ok(Cow::Owned(Value::Object(msg)))
            }
            other => Err(EvalError::UnknownVariable(other.to_string())),
        }
    }

    fn segment_list(&self) -> Value {
        Value::Array(
            self.segments
                .iter()
                .map(|s| Value::String(s.clone()))
                .collect(),
        )
    }
}

pub(crate) fn evaluate<'a>(ast: &Ast, ctx: &Context<'a>) -> Result<Cow<'a, Value>, EvalError> {
    match ast {
        Ast::Literal(value) => Ok(Cow::Owned(value.clone())),
        Ast::Var(name) => ctx.variable(name),
        Ast::Field(target, name) => {
            let target = evaluate(target, ctx)?;
            field(target, name)
        }
        Ast::Index(target, index) => {
            let target = evaluate(target, ctx)?;
            let index = evaluate(index, ctx)?;
            index_value(target, &index)
        }
        Ast::Call(name, args) => {
            let args = args
                .iter()
                .map(|arg| evaluate(arg, ctx).map(Cow::into_owned))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, args).map(Cow::Owned)
        }
        Ast::Neg(inner) => {
            let value = number(evaluate(inner, ctx)?.as_ref(), "-")?;
            finite(-value)
        }
        Ast::Not(inner) => Ok(Cow::Owned(Value::Bool(!truthy(evaluate(inner, ctx)?.as_ref())))),
        Ast::And(lhs, rhs) => {
            let lhs = evaluate(lhs, ctx)?;
            if truthy(&lhs) { evaluate(rhs, ctx) } else { Ok(lhs) }
        }
        Ast::Or(lhs, rhs) => {
            let lhs = evaluate(lhs, ctx)?;
            if truthy(&lhs) { Ok(lhs) } else { evaluate(rhs, ctx) }
        }
        Ast::Conditional {
            then,
            cond,
            otherwise,
        } => {
            if truthy(evaluate(cond, ctx)?.as_ref()) {
                evaluate(then, ctx)
            } else {
                evaluate(otherwise, ctx)
            }
        }
        Ast::Binary(op, lhs, rhs) => {
            let lhs = evaluate(lhs, ctx)?;
            let rhs = evaluate(rhs, ctx)?;
            binary(*op, &lhs, &rhs).map(Cow::Owned)
        }
    }
}

fn field<'a>(target: Cow<'a, Value>, name: &str) -> Result<Cow<'a, Value>, EvalError> {
    match target {
        Cow::Borrowed(Value::Object(map)) => map
            .get(name)
            .map(Cow::Borrowed)
            .ok_or_else(|| EvalError::MissingField(name.to_string())),
        Cow::Owned(Value::Object(mut map)) => map
            .remove(name)
            .map(Cow::Owned)
            .ok_or_else(|| EvalError::MissingField(name.to_string())),
        Cow::Borrowed(Value::Null) | Cow::Owned(Value::Null) => {
            Err(EvalError::MissingField(name.to_string()))
        }
        other => Err(EvalError::TypeMismatch(format!(
            "cannot access field '{}' of {}",
            name,
            type_name(&other)
        ))),
    }
}

fn index_value<'a>(target: Cow<'a, Value>, index: &Value) -> Result<Cow<'a, Value>, EvalError> {
    match (target, index) {
        (Cow::Borrowed(Value::Array(items)), Value::Number(_)) => {
            let i = resolve_index(index, items.len())?;
            Ok(Cow::Borrowed(&items[i]))
        }
        (Cow::Owned(Value::Array(mut items)), Value::Number(_)) => {
            let i = resolve_index(index, items.len())?;
            Ok(Cow::Owned(items.swap_remove(i)))
        }
        (target, Value::String(key)) if target.is_object() => field(target, key),
        (target, Value::Number(_)) if target.is_string() => {
            let chars: Vec<char> = target
                .as_str()
                .map(|s| s.chars().collect())
                .unwrap_or_default();
            let i = resolve_index(index, chars.len())?;
            Ok(Cow::Owned(Value::String(chars[i].to_string())))
        }
        (target, index) => Err(EvalError::TypeMismatch(format!(
            "cannot index {} with {}",
            type_name(&target),
            type_name(index)
        ))),
    }
}

/// Resolve a possibly negative index against `len`.
fn resolve_index(index: &Value, len: usize) -> Result<usize, EvalError> {
    let raw = index
        .as_f64()
        .filter(|f| f.fract() == 0.0)
        .ok_or_else(|| EvalError::TypeMismatch("index must be an integer".to_string()))?
        as i64;
    let resolved = if raw < 0 { raw + len as i64 } else { raw };

    if resolved < 0 || resolved >= len as i64 {
        return Err(EvalError::IndexOutOfRange { index: raw, len });
    }
    Ok(resolved as usize)
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Add => match (lhs, rhs) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            _ => arithmetic(lhs, rhs, "+", |a, b| Ok(a + b)),
        },
        BinaryOp::Sub => arithmetic(lhs, rhs, "-", |a, b| Ok(a - b)),
        BinaryOp::Mul => arithmetic(lhs, rhs, "*", |a, b| Ok(a * b)),
        BinaryOp::Div => arithmetic(lhs, rhs, "/", |a, b| {
            if b == 0.0 {
                Err(EvalError::DivisionByZero)
            } else {
                Ok(a / b)
            }
        }),
        BinaryOp::FloorDiv => arithmetic(lhs, rhs, "//", |a, b| {
            if b == 0.0 {
                Err(EvalError::DivisionByZero)
            } else {
                Ok((a / b).floor())
            }
        }),
        BinaryOp::Mod => arithmetic(lhs, rhs, "%", |a, b| {
            if b == 0.0 {
                Err(EvalError::DivisionByZero)
            } else {
                // Result takes the sign of the divisor
                Ok(((a % b) + b) % b)
            }
        }),
        BinaryOp::Eq => Ok(Value::Bool(equals(lhs, rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!equals(lhs, rhs))),
        BinaryOp::Lt => ordering(lhs, rhs).map(|o| Value::Bool(o == Ordering::Less)),
        BinaryOp::Le => ordering(lhs, rhs).map(|o| Value::Bool(o != Ordering::Greater)),
        BinaryOp::Gt => ordering(lhs, rhs).map(|o| Value::Bool(o == Ordering::Greater)),
        BinaryOp::Ge => ordering(lhs, rhs).map(|o| Value::Bool(o != Ordering::Less)),
    }
}

fn arithmetic(
    lhs: &Value,
    rhs: &Value,
    op: &str,
    f: impl FnOnce(f64, f64) -> Result<f64, EvalError>,
) -> Result<Value, EvalError> {
    let result = f(number(lhs, op)?, number(rhs, op)?)?;
    finite(result).map(Cow::into_owned)
}

fn equals(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => lhs == rhs,
    }
}

fn ordering(lhs: &Value, rhs: &Value) -> Result<Ordering, EvalError> {
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => {
            let a = number(lhs, "comparison")?;
            let b = number(rhs, "comparison")?;
            a.partial_cmp(&b)
                .ok_or_else(|| EvalError::TypeMismatch("cannot compare NaN".to_string()))
        }
    }
}

/// Numeric view of a value for arithmetic. Booleans count as 0 and 1.
fn number(value: &Value, op: &str) -> Result<f64, EvalError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| EvalError::TypeMismatch(format!("number out of range for {}", op))),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => Err(EvalError::TypeMismatch(format!(
            "unsupported operand {} for {}",
            type_name(other),
            op
        ))),
    }
}

fn finite<'a>(value: f64) -> Result<Cow<'a, Value>, EvalError> {
    if value.is_finite() {
        Ok(Cow::Owned(Value::from(value)))
    } else {
        Err(EvalError::NonFinite)
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Parse a string into a number, accepting surrounding whitespace.
pub(crate) fn parse_number(s: &str) -> Result<f64, EvalError> {
    s.trim()
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .ok_or_else(|| EvalError::InvalidNumber(s.to_string()))
}

fn call(name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    let arity = |expected: &'static str, ok: bool| {
        if ok {
            Ok(())
        } else {
            Err(EvalError::ArgumentCount {
                name: name.to_string(),
                expected,
                got: args.len(),
            })
        }
    };

    match name {
        "float" => {
            arity("1", args.len() == 1)?;
            to_float(&args[0]).map(Value::from)
        }
        "int" => {
            arity("1", args.len() == 1)?;
            Ok(Value::from(to_float(&args[0])?.trunc() as i64))
        }
        "str" => {
            arity("1", args.len() == 1)?;
            Ok(Value::String(display(&args[0])))
        }
        "bool" => {
            arity("1", args.len() == 1)?;
            Ok(Value::Bool(truthy(&args[0])))
        }
        "len" => {
            arity("1", args.len() == 1)?;
            match &args[0] {
                Value::String(s) => Ok(Value::from(s.chars().count())),
                Value::Array(a) => Ok(Value::from(a.len())),
                Value::Object(o) => Ok(Value::from(o.len())),
                other => Err(EvalError::TypeMismatch(format!(
                    "len() of {}",
                    type_name(other)
                ))),
            }
        }
        "abs" => {
            arity("1", args.len() == 1)?;
            Ok(Value::from(number(&args[0], "abs")?.abs()))
        }
        "round" => {
            arity("1 or 2", matches!(args.len(), 1 | 2))?;
            let value = number(&args[0], "round")?;
            let digits = match args.get(1) {
                Some(d) => number(d, "round")? as i32,
                None => 0,
            };
            let factor = 10f64.powi(digits);
            finite((value * factor).round() / factor).map(Cow::into_owned)
        }
        "min" | "max" => {
            arity("at least 1", !args.is_empty())?;
            let mut values = args.iter().map(|v| number(v, name));
            let first = values.next().unwrap_or(Ok(0.0))?;
            let result = values.try_fold(first, |acc, v| {
                let v = v?;
                Ok::<_, EvalError>(if name == "min" { acc.min(v) } else { acc.max(v) })
            })?;
            Ok(Value::from(result))
        }
        "lower" | "upper" => {
            arity("1", args.len() == 1)?;
            match &args[0] {
                Value::String(s) if name == "lower" => Ok(Value::String(s.to_lowercase())),
                Value::String(s) => Ok(Value::String(s.to_uppercase())),
                other => Err(EvalError::TypeMismatch(format!(
                    "{}() of {}",
                    name,
                    type_name(other)
                ))),
            }
        }
        "format" => {
            arity("at least 1", !args.is_empty())?;
            match &args[0] {
                Value::String(template) => format_positional(template, &args[1..]).map(Value::String),
                other => Err(EvalError::TypeMismatch(format!(
                    "format() template must be a string, got {}",
                    type_name(other)
                ))),
            }
        }
        _ => Err(EvalError::UnknownFunction(name.to_string())),
    }
}

fn to_float(value: &Value) -> Result<f64, EvalError> {
    match value {
        Value::String(s) => parse_number(s),
        other => number(other, "float"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FormatPiece<'a> {
    Text(&'a str),
    Brace(char),
    Next,
    Position(usize),
}

fn format_piece(input: &str) -> IResult<&str, FormatPiece<'_>> {
    alt((
        value(FormatPiece::Brace('{'), tag("{{")),
        value(FormatPiece::Brace('}'), tag("}}")),
        map(
            delimited(
                char('{'),
                opt(delimited(space0, map_res(digit1, str::parse::<usize>), space0)),
                char('}'),
            ),
            |position| position.map_or(FormatPiece::Next, FormatPiece::Position),
        ),
        map(is_not("{}"), FormatPiece::Text),
    ))
    .parse(input)
}

/// Substitute `{}` (sequential) and `{N}` (positional) placeholders.
/// `{{` and `}}` produce literal braces.
fn format_positional(template: &str, args: &[Value]) -> Result<String, EvalError> {
    let mut output = String::with_capacity(template.len());
    let mut input = template;
    let mut next = 0;

    while !input.is_empty() {
        let (rest, piece) = format_piece(input).map_err(|_| {
            let what = if input.starts_with('}') { "single '}'" } else { "bad placeholder" };
            EvalError::InvalidFormat(format!(
                "{} at offset {} in '{}'",
                what,
                template.len() - input.len(),
                template
            ))
        })?;

        let index = match piece {
            FormatPiece::Text(text) => {
                output.push_str(text);
                None
            }
            FormatPiece::Brace(c) => {
                output.push(c);
                None
            }
            FormatPiece::Next => {
                next += 1;
                Some(next - 1)
            }
            FormatPiece::Position(index) => Some(index),
        };

        if let Some(index) = index {
            let arg = args.get(index).ok_or_else(|| {
                EvalError::InvalidFormat(format!("no argument for placeholder {}", index))
            })?;
            output.push_str(&display(arg));
        }
        input = rest;
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parser::parse;
    use serde_json::json;

    fn eval_with(source: &str, data: &Value) -> Result<Value, EvalError> {
        let segments = vec!["tele".to_string(), "node1".to_string(), "SENSOR".to_string()];
        let ctx = Context {
            topic: "tele/node1/SENSOR",
            segments: &segments,
            payload: b"{}",
            data,
        };
        evaluate(&parse(source).unwrap(), &ctx).map(Cow::into_owned)
    }

    fn eval(source: &str) -> Result<Value, EvalError> {
        eval_with(
            source,
            &json!({
                "BME280": {"Temperature": 25.5, "Humidity": 40},
                "POWER": "ON",
                "list": [1, 2, 3],
                "Name": "Kitchen Plug",
                "nothing": null,
            }),
        )
    }

    #[test]
    fn test_field_access() {
        assert_eq!(eval("data.BME280.Temperature").unwrap(), json!(25.5));
        assert_eq!(eval("payload['BME280']['Humidity']").unwrap(), json!(40));
    }

    #[test]
    fn test_missing_field() {
        assert_eq!(
            eval("data.DS18B20.Temperature").unwrap_err(),
            EvalError::MissingField("DS18B20".into())
        );
        assert_eq!(
            eval("data.nothing.x").unwrap_err(),
            EvalError::MissingField("x".into())
        );
        assert!(matches!(
            eval("data.POWER.x").unwrap_err(),
            EvalError::TypeMismatch(_)
        ));
    }

    #[test]
    fn test_topic_variables() {
        assert_eq!(eval("tlist[1]").unwrap(), json!("node1"));
        assert_eq!(eval("tlist[-1]").unwrap(), json!("SENSOR"));
        assert_eq!(eval("tlist.0").unwrap(), json!("tele"));
        assert_eq!(eval("topic").unwrap(), json!("tele/node1/SENSOR"));
        assert_eq!(eval("msg.topic").unwrap(), json!("tele/node1/SENSOR"));
        assert_eq!(eval("msg.tlist[2]").unwrap(), json!("SENSOR"));
        assert_eq!(eval("msg.data.POWER").unwrap(), json!("ON"));
        assert_eq!(eval("msg.payload").unwrap(), json!("{}"));
    }

    #[test]
    fn test_index_out_of_range() {
        assert_eq!(
            eval("tlist[3]").unwrap_err(),
            EvalError::IndexOutOfRange { index: 3, len: 3 }
        );
        assert!(eval("data.list[-4]").is_err());
    }

    #[test]
    fn test_unknown_variable() {
        assert_eq!(
            eval("os.system").unwrap_err(),
            EvalError::UnknownVariable("os".into())
        );
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("data.BME280.Temperature * 2 + 1").unwrap(), json!(52.0));
        assert_eq!(eval("7 // 2").unwrap(), json!(3.0));
        assert_eq!(eval("-7 % 3").unwrap(), json!(2.0));
        assert_eq!(eval("-(1 - 3)").unwrap(), json!(2.0));
        assert_eq!(eval("1 / 0").unwrap_err(), EvalError::DivisionByZero);
        assert!(matches!(
            eval("data.POWER * 2").unwrap_err(),
            EvalError::TypeMismatch(_)
        ));
    }

    #[test]
    fn test_string_concat() {
        assert_eq!(eval("tlist[1] + '-' + data.POWER").unwrap(), json!("node1-ON"));
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(eval("1 if data.POWER == 'ON' else 0").unwrap(), json!(1.0));
        assert_eq!(eval("1 if data.POWER == 'OFF' else 0").unwrap(), json!(0.0));
        assert_eq!(eval("data.BME280.Humidity == 40.0").unwrap(), json!(true));
        assert_eq!(eval("2 < 3 and 'a' < 'b'").unwrap(), json!(true));
        assert_eq!(eval("not data.list").unwrap(), json!(false));
        assert_eq!(eval("data.nothing or 5").unwrap(), json!(5.0));
    }

    #[test]
    fn test_operators_on_payload_fields() {
        assert_eq!(eval("-data.BME280.Temperature").unwrap(), json!(-25.5));
        assert_eq!(eval("not data.nothing").unwrap(), json!(true));
        assert_eq!(eval("data.Name if data.POWER else 'none'").unwrap(), json!("Kitchen Plug"));
    }

    #[test]
    fn test_short_circuit_skips_errors() {
        assert_eq!(eval("false and data.missing").unwrap(), json!(false));
        assert_eq!(eval("true or data.missing").unwrap(), json!(true));
        assert_eq!(eval("0 if true else data.missing").unwrap(), json!(0.0));
    }

    #[test]
    fn test_builtins() {
        assert_eq!(eval("float('21.5')").unwrap(), json!(21.5));
        assert_eq!(eval("int(3.9)").unwrap(), json!(3));
        assert_eq!(eval("str(data.BME280.Humidity)").unwrap(), json!("40"));
        assert_eq!(eval("len(data.list)").unwrap(), json!(3));
        assert_eq!(eval("len(tlist[1])").unwrap(), json!(5));
        assert_eq!(eval("round(3.14159, 2)").unwrap(), json!(3.14));
        assert_eq!(eval("round(2.5)").unwrap(), json!(3.0));
        assert_eq!(eval("abs(-2)").unwrap(), json!(2.0));
        assert_eq!(eval("max(1, 5, 3)").unwrap(), json!(5.0));
        assert_eq!(eval("min(4, 2)").unwrap(), json!(2.0));
        assert_eq!(eval("lower(data.Name)").unwrap(), json!("kitchen plug"));
        assert_eq!(eval("upper(tlist[1])").unwrap(), json!("NODE1"));
        assert_eq!(eval("bool(data.POWER)").unwrap(), json!(true));
    }

    #[test]
    fn test_builtin_errors() {
        assert_eq!(
            eval("float('abc')").unwrap_err(),
            EvalError::InvalidNumber("abc".into())
        );
        assert_eq!(
            eval("exec('x')").unwrap_err(),
            EvalError::UnknownFunction("exec".into())
        );
        assert!(matches!(
            eval("len(1, 2)").unwrap_err(),
            EvalError::ArgumentCount { got: 2, .. }
        ));
    }

    #[test]
    fn test_format() {
        assert_eq!(
            eval("format('{}/{}', tlist[0], tlist[1])").unwrap(),
            json!("tele/node1")
        );
        assert_eq!(
            eval("format('{1}-{0}', 'a', data.BME280.Temperature)").unwrap(),
            json!("25.5-a")
        );
        assert_eq!(eval("format('{{x}}')").unwrap(), json!("{x}"));
        assert!(matches!(
            eval("format('{2}', 1)").unwrap_err(),
            EvalError::InvalidFormat(_)
        ));
    }

    #[test]
    fn test_format_malformed_placeholders() {
        assert_eq!(eval("format('{ 1 }{0}', 'a', 'b')").unwrap(), json!("ba"));
        for template in ["'{x}'", "'{0'", "'a}b'"] {
            let err = eval(&format!("format({}, 1)", template)).unwrap_err();
            assert!(matches!(err, EvalError::InvalidFormat(_)), "{}: {:?}", template, err);
        }
        assert_eq!(
            eval("format('a}b', 1)").unwrap_err(),
            EvalError::InvalidFormat("single '}' at offset 1 in 'a}b'".into())
        );
    }
}
