//! Text form of expressions and condition trees
//!
//! ```text
//! AND(${http.status} == "SUCCESS", OR(${http.items}.count() > 0, ${http.body} not_empty))
//! ${http.items}.join(',').toArray().toJson()
//! ```
//!
//! Constants are JSON literals, references are `${node.path}` followed by
//! zero or more `.op(args)` transforms. Printing and parsing round-trip
//! exactly for trees with no misplaced operands, which is every tree a
//! validated flow can hold.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::condition::{CompareOperator, ConditionTree, LogicOperator};
use super::error::DslError;
use super::expression::{ExpressionValue, Transformation};

impl fmt::Display for Transformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Join { separator } => {
                write!(f, "join('")?;
                for c in separator.chars() {
                    if c == '\'' || c == '\\' {
                        write!(f, "\\")?;
                    }
                    write!(f, "{}", c)?;
                }
                write!(f, "')")
            }
            other => write!(f, "{}()", other.name()),
        }
    }
}

impl fmt::Display for ExpressionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Const { value } => write!(f, "{}", value),
            Self::Expression { path, transforms } => {
                write!(f, "${{{}}}", path)?;
                for transform in transforms {
                    write!(f, ".{}", transform)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for ConditionTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compare {
                left,
                operator,
                right,
            } => {
                write!(f, "{} {}", left, operator.symbol())?;
                if !operator.is_unary() {
                    match right {
                        Some(right) => write!(f, " {}", right)?,
                        None => write!(f, " null")?,
                    }
                }
                Ok(())
            }
            Self::Logic { op, children } => {
                write!(f, "{}(", op.as_str())?;
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl FromStr for ConditionTree {
    type Err = DslError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser::new(s);
        let tree = parser.condition()?;
        parser.finish()?;
        Ok(tree)
    }
}

impl FromStr for ExpressionValue {
    type Err = DslError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser::new(s);
        let value = parser.expression()?;
        parser.finish()?;
        Ok(value)
    }
}

/// Accept a condition either as a structured object or as DSL text
pub fn deserialize_condition<'de, D>(deserializer: D) -> Result<ConditionTree, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    condition_from_value(value).map_err(serde::de::Error::custom)
}

pub fn deserialize_optional_condition<'de, D>(
    deserializer: D,
) -> Result<Option<ConditionTree>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => condition_from_value(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

fn condition_from_value(value: Value) -> Result<ConditionTree, String> {
    match value {
        Value::String(text) => text.parse().map_err(|e: DslError| e.to_string()),
        other => serde_json::from_value(other).map_err(|e| e.to_string()),
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn error(&self, message: impl Into<String>) -> DslError {
        DslError::new(message, self.pos)
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> Result<(), DslError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", token)))
        }
    }

    fn finish(&mut self) -> Result<(), DslError> {
        self.skip_ws();
        if self.pos == self.src.len() {
            Ok(())
        } else {
            Err(self.error("unexpected trailing input"))
        }
    }

    fn word(&mut self) -> &'a str {
        let rest = self.rest();
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn condition(&mut self) -> Result<ConditionTree, DslError> {
        self.skip_ws();
        for op in [LogicOperator::And, LogicOperator::Or] {
            let keyword = op.as_str();
            if self.rest().starts_with(keyword)
                && self.rest()[keyword.len()..].trim_start().starts_with('(')
            {
                self.pos += keyword.len();
                self.skip_ws();
                self.expect("(")?;
                return self.logic_children(op);
            }
        }
        self.compare()
    }

    fn logic_children(&mut self, op: LogicOperator) -> Result<ConditionTree, DslError> {
        let mut children = Vec::new();
        self.skip_ws();
        if !self.eat(")") {
            loop {
                children.push(self.condition()?);
                self.skip_ws();
                if self.eat(")") {
                    break;
                }
                self.expect(",")?;
            }
        }
        Ok(ConditionTree::Logic { op, children })
    }

    fn compare(&mut self) -> Result<ConditionTree, DslError> {
        let left = self.expression()?;
        self.skip_ws();
        let operator = self.operator()?;
        if operator.is_unary() {
            return Ok(ConditionTree::unary(left, operator));
        }
        let right = self.expression()?;
        Ok(ConditionTree::compare(left, operator, right))
    }

    fn operator(&mut self) -> Result<CompareOperator, DslError> {
        let start = self.pos;
        for symbol in [">=", "<=", "==", "!=", ">", "<"] {
            if self.eat(symbol) {
                return CompareOperator::from_symbol(symbol)
                    .ok_or_else(|| DslError::new("unknown operator", start));
            }
        }
        let word = self.word();
        CompareOperator::from_symbol(word)
            .ok_or_else(|| DslError::new(format!("unknown operator '{}'", word), start))
    }

    fn expression(&mut self) -> Result<ExpressionValue, DslError> {
        self.skip_ws();
        if self.eat("${") {
            let end = self
                .rest()
                .find('}')
                .ok_or_else(|| self.error("unterminated reference"))?;
            let path = self.rest()[..end].trim().to_string();
            if path.is_empty() {
                return Err(self.error("empty reference path"));
            }
            self.pos += end + 1;

            let mut transforms = Vec::new();
            while self.rest().starts_with('.') {
                self.pos += 1;
                transforms.push(self.transformation()?);
            }
            return Ok(ExpressionValue::Expression { path, transforms });
        }
        self.literal().map(|value| ExpressionValue::Const { value })
    }

    fn transformation(&mut self) -> Result<Transformation, DslError> {
        let start = self.pos;
        let name = self.word();
        self.expect("(")?;
        self.skip_ws();

        let transform = match name {
            "toNumber" => Transformation::ToNumber,
            "toBoolean" => Transformation::ToBoolean,
            "toArray" => Transformation::ToArray,
            "toObject" => Transformation::ToObject,
            "toJson" => Transformation::ToJson,
            "count" => Transformation::Count,
            "empty" => Transformation::Empty,
            "join" => {
                let separator = if self.peek() == Some('\'') {
                    self.quoted()?
                } else {
                    ",".to_string()
                };
                self.skip_ws();
                Transformation::Join { separator }
            }
            other => return Err(DslError::new(format!("unknown transform '{}'", other), start)),
        };

        self.expect(")")?;
        Ok(transform)
    }

    fn quoted(&mut self) -> Result<String, DslError> {
        self.expect("'")?;
        let mut out = String::new();
        let mut chars = self.rest().char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '\'' => {
                    self.pos += i + 1;
                    return Ok(out);
                }
                '\\' => match chars.next() {
                    Some((_, escaped)) => out.push(escaped),
                    None => break,
                },
                c => out.push(c),
            }
        }
        Err(self.error("unterminated string"))
    }

    fn literal(&mut self) -> Result<Value, DslError> {
        let rest = self.rest();
        match self.peek() {
            Some('"') | Some('[') | Some('{') => {
                let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Value>();
                match stream.next() {
                    Some(Ok(value)) => {
                        self.pos += stream.byte_offset();
                        Ok(value)
                    }
                    Some(Err(e)) => Err(self.error(format!("invalid literal: {}", e))),
                    None => Err(self.error("expected literal")),
                }
            }
            Some(_) => {
                let len = rest
                    .find(|c: char| c.is_whitespace() || c == ',' || c == ')')
                    .unwrap_or(rest.len());
                let token = &rest[..len];
                let value = serde_json::from_str::<Value>(token)
                    .map_err(|_| self.error(format!("invalid literal '{}'", token)))?;
                self.pos += len;
                Ok(value)
            }
            None => Err(self.error("expected expression")),
        }
    }
}
