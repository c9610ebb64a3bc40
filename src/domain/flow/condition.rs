//! Condition trees and their evaluation

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::ExecutionContext;
use super::error::EvaluationError;
use super::expression::{ExpressionValue, ValueKind, stringify};

/// Comparison applied by a leaf of a condition tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompareOperator {
    Equal,
    NotEqual,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    Empty,
    NotEmpty,
    Contain,
    NotContain,
}

impl CompareOperator {
    /// Token used by the condition DSL
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::GreaterThan => ">",
            Self::LessThan => "<",
            Self::GreaterThanOrEqual => ">=",
            Self::LessThanOrEqual => "<=",
            Self::Empty => "empty",
            Self::NotEmpty => "not_empty",
            Self::Contain => "contains",
            Self::NotContain => "not_contains",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        let op = match symbol {
            "==" => Self::Equal,
            "!=" => Self::NotEqual,
            ">" => Self::GreaterThan,
            "<" => Self::LessThan,
            ">=" => Self::GreaterThanOrEqual,
            "<=" => Self::LessThanOrEqual,
            "empty" => Self::Empty,
            "not_empty" => Self::NotEmpty,
            "contains" => Self::Contain,
            "not_contains" => Self::NotContain,
            _ => return None,
        };
        Some(op)
    }

    /// Unary operators ignore the right operand
    pub fn is_unary(&self) -> bool {
        matches!(self, Self::Empty | Self::NotEmpty)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::GreaterThan | Self::LessThan | Self::GreaterThanOrEqual | Self::LessThanOrEqual
        )
    }

    /// Apply the operator to two resolved operands
    pub fn apply(&self, left: &Value, right: &Value) -> Result<bool, EvaluationError> {
        match self {
            Self::Equal => Ok(values_equal(left, right)),
            Self::NotEqual => Ok(!values_equal(left, right)),
            Self::GreaterThan => self.compare_numbers(left, right, |a, b| a > b),
            Self::LessThan => self.compare_numbers(left, right, |a, b| a < b),
            Self::GreaterThanOrEqual => self.compare_numbers(left, right, |a, b| a >= b),
            Self::LessThanOrEqual => self.compare_numbers(left, right, |a, b| a <= b),
            Self::Empty => Ok(is_empty(left)),
            Self::NotEmpty => Ok(!is_empty(left)),
            Self::Contain => self.contains(left, right),
            Self::NotContain => self.contains(left, right).map(|found| !found),
        }
    }

    fn compare_numbers<F>(&self, left: &Value, right: &Value, f: F) -> Result<bool, EvaluationError>
    where
        F: Fn(f64, f64) -> bool,
    {
        let a = self.coerce_number(left)?;
        let b = self.coerce_number(right)?;
        Ok(f(a, b))
    }

    fn coerce_number(&self, value: &Value) -> Result<f64, EvaluationError> {
        let number = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };

        number.ok_or_else(|| EvaluationError::NonNumericOperand {
            operator: self.symbol().to_string(),
            value: value.to_string(),
        })
    }

    fn contains(&self, container: &Value, needle: &Value) -> Result<bool, EvaluationError> {
        match (container, needle) {
            (Value::String(haystack), Value::String(s)) => Ok(haystack.contains(s.as_str())),
            (Value::String(haystack), Value::Number(_) | Value::Bool(_)) => {
                Ok(haystack.contains(&stringify(needle)))
            }
            (Value::Array(items), _) => Ok(items.iter().any(|item| values_equal(item, needle))),
            (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
            _ => Err(EvaluationError::IncompatibleOperands {
                operator: self.symbol().to_string(),
                left_type: ValueKind::of(container).to_string(),
                right_type: ValueKind::of(needle).to_string(),
            }),
        }
    }
}

/// Native equality, except that numbers compare by value (`1 == 1.0`)
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(arr) => arr.is_empty(),
        Value::Object(obj) => obj.is_empty(),
        _ => false,
    }
}

/// Boolean combinator of an inner tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicOperator {
    And,
    Or,
}

impl LogicOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

/// Recursive AND/OR tree over comparisons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionTree {
    Logic {
        op: LogicOperator,
        children: Vec<ConditionTree>,
    },
    Compare {
        left: ExpressionValue,
        operator: CompareOperator,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        right: Option<ExpressionValue>,
    },
}

impl ConditionTree {
    pub fn compare(left: ExpressionValue, operator: CompareOperator, right: ExpressionValue) -> Self {
        Self::Compare {
            left,
            operator,
            right: Some(right),
        }
    }

    pub fn unary(left: ExpressionValue, operator: CompareOperator) -> Self {
        Self::Compare {
            left,
            operator,
            right: None,
        }
    }

    pub fn and(children: Vec<ConditionTree>) -> Self {
        Self::Logic {
            op: LogicOperator::And,
            children,
        }
    }

    pub fn or(children: Vec<ConditionTree>) -> Self {
        Self::Logic {
            op: LogicOperator::Or,
            children,
        }
    }

    /// Number of nested logic levels; a bare comparison has depth 0
    pub fn depth(&self) -> usize {
        match self {
            Self::Compare { .. } => 0,
            Self::Logic { children, .. } => {
                1 + children.iter().map(|c| c.depth()).max().unwrap_or(0)
            }
        }
    }

    /// Comparisons whose operand count does not fit their operator: a
    /// binary operator with no right side, or a unary one with a right side
    pub fn misplaced_operands(&self) -> Vec<CompareOperator> {
        match self {
            Self::Compare {
                operator, right, ..
            } => {
                if operator.is_unary() == right.is_none() {
                    Vec::new()
                } else {
                    vec![*operator]
                }
            }
            Self::Logic { children, .. } => children
                .iter()
                .flat_map(|c| c.misplaced_operands())
                .collect(),
        }
    }

    /// Every expression in the tree, left to right
    pub fn expressions(&self) -> Vec<&ExpressionValue> {
        match self {
            Self::Compare { left, right, .. } => {
                std::iter::once(left).chain(right.iter()).collect()
            }
            Self::Logic { children, .. } => children.iter().flat_map(|c| c.expressions()).collect(),
        }
    }

    /// Evaluate against the context
    ///
    /// AND stops at the first false child and OR at the first true one.
    /// Errors from any evaluated child propagate immediately.
    pub fn evaluate(&self, ctx: &ExecutionContext) -> Result<bool, EvaluationError> {
        match self {
            Self::Compare {
                left,
                operator,
                right,
            } => {
                let left = left.resolve(ctx)?;
                if operator.is_unary() {
                    return operator.apply(&left, &Value::Null);
                }
                let right = match right {
                    Some(right) => right.resolve(ctx)?,
                    None => Value::Null,
                };
                operator.apply(&left, &right)
            }
            Self::Logic {
                op: LogicOperator::And,
                children,
            } => {
                for child in children {
                    if !child.evaluate(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Logic {
                op: LogicOperator::Or,
                children,
            } => {
                for child in children {
                    if child.evaluate(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow::error::ResolutionError;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(json!({}));
        ctx.record_output(
            "http",
            json!({"status": "SUCCESS", "code": 200, "text": "150", "items": ["a", "b"], "meta": {"k": 1}}),
        );
        ctx
    }

    fn path(p: &str) -> ExpressionValue {
        ExpressionValue::reference(p)
    }

    fn lit(v: Value) -> ExpressionValue {
        ExpressionValue::constant(v)
    }

    #[test]
    fn test_equality() {
        let tree = ConditionTree::compare(path("http.status"), CompareOperator::Equal, lit(json!("SUCCESS")));
        assert!(tree.evaluate(&ctx()).unwrap());

        let tree = ConditionTree::compare(path("http.code"), CompareOperator::NotEqual, lit(json!(200.0)));
        assert!(!tree.evaluate(&ctx()).unwrap());
    }

    #[test]
    fn test_numeric_comparison_coerces_strings() {
        let tree = ConditionTree::compare(path("http.text"), CompareOperator::GreaterThan, lit(json!(100)));
        assert!(tree.evaluate(&ctx()).unwrap());

        let tree = ConditionTree::compare(path("http.code"), CompareOperator::LessThanOrEqual, lit(json!("200")));
        assert!(tree.evaluate(&ctx()).unwrap());
    }

    #[test]
    fn test_numeric_comparison_rejects_non_numbers() {
        let tree = ConditionTree::compare(path("http.status"), CompareOperator::GreaterThan, lit(json!(1)));
        let err = tree.evaluate(&ctx()).unwrap_err();
        assert!(matches!(err, EvaluationError::NonNumericOperand { .. }));
    }

    #[test]
    fn test_empty_ignores_right_operand() {
        let tree = ConditionTree::Compare {
            left: path("http.items"),
            operator: CompareOperator::NotEmpty,
            right: Some(path("missing.field")),
        };
        assert!(tree.evaluate(&ctx()).unwrap());

        let tree = ConditionTree::unary(lit(json!("")), CompareOperator::Empty);
        assert!(tree.evaluate(&ctx()).unwrap());
    }

    #[test]
    fn test_contains() {
        let tree = ConditionTree::compare(path("http.items"), CompareOperator::Contain, lit(json!("b")));
        assert!(tree.evaluate(&ctx()).unwrap());

        let tree = ConditionTree::compare(path("http.status"), CompareOperator::NotContain, lit(json!("FAIL")));
        assert!(tree.evaluate(&ctx()).unwrap());

        let tree = ConditionTree::compare(path("http.meta"), CompareOperator::Contain, lit(json!("k")));
        assert!(tree.evaluate(&ctx()).unwrap());

        let tree = ConditionTree::compare(path("http.code"), CompareOperator::Contain, lit(json!("2")));
        assert!(matches!(
            tree.evaluate(&ctx()).unwrap_err(),
            EvaluationError::IncompatibleOperands { .. }
        ));
    }

    #[test]
    fn test_and_short_circuits() {
        let falsy = ConditionTree::compare(lit(json!(1)), CompareOperator::Equal, lit(json!(2)));
        let failing = ConditionTree::compare(path("ghost.field"), CompareOperator::Equal, lit(json!(1)));

        let tree = ConditionTree::and(vec![falsy.clone(), failing.clone()]);
        assert!(!tree.evaluate(&ctx()).unwrap());

        let tree = ConditionTree::and(vec![failing, falsy]);
        assert_eq!(
            tree.evaluate(&ctx()).unwrap_err(),
            EvaluationError::Resolution(ResolutionError::field_not_found("ghost.field"))
        );
    }

    #[test]
    fn test_or_short_circuits() {
        let truthy = ConditionTree::compare(lit(json!(1)), CompareOperator::Equal, lit(json!(1)));
        let failing = ConditionTree::compare(path("ghost.field"), CompareOperator::Equal, lit(json!(1)));

        let tree = ConditionTree::or(vec![truthy, failing.clone()]);
        assert!(tree.evaluate(&ctx()).unwrap());

        let tree = ConditionTree::or(vec![failing]);
        assert!(tree.evaluate(&ctx()).is_err());
    }

    #[test]
    fn test_depth() {
        let leaf = ConditionTree::unary(lit(json!(null)), CompareOperator::Empty);
        assert_eq!(leaf.depth(), 0);

        let tree = ConditionTree::and(vec![
            leaf.clone(),
            ConditionTree::or(vec![ConditionTree::and(vec![leaf.clone()])]),
        ]);
        assert_eq!(tree.depth(), 3);
        assert_eq!(tree.expressions().len(), 2);
    }

    #[test]
    fn test_misplaced_operands() {
        let tree = ConditionTree::or(vec![
            ConditionTree::compare(path("a"), CompareOperator::Equal, lit(json!(1))),
            ConditionTree::unary(path("b"), CompareOperator::NotEmpty),
            ConditionTree::Compare {
                left: path("c"),
                operator: CompareOperator::GreaterThan,
                right: None,
            },
            ConditionTree::and(vec![ConditionTree::Compare {
                left: path("d"),
                operator: CompareOperator::Empty,
                right: Some(lit(json!(0))),
            }]),
        ]);

        assert_eq!(
            tree.misplaced_operands(),
            vec![CompareOperator::GreaterThan, CompareOperator::Empty]
        );
    }

    #[test]
    fn test_serialization() {
        let tree = ConditionTree::and(vec![ConditionTree::compare(
            path("http.status"),
            CompareOperator::Equal,
            lit(json!("SUCCESS")),
        )]);

        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(json["type"], "logic");
        assert_eq!(json["op"], "AND");
        assert_eq!(json["children"][0]["operator"], "EQUAL");

        let parsed: ConditionTree = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, tree);
    }
}
