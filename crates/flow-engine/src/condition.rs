//! Condition trees and their evaluation.
//!
//! A condition is either a simple expression (`${inputs.count} >= 3`), a
//! boolean literal, or a quantifier (`all`, `any`, `none`) over an ordered
//! list of child conditions which may themselves be quantifiers.
//!
//! Quantifiers evaluate children lazily and short-circuit. A quantifier with
//! no children is an authoring error and is never given a default value.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

use crate::resolver::{display_value, ResolveError, Resolver};

/// Errors raised while validating or evaluating a condition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionError {
    /// A quantifier has no children
    #[error("Quantifier '{quantifier}' at {path} has no conditions")]
    EmptyQuantifier { quantifier: Quantifier, path: String },

    /// A simple expression could not be parsed
    #[error("Invalid condition expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    /// A reference inside the expression failed for a reason other than absence
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Boolean combinator applied to a list of conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantifier {
    /// True when every child is true.
    All,
    /// True when at least one child is true.
    Any,
    /// True when no child is true.
    None,
}

impl fmt::Display for Quantifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Quantifier::All => "all",
            Quantifier::Any => "any",
            Quantifier::None => "none",
        };
        f.write_str(name)
    }
}

/// A quantifier together with its ordered children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantifierNode {
    pub quantifier: Quantifier,
    #[serde(default)]
    pub conditions: Vec<ConditionNode>,
}

/// A node of a condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionNode {
    /// A constant.
    Literal(bool),
    /// A single comparison or truthiness test.
    Simple(String),
    /// A quantifier over child conditions.
    Quantifier(QuantifierNode),
}

impl ConditionNode {
    pub fn simple(expression: impl Into<String>) -> Self {
        Self::Simple(expression.into())
    }

    pub fn all(conditions: Vec<ConditionNode>) -> Self {
        Self::quantified(Quantifier::All, conditions)
    }

    pub fn any(conditions: Vec<ConditionNode>) -> Self {
        Self::quantified(Quantifier::Any, conditions)
    }

    pub fn none(conditions: Vec<ConditionNode>) -> Self {
        Self::quantified(Quantifier::None, conditions)
    }

    fn quantified(quantifier: Quantifier, conditions: Vec<ConditionNode>) -> Self {
        Self::Quantifier(QuantifierNode {
            quantifier,
            conditions,
        })
    }

    /// Quantifier nesting depth. Simple conditions and literals have depth 0.
    pub fn depth(&self) -> usize {
        match self {
            Self::Literal(_) | Self::Simple(_) => 0,
            Self::Quantifier(q) => 1 + q.conditions.iter().map(|c| c.depth()).max().unwrap_or(0),
        }
    }

    /// Every simple expression in the tree, in evaluation order.
    pub fn expressions(&self) -> Vec<&str> {
        match self {
            Self::Literal(_) => Vec::new(),
            Self::Simple(expr) => vec![expr.as_str()],
            Self::Quantifier(q) => q.conditions.iter().flat_map(|c| c.expressions()).collect(),
        }
    }

    /// Structural check: every quantifier has children and every expression parses.
    pub fn validate(&self) -> Vec<ConditionError> {
        let mut errors = Vec::new();
        self.validate_at("root", &mut errors);
        errors
    }

    fn validate_at(&self, path: &str, errors: &mut Vec<ConditionError>) {
        match self {
            Self::Literal(_) => {}
            Self::Simple(expr) => {
                if let Err(e) = parse_expression(expr) {
                    errors.push(e);
                }
            }
            Self::Quantifier(q) => {
                if q.conditions.is_empty() {
                    errors.push(ConditionError::EmptyQuantifier {
                        quantifier: q.quantifier,
                        path: path.to_string(),
                    });
                }
                for (i, child) in q.conditions.iter().enumerate() {
                    child.validate_at(&format!("{}.{}", path, i), errors);
                }
            }
        }
    }

    /// Evaluate the tree against the resolver.
    pub fn evaluate(&self, resolver: &Resolver<'_>) -> Result<bool, ConditionError> {
        self.evaluate_at("root", resolver)
    }

    fn evaluate_at(&self, path: &str, resolver: &Resolver<'_>) -> Result<bool, ConditionError> {
        match self {
            Self::Literal(b) => Ok(*b),
            Self::Simple(expr) => evaluate_expression(expr, resolver),
            Self::Quantifier(q) => {
                if q.conditions.is_empty() {
                    return Err(ConditionError::EmptyQuantifier {
                        quantifier: q.quantifier,
                        path: path.to_string(),
                    });
                }
                for (i, child) in q.conditions.iter().enumerate() {
                    let result = child.evaluate_at(&format!("{}.{}", path, i), resolver)?;
                    match (q.quantifier, result) {
                        (Quantifier::All, false) => return Ok(false),
                        (Quantifier::Any, true) => return Ok(true),
                        (Quantifier::None, true) => return Ok(false),
                        _ => {}
                    }
                }
                Ok(!matches!(q.quantifier, Quantifier::Any))
            }
        }
    }
}

/// Comparison operator of a simple expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CompareOp {
    fn token(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Gt => ">",
            CompareOp::Le => "<=",
            CompareOp::Ge => ">=",
        }
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }
}

/// A parsed simple expression: an operand, optionally compared to another.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression<'a> {
    pub left: &'a str,
    pub comparison: Option<(CompareOp, &'a str)>,
}

/// Positions of top-level operators, skipping `${...}` tokens and quotes.
///
/// A lone `=` or `!` outside quotes is returned as `Err` with its byte offset.
fn find_operators(expr: &str) -> Result<Vec<(usize, CompareOp)>, usize> {
    let bytes = expr.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut in_reference = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let next = bytes.get(i + 1).copied();
        if in_reference {
            if c == b'}' {
                in_reference = false;
            }
        } else if let Some(q) = quote {
            if c == q {
                quote = None;
            }
        } else if c == b'$' && next == Some(b'{') {
            in_reference = true;
            i += 1;
        } else if c == b'"' || c == b'\'' {
            quote = Some(c);
        } else {
            let op = match (c, next) {
                (b'=', Some(b'=')) => Some((CompareOp::Eq, 2)),
                (b'!', Some(b'=')) => Some((CompareOp::Ne, 2)),
                (b'<', Some(b'=')) => Some((CompareOp::Le, 2)),
                (b'>', Some(b'=')) => Some((CompareOp::Ge, 2)),
                (b'<', _) => Some((CompareOp::Lt, 1)),
                (b'>', _) => Some((CompareOp::Gt, 1)),
                (b'=' | b'!', _) => return Err(i),
                _ => None,
            };
            if let Some((op, width)) = op {
                found.push((i, op));
                i += width;
                continue;
            }
        }
        i += 1;
    }
    Ok(found)
}

/// Parse a simple expression into at most one comparison.
pub fn parse_expression(expr: &str) -> Result<Expression<'_>, ConditionError> {
    let invalid = |reason: &str| ConditionError::InvalidExpression {
        expression: expr.to_string(),
        reason: reason.to_string(),
    };

    let operators = find_operators(expr).map_err(|pos| {
        invalid(&format!("unsupported operator '{}' at offset {}", &expr[pos..pos + 1], pos))
    })?;
    match operators.as_slice() {
        [] => {
            let left = expr.trim();
            if left.is_empty() {
                return Err(invalid("expression is empty"));
            }
            Ok(Expression {
                left,
                comparison: None,
            })
        }
        [(pos, op)] => {
            let left = expr[..*pos].trim();
            let right = expr[*pos + op.token().len()..].trim();
            if left.is_empty() || right.is_empty() {
                return Err(invalid("comparison is missing an operand"));
            }
            Ok(Expression {
                left,
                comparison: Some((*op, right)),
            })
        }
        _ => Err(invalid("only one comparison operator is allowed")),
    }
}

/// Resolve one operand. `None` means the operand is undefined.
fn resolve_operand(text: &str, resolver: &Resolver<'_>) -> Result<Option<Value>, ConditionError> {
    let quoted = text.len() >= 2
        && ((text.starts_with('"') && text.ends_with('"'))
            || (text.starts_with('\'') && text.ends_with('\'')));

    let resolved = if quoted {
        resolver.interpolate(&text[1..text.len() - 1]).map(Value::String)
    } else if text.contains("${") {
        resolver.resolve(text)
    } else {
        Ok(serde_json::from_str::<Value>(text).unwrap_or_else(|_| Value::String(text.to_string())))
    };

    match resolved {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_missing() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_integer(value: &Value) -> Option<i128> {
    match value {
        Value::Number(n) => n.as_i64().map(i128::from).or_else(|| n.as_u64().map(i128::from)),
        Value::String(s) => s.trim().parse::<i128>().ok(),
        _ => None,
    }
}

/// Order two values: numerically when both parse as numbers, otherwise by
/// their string forms. Integers compare exactly.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    if let (Some(l), Some(r)) = (as_integer(left), as_integer(right)) {
        return l.cmp(&r);
    }
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => l.total_cmp(&r),
        _ => display_value(left).cmp(&display_value(right)),
    }
}

/// Equality with the same coercion rules as `==` in conditions.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    compare_values(left, right) == Ordering::Equal
}

/// Check if a JSON value is "truthy".
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Evaluate a simple expression.
///
/// Comparisons involving an undefined operand are false, so guard clauses
/// over optional fields never raise.
pub fn evaluate_expression(expr: &str, resolver: &Resolver<'_>) -> Result<bool, ConditionError> {
    let parsed = parse_expression(expr)?;
    let left = resolve_operand(parsed.left, resolver)?;

    let Some((op, right_text)) = parsed.comparison else {
        return Ok(left.as_ref().map(is_truthy).unwrap_or(false));
    };
    let right = resolve_operand(right_text, resolver)?;

    match (left, right) {
        (Some(l), Some(r)) => Ok(op.holds(compare_values(&l, &r))),
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{FlowContext, Scope};
    use serde_json::json;
    use std::collections::HashMap;

    fn lit(b: bool) -> ConditionNode {
        ConditionNode::Literal(b)
    }

    fn eval(node: &ConditionNode) -> Result<bool, ConditionError> {
        let ctx = FlowContext::default();
        let scope = Scope::new();
        node.evaluate(&Resolver::new(&ctx, &scope))
    }

    fn eval_expr(expr: &str) -> bool {
        let mut inputs = HashMap::new();
        inputs.insert("count".to_string(), json!(5));
        inputs.insert("name".to_string(), json!("ada"));
        inputs.insert("numeric".to_string(), json!("10"));
        inputs.insert("flag".to_string(), json!(true));
        let ctx = FlowContext::new(inputs);
        let scope = Scope::new();
        evaluate_expression(expr, &Resolver::new(&ctx, &scope)).unwrap()
    }

    #[test]
    fn test_quantifier_truth_table() {
        assert!(eval(&ConditionNode::all(vec![lit(true), lit(true)])).unwrap());
        assert!(!eval(&ConditionNode::all(vec![lit(true), lit(false)])).unwrap());
        assert!(!eval(&ConditionNode::any(vec![lit(false), lit(false)])).unwrap());
        assert!(eval(&ConditionNode::any(vec![lit(false), lit(true)])).unwrap());
        assert!(eval(&ConditionNode::none(vec![lit(false), lit(false)])).unwrap());
        assert!(!eval(&ConditionNode::none(vec![lit(false), lit(true)])).unwrap());
    }

    #[test]
    fn test_nested_quantifiers() {
        // all: [A, any: [B, C]] with A=true, B=false, C=true
        let tree = ConditionNode::all(vec![
            lit(true),
            ConditionNode::any(vec![lit(false), lit(true)]),
        ]);
        assert!(eval(&tree).unwrap());
        assert_eq!(tree.depth(), 2);
    }

    #[test]
    fn test_empty_quantifier_fails() {
        for tree in [
            ConditionNode::all(vec![]),
            ConditionNode::any(vec![]),
            ConditionNode::none(vec![]),
        ] {
            assert!(matches!(eval(&tree), Err(ConditionError::EmptyQuantifier { .. })));
            assert_eq!(tree.validate().len(), 1);
        }
    }

    #[test]
    fn test_empty_quantifier_path_points_at_child() {
        let tree = ConditionNode::any(vec![lit(false), ConditionNode::all(vec![])]);
        match eval(&tree) {
            Err(ConditionError::EmptyQuantifier { quantifier, path }) => {
                assert_eq!(quantifier, Quantifier::All);
                assert_eq!(path, "root.1");
            }
            other => panic!("Expected EmptyQuantifier, got {:?}", other),
        }
    }

    #[test]
    fn test_short_circuit_skips_later_children() {
        // The second child would fail; any() must stop at the first true.
        let tree = ConditionNode::any(vec![lit(true), ConditionNode::all(vec![])]);
        assert!(eval(&tree).unwrap());

        let tree = ConditionNode::all(vec![lit(false), ConditionNode::all(vec![])]);
        assert!(!eval(&tree).unwrap());

        let tree = ConditionNode::none(vec![lit(true), ConditionNode::all(vec![])]);
        assert!(!eval(&tree).unwrap());
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(eval_expr("${inputs.count} > 3"));
        assert!(eval_expr("${inputs.count} >= 5"));
        assert!(!eval_expr("${inputs.count} < 5"));
        assert!(eval_expr("${inputs.count} <= 5"));
        assert!(eval_expr("${inputs.count} == 5.0"));
        assert!(eval_expr("${inputs.numeric} > 9"));
        assert!(eval_expr("${inputs.count} != 4"));
    }

    #[test]
    fn test_string_comparisons() {
        assert!(eval_expr("${inputs.name} == 'ada'"));
        assert!(eval_expr("${inputs.name} == ada"));
        assert!(eval_expr("${inputs.name} != \"bob\""));
        assert!(eval_expr("'hello ${inputs.name}' == 'hello ada'"));
        assert!(eval_expr("${inputs.flag} == true"));
    }

    #[test]
    fn test_undefined_operand_is_false() {
        assert!(!eval_expr("${inputs.missing} == 1"));
        assert!(!eval_expr("${inputs.missing} != 1"));
        assert!(!eval_expr("${nowhere.field} > 0"));
        assert!(!eval_expr("${inputs.missing}"));
    }

    #[test]
    fn test_truthiness_without_operator() {
        assert!(eval_expr("${inputs.flag}"));
        assert!(eval_expr("true"));
        assert!(!eval_expr("false"));
        assert!(!eval_expr("0"));
    }

    #[test]
    fn test_operators_inside_quotes_and_references_ignored() {
        let parsed = parse_expression("'a>b' == ${x}").unwrap();
        assert_eq!(parsed.left, "'a>b'");
        assert_eq!(parsed.comparison, Some((CompareOp::Eq, "${x}")));
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(parse_expression("").is_err());
        assert!(parse_expression("a == ").is_err());
        assert!(parse_expression("a == b == c").is_err());
        assert!(parse_expression("${inputs.x} = 5").is_err());
        assert!(parse_expression("!${flag}").is_err());
        assert!(parse_expression("${a} == '!='").is_ok());
        let tree = ConditionNode::any(vec![ConditionNode::simple("${inputs.x} = 5")]);
        assert_eq!(tree.validate().len(), 1);
        let tree = ConditionNode::all(vec![ConditionNode::simple("> 3")]);
        assert_eq!(tree.validate().len(), 1);
    }

    #[test]
    fn test_values_equal_coercion() {
        assert!(values_equal(&json!(1), &json!("1")));
        assert!(values_equal(&json!("x"), &json!("x")));
        assert!(!values_equal(&json!("x"), &json!("y")));
        assert!(values_equal(&json!(true), &json!("true")));
        assert!(!values_equal(&json!(9007199254740993u64), &json!(9007199254740992u64)));
        assert!(values_equal(&json!(9007199254740993u64), &json!("9007199254740993")));
        assert_eq!(compare_values(&json!(u64::MAX), &json!(-1)), Ordering::Greater);
        assert!(values_equal(&json!(2), &json!(2.0)));
    }

    #[test]
    fn test_is_truthy() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&Value::Bool(false)));
        assert!(is_truthy(&Value::Bool(true)));
        assert!(!is_truthy(&json!(0)));
        assert!(is_truthy(&json!(1)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!("hello")));
        assert!(!is_truthy(&json!("false")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!([null])));
    }

    #[test]
    fn test_deserialize_tree() {
        let tree: ConditionNode = serde_json::from_value(json!({
            "quantifier": "all",
            "conditions": [
                "${inputs.count} > 1",
                true,
                {"quantifier": "none", "conditions": ["${inputs.flag}"]}
            ]
        }))
        .unwrap();
        assert_eq!(tree.depth(), 2);
        assert_eq!(tree.expressions(), vec!["${inputs.count} > 1", "${inputs.flag}"]);
    }
}
