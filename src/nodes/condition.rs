//! CONDITION node - compare a named variable and pick the `true`/`false` branch.

use serde_json::Value;

use super::template::value_to_string;
use super::types::{NodeContext, Outcome};
use crate::workflow::{ConditionData, Handle};

/// Comparison operators accepted in condition expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Equals,
    NotEquals,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Operator {
    fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "==" | "=" | "equals" => Operator::Equals,
            "!=" | "not_equals" => Operator::NotEquals,
            ">" | "gt" => Operator::Gt,
            ">=" | "gte" => Operator::Gte,
            "<" | "lt" => Operator::Lt,
            "<=" | "lte" => Operator::Lte,
            _ => return None,
        })
    }
}

/// A parsed `<variable> <op> [literal]` expression.
#[derive(Debug)]
struct Expression {
    variable: String,
    operator: Operator,
    literal: Option<Value>,
}

fn parse_expression(condition: &str) -> Result<Expression, String> {
    let mut parts = condition.split_whitespace();
    let variable = parts
        .next()
        .ok_or_else(|| "condition expression is empty".to_string())?;
    let op_token = parts
        .next()
        .ok_or_else(|| format!("condition '{}' has no operator", condition))?;
    let operator = Operator::parse(op_token)
        .ok_or_else(|| format!("unsupported operator '{}' in condition '{}'", op_token, condition))?;

    let rest = parts.collect::<Vec<_>>().join(" ");
    let literal = if rest.is_empty() {
        None
    } else {
        Some(parse_literal(&rest))
    };

    let variable = variable.strip_prefix("variables.").unwrap_or(variable);
    Ok(Expression {
        variable: variable.to_string(),
        operator,
        literal,
    })
}

/// Literals are JSON when they parse as JSON, otherwise bare strings.
fn parse_literal(raw: &str) -> Value {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return value;
    }
    let unquoted = raw
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(raw);
    Value::String(unquoted.to_string())
}

/// Evaluate a CONDITION node.
///
/// Never defaults to a branch: anything that cannot be decided is a `Fail`.
pub fn execute(data: &ConditionData, ctx: &NodeContext) -> Outcome {
    match evaluate(data, ctx) {
        Ok(result) => Outcome::Advance(Some(Handle::from(result))),
        Err(reason) => Outcome::Fail(reason),
    }
}

fn evaluate(data: &ConditionData, ctx: &NodeContext) -> Result<bool, String> {
    let expr = parse_expression(&data.condition)?;
    let right = expr
        .literal
        .as_ref()
        .or(data.value.as_ref())
        .ok_or_else(|| format!("condition '{}' has no comparison value", data.condition))?;
    let left = ctx
        .get_variable(&expr.variable)
        .ok_or_else(|| format!("variable '{}' is not set", expr.variable))?;

    let compare: fn(f64, f64) -> bool = match expr.operator {
        Operator::Equals => return Ok(loose_equals(left, right)),
        Operator::NotEquals => return Ok(!loose_equals(left, right)),
        Operator::Gt => |l, r| l > r,
        Operator::Gte => |l, r| l >= r,
        Operator::Lt => |l, r| l < r,
        Operator::Lte => |l, r| l <= r,
    };

    let l = as_f64(left)
        .ok_or_else(|| format!("variable '{}' is not numeric: {}", expr.variable, left))?;
    let r = as_f64(right).ok_or_else(|| format!("comparison value is not numeric: {}", right))?;
    Ok(compare(l, r))
}

/// Numbers compare numerically (`"10" == 10`), strings by text, the rest structurally.
fn loose_equals(left: &Value, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (as_f64(left), as_f64(right)) {
        return l == r;
    }
    if left.is_string() || right.is_string() {
        return value_to_string(left) == value_to_string(right);
    }
    left == right
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn ctx(vars: Value) -> NodeContext {
        NodeContext::new("wf", "lead-1", Utc::now())
            .with_variables(vars.as_object().cloned().unwrap_or_default())
    }

    fn cond(condition: &str, value: Option<Value>) -> ConditionData {
        ConditionData {
            condition: condition.to_string(),
            value,
            ..Default::default()
        }
    }

    #[test]
    fn test_score_threshold_branches() {
        let data = cond("variables.score >", Some(json!(10)));
        assert_eq!(
            execute(&data, &ctx(json!({"score": 15}))),
            Outcome::Advance(Some(Handle::True))
        );
        assert_eq!(
            execute(&data, &ctx(json!({"score": 5}))),
            Outcome::Advance(Some(Handle::False))
        );
    }

    #[test]
    fn test_missing_variable_fails() {
        let data = cond("score > 10", None);
        match execute(&data, &ctx(json!({}))) {
            Outcome::Fail(reason) => assert!(reason.contains("score")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_inline_literal_wins_over_value() {
        let data = cond("plan == 'pro'", Some(json!("free")));
        assert_eq!(
            execute(&data, &ctx(json!({"plan": "pro"}))),
            Outcome::Advance(Some(Handle::True))
        );
    }

    #[test]
    fn test_word_operators_and_nested_paths() {
        let data = cond("lead.size gte 100", None);
        assert_eq!(
            execute(&data, &ctx(json!({"lead": {"size": "100"}}))),
            Outcome::Advance(Some(Handle::True))
        );

        let data = cond("status not_equals", Some(json!("churned")));
        assert_eq!(
            execute(&data, &ctx(json!({"status": "active"}))),
            Outcome::Advance(Some(Handle::True))
        );
    }

    #[test]
    fn test_numeric_string_equality() {
        let data = cond("visits == 3", None);
        assert_eq!(
            execute(&data, &ctx(json!({"visits": "3"}))),
            Outcome::Advance(Some(Handle::True))
        );
    }

    #[test]
    fn test_unparseable_conditions_fail() {
        let vars = json!({"score": 1, "name": "Ada"});
        for (expr, value) in [
            ("", Some(json!(1))),
            ("score", Some(json!(1))),
            ("score ~= 1", None),
            ("score >", None),
            ("name > 3", None),
        ] {
            assert!(
                matches!(execute(&cond(expr, value), &ctx(vars.clone())), Outcome::Fail(_)),
                "expected '{}' to fail",
                expr
            );
        }
    }
}
