//! Evaluates a parsed `Expr` against a row.
//!
//! `row['f']` raises `EvaluationError` on a missing key; `row.get('f')`
//! yields `null` instead — the two field-access forms share an AST node
//! at parse time but diverge here, giving expression authors an escape
//! hatch from the strict form.

use serde_json::Value;

use crate::ast::{BinOp, BoolOp, Expr};
use crate::error::ExprError;
use elspeth_domain::RowData;

/// Result of evaluating an expression: used both for gate routing and
/// for aggregation trigger conditions.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalResult {
    Bool(bool),
    Num(f64),
    Str(String),
    Null,
    List(Vec<EvalResult>),
}

impl EvalResult {
    /// Result conversion rule: boolean -> "true"/"false", string
    /// used as-is, anything else stringified.
    pub fn to_route_label(&self) -> String {
        match self {
            EvalResult::Bool(b) => b.to_string(),
            EvalResult::Str(s) => s.clone(),
            EvalResult::Num(n) => format_num(*n),
            EvalResult::Null => "null".to_string(),
            EvalResult::List(items) => {
                let rendered: Vec<String> = items.iter().map(|i| i.to_route_label()).collect();
                format!("[{}]", rendered.join(","))
            }
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            EvalResult::Bool(b) => *b,
            EvalResult::Num(n) => *n != 0.0,
            EvalResult::Str(s) => !s.is_empty(),
            EvalResult::Null => false,
            EvalResult::List(items) => !items.is_empty(),
        }
    }
}

fn format_num(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn value_to_result(v: &Value) -> EvalResult {
    match v {
        Value::Null => EvalResult::Null,
        Value::Bool(b) => EvalResult::Bool(*b),
        Value::Number(n) => EvalResult::Num(n.as_f64().unwrap_or(0.0)),
        Value::String(s) => EvalResult::Str(s.clone()),
        Value::Array(items) => EvalResult::List(items.iter().map(value_to_result).collect()),
        Value::Object(_) => EvalResult::Str(v.to_string()),
    }
}

fn as_num(r: &EvalResult) -> Result<f64, ExprError> {
    match r {
        EvalResult::Num(n) => Ok(*n),
        other => Err(ExprError::Evaluation(format!("expected number, found {other:?}"))),
    }
}

/// Evaluates `expr` against `row`. Field access resolves through
/// `row.fields`; everything else is pure over the AST.
pub fn evaluate(expr: &Expr, row: &RowData) -> Result<EvalResult, ExprError> {
    match expr {
        Expr::Num(n) => Ok(EvalResult::Num(*n)),
        Expr::Str(s) => Ok(EvalResult::Str(s.clone())),
        Expr::Bool(b) => Ok(EvalResult::Bool(*b)),
        Expr::Null => Ok(EvalResult::Null),
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(evaluate(item, row)?);
            }
            Ok(EvalResult::List(out))
        }
        Expr::FieldIndex(name) => row
            .fields
            .get(name)
            .map(value_to_result)
            .ok_or_else(|| ExprError::Evaluation(format!("row['{name}'] missing"))),
        Expr::FieldGet(name) => Ok(row.fields.get(name).map(value_to_result).unwrap_or(EvalResult::Null)),
        Expr::Not(inner) => Ok(EvalResult::Bool(!evaluate(inner, row)?.truthy())),
        Expr::Neg(inner) => Ok(EvalResult::Num(-as_num(&evaluate(inner, row)?)?)),
        Expr::BoolOp(lhs, op, rhs) => {
            let l = evaluate(lhs, row)?;
            match op {
                BoolOp::And => {
                    if !l.truthy() {
                        Ok(l)
                    } else {
                        evaluate(rhs, row)
                    }
                }
                BoolOp::Or => {
                    if l.truthy() {
                        Ok(l)
                    } else {
                        evaluate(rhs, row)
                    }
                }
            }
        }
        Expr::In(needle, haystack) => {
            let needle = evaluate(needle, row)?;
            let haystack = evaluate(haystack, row)?;
            match haystack {
                EvalResult::List(items) => Ok(EvalResult::Bool(items.contains(&needle))),
                EvalResult::Str(s) => match needle {
                    EvalResult::Str(n) => Ok(EvalResult::Bool(s.contains(&n))),
                    other => Err(ExprError::Evaluation(format!("cannot test membership of {other:?} in a string"))),
                },
                other => Err(ExprError::Evaluation(format!("right side of 'in' must be a list or string, found {other:?}"))),
            }
        }
        Expr::Ternary { body, cond, orelse } => {
            if evaluate(cond, row)?.truthy() {
                evaluate(body, row)
            } else {
                evaluate(orelse, row)
            }
        }
        Expr::BinOp(lhs, op, rhs) => eval_binop(lhs, *op, rhs, row),
    }
}

fn eval_binop(lhs: &Expr, op: BinOp, rhs: &Expr, row: &RowData) -> Result<EvalResult, ExprError> {
    let l = evaluate(lhs, row)?;
    let r = evaluate(rhs, row)?;
    match op {
        BinOp::Eq => return Ok(EvalResult::Bool(l == r)),
        BinOp::Ne => return Ok(EvalResult::Bool(l != r)),
        _ => {}
    }
    match op {
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = compare(&l, &r)?;
            let b = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                BinOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(EvalResult::Bool(b))
        }
        BinOp::Add => match (&l, &r) {
            (EvalResult::Str(a), EvalResult::Str(b)) => Ok(EvalResult::Str(format!("{a}{b}"))),
            _ => Ok(EvalResult::Num(as_num(&l)? + as_num(&r)?)),
        },
        BinOp::Sub => Ok(EvalResult::Num(as_num(&l)? - as_num(&r)?)),
        BinOp::Mul => Ok(EvalResult::Num(as_num(&l)? * as_num(&r)?)),
        BinOp::Div => {
            let (a, b) = (as_num(&l)?, as_num(&r)?);
            if b == 0.0 {
                return Err(ExprError::Evaluation("division by zero".to_string()));
            }
            Ok(EvalResult::Num(a / b))
        }
        BinOp::FloorDiv => {
            let (a, b) = (as_num(&l)?, as_num(&r)?);
            if b == 0.0 {
                return Err(ExprError::Evaluation("division by zero".to_string()));
            }
            Ok(EvalResult::Num((a / b).floor()))
        }
        BinOp::Mod => {
            let (a, b) = (as_num(&l)?, as_num(&r)?);
            if b == 0.0 {
                return Err(ExprError::Evaluation("modulo by zero".to_string()));
            }
            Ok(EvalResult::Num(a.rem_euclid(b)))
        }
        BinOp::Eq | BinOp::Ne => unreachable!(),
    }
}

fn compare(l: &EvalResult, r: &EvalResult) -> Result<std::cmp::Ordering, ExprError> {
    match (l, r) {
        (EvalResult::Num(a), EvalResult::Num(b)) => {
            a.partial_cmp(b).ok_or_else(|| ExprError::Evaluation("NaN is not orderable".to_string()))
        }
        (EvalResult::Str(a), EvalResult::Str(b)) => Ok(a.cmp(b)),
        _ => Err(ExprError::Evaluation(format!("cannot compare {l:?} with {r:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elspeth_domain::{SchemaContract, SchemaMode};
    use serde_json::json;
    use std::sync::Arc;

    fn row(fields: serde_json::Map<String, Value>) -> RowData {
        let contract = Arc::new(SchemaContract::builder(SchemaMode::Observed).build());
        RowData::new(contract, fields)
    }

    #[test]
    fn gate_condition_true_false_routes() {
        let mut fields = serde_json::Map::new();
        fields.insert("amount".into(), json!(1500));
        let r = row(fields);
        let expr = crate::parse("row['amount'] > 1000").unwrap();
        let result = evaluate(&expr, &r).unwrap();
        assert_eq!(result.to_route_label(), "true");
    }

    #[test]
    fn missing_index_access_is_evaluation_error() {
        let r = row(serde_json::Map::new());
        let expr = crate::parse("row['missing']").unwrap();
        assert!(matches!(evaluate(&expr, &r), Err(ExprError::Evaluation(_))));
    }

    #[test]
    fn missing_get_access_yields_null() {
        let r = row(serde_json::Map::new());
        let expr = crate::parse("row.get('missing')").unwrap();
        assert_eq!(evaluate(&expr, &r).unwrap(), EvalResult::Null);
    }

    #[test]
    fn ternary_selects_branch() {
        let mut fields = serde_json::Map::new();
        fields.insert("amount".into(), json!(3000));
        let r = row(fields);
        let expr = crate::parse("'high' if row['amount'] > 1000 else 'low'").unwrap();
        assert_eq!(evaluate(&expr, &r).unwrap().to_route_label(), "high");
    }
}
