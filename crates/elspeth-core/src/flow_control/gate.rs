//! Config gate executor. Evaluates a whitelisted expression
//! against the incoming token and resolves a `GateAction` from the
//! user-declared route table.

use elspeth_domain::RowData;
use elspeth_expr::Expr;

use crate::errors::{ConfigurationError, CoreError};
use crate::graph::{GateAction, GateSpec};

pub struct GateDecision {
    /// The edge label the graph was wired under for this decision:
    /// the matched route's key, or `"__default__"` when no route key
    /// matched the expression result.
    pub wire_label: String,
    pub action: GateAction,
    /// The raw, unstringified expression result, recorded on the
    /// routing event as `ConfigGateReason::expression_result`.
    pub expression_result: String,
}

pub struct GateExecutor {
    pub node_id: String,
    expr: Expr,
    spec: GateSpec,
}

impl GateExecutor {
    pub fn new(node_id: impl Into<String>, spec: GateSpec) -> Result<Self, ConfigurationError> {
        let node_id = node_id.into();
        let expr = elspeth_expr::parse(&spec.expression)
            .map_err(|e| ConfigurationError::single(node_id.clone(), format!("gate expression: {e}")))?;
        Ok(Self { node_id, expr, spec })
    }

    pub fn evaluate(&self, row: &RowData) -> Result<GateDecision, CoreError> {
        let result = elspeth_expr::evaluate(&self.expr, row).map_err(|e| CoreError::ExpressionEvaluation(e.to_string()))?;
        let label = result.to_route_label();
        match self.spec.routes.get(&label) {
            Some(action) => Ok(GateDecision {
                wire_label: label.clone(),
                action: action.clone(),
                expression_result: label,
            }),
            None => Ok(GateDecision {
                wire_label: "__default__".to_string(),
                action: self.spec.default.clone(),
                expression_result: label,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GateAction;
    use elspeth_domain::{SchemaContract, SchemaMode};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn row_with_amount(amount: i64) -> RowData {
        let mut fields = serde_json::Map::new();
        fields.insert("amount".into(), serde_json::json!(amount));
        RowData::new(Arc::new(SchemaContract::builder(SchemaMode::Observed).build()), fields)
    }

    #[test]
    fn routes_on_exact_match_and_falls_to_default() {
        let mut routes = HashMap::new();
        routes.insert("true".to_string(), GateAction::RouteTo("high_sink".to_string()));
        let spec = GateSpec {
            name: "amount_gate".into(),
            config: serde_json::json!({}),
            expression: "row['amount'] > 1000".into(),
            routes,
            default: GateAction::Continue,
        };
        let gate = GateExecutor::new("gate_1", spec).unwrap();

        let high = gate.evaluate(&row_with_amount(1500)).unwrap();
        assert_eq!(high.wire_label, "true");
        assert!(matches!(high.action, GateAction::RouteTo(ref s) if s == "high_sink"));

        let low = gate.evaluate(&row_with_amount(500)).unwrap();
        assert_eq!(low.wire_label, "__default__");
        assert!(matches!(low.action, GateAction::Continue));
    }
}
