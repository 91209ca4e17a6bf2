//! Aggregation executor. Holds the per-aggregation buffer and
//! decides when a batch's trigger fires. The buffer's member list is
//! kept ordered by source `sequence_number` via insertion sort so batch
//! membership stays source-ordered regardless of which worker thread's
//! row arrives first.

use std::sync::Mutex;
use std::time::Instant;

use elspeth_domain::RowData;
use elspeth_expr::Expr;
use uuid::Uuid;

use crate::errors::ConfigurationError;
use crate::graph::{AggregationOutputMode, AggregationSettings, AggregationSpec, AggregationTrigger};
use crate::model::Token;

struct Member {
    seq: u64,
    token: Token,
}

struct OpenBatch {
    batch_id: Uuid,
    members: Vec<Member>,
    opened_at: Instant,
}

impl OpenBatch {
    fn new() -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            members: Vec::new(),
            opened_at: Instant::now(),
        }
    }
}

/// Result of offering a token to an `AggregationExecutor`.
pub enum AggregationFlush {
    /// The token is buffered; the batch has not triggered yet. Carries
    /// the open batch's id so callers can record a `Buffered` outcome
    /// against the batch it actually landed in.
    Held { batch_id: Uuid },
    /// The trigger fired. Carries every buffered token in source order,
    /// oldest first, paired with its own source sequence number so a
    /// `passthrough` flush can release each member at its original
    /// position rather than at the triggering row's.
    Flushed {
        batch_id: Uuid,
        tokens: Vec<(u64, Token)>,
        trigger: &'static str,
    },
}

impl AggregationFlush {
    /// The highest source sequence number among a flush's members —
    /// the release-order key for brand-new tokens a `transform`-mode
    /// flush creates, since they cannot complete before the last row
    /// that fed them has itself arrived.
    pub fn max_seq(tokens: &[(u64, Token)]) -> u64 {
        tokens.iter().map(|(seq, _)| *seq).max().unwrap_or(0)
    }
}

pub struct AggregationExecutor {
    pub node_id: String,
    settings: AggregationSettings,
    condition_expr: Option<Expr>,
    state: Mutex<OpenBatch>,
}

impl AggregationExecutor {
    pub fn new(node_id: impl Into<String>, spec: &AggregationSpec) -> Result<Self, ConfigurationError> {
        let node_id = node_id.into();
        let mut condition_expr = None;
        for trigger in &spec.settings.triggers {
            if let AggregationTrigger::Condition(expr_src) = trigger {
                let expr = elspeth_expr::parse(expr_src)
                    .map_err(|e| ConfigurationError::single(node_id.clone(), format!("aggregation trigger: {e}")))?;
                condition_expr = Some(expr);
            }
        }
        Ok(Self {
            node_id,
            settings: spec.settings.clone(),
            condition_expr,
            state: Mutex::new(OpenBatch::new()),
        })
    }

    pub fn output_mode(&self) -> AggregationOutputMode {
        self.settings.output_mode
    }

    pub fn expected_output_count(&self) -> Option<usize> {
        self.settings.expected_output_count
    }

    /// Offers a token (with its source sequence number) to the buffer.
    /// Checked against every trigger in declared order; the first to
    /// fire wins.
    pub fn accept(&self, seq: u64, token: Token, row_for_condition: &RowData) -> AggregationFlush {
        let mut batch = self.state.lock().expect("aggregation lock poisoned");
        let pos = batch.members.partition_point(|m| m.seq < seq);
        batch.members.insert(pos, Member { seq, token });

        if let Some(trigger) = self.first_fired_trigger(&batch, row_for_condition) {
            let finished = std::mem::replace(&mut *batch, OpenBatch::new());
            return AggregationFlush::Flushed {
                batch_id: finished.batch_id,
                tokens: finished.members.into_iter().map(|m| (m.seq, m.token)).collect(),
                trigger,
            };
        }
        AggregationFlush::Held { batch_id: batch.batch_id }
    }

    /// Called at end-of-source: flushes whatever is buffered, even if
    /// no trigger has fired (the `end_of_source` trigger always wins
    /// once the source is exhausted). Returns `None` if nothing is
    /// buffered.
    pub fn flush_end_of_source(&self) -> Option<AggregationFlush> {
        let mut batch = self.state.lock().expect("aggregation lock poisoned");
        if batch.members.is_empty() {
            return None;
        }
        let finished = std::mem::replace(&mut *batch, OpenBatch::new());
        Some(AggregationFlush::Flushed {
            batch_id: finished.batch_id,
            tokens: finished.members.into_iter().map(|m| (m.seq, m.token)).collect(),
            trigger: "end_of_source",
        })
    }

    /// Manual trigger: forces a flush regardless of buffer state. Used
    /// by `AggregationTrigger::Manual` when an external caller signals
    /// it (out of scope for the execution core itself to invoke).
    pub fn flush_manual(&self) -> Option<AggregationFlush> {
        self.flush_end_of_source_like("manual")
    }

    fn flush_end_of_source_like(&self, trigger: &'static str) -> Option<AggregationFlush> {
        let mut batch = self.state.lock().expect("aggregation lock poisoned");
        if batch.members.is_empty() {
            return None;
        }
        let finished = std::mem::replace(&mut *batch, OpenBatch::new());
        Some(AggregationFlush::Flushed {
            batch_id: finished.batch_id,
            tokens: finished.members.into_iter().map(|m| (m.seq, m.token)).collect(),
            trigger,
        })
    }

    fn first_fired_trigger(&self, batch: &OpenBatch, row_for_condition: &RowData) -> Option<&'static str> {
        for trigger in &self.settings.triggers {
            match trigger {
                AggregationTrigger::Count(n) => {
                    if batch.members.len() >= *n {
                        return Some("count");
                    }
                }
                AggregationTrigger::Elapsed(d) => {
                    if batch.opened_at.elapsed() >= *d {
                        return Some("elapsed");
                    }
                }
                AggregationTrigger::Condition(_) => {
                    if let Some(expr) = &self.condition_expr {
                        if let Ok(result) = elspeth_expr::evaluate(expr, row_for_condition) {
                            if result.truthy() {
                                return Some("condition");
                            }
                        }
                    }
                }
                AggregationTrigger::EndOfSource | AggregationTrigger::Manual => {
                    // These only fire via `flush_end_of_source`/`flush_manual`.
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elspeth_domain::{SchemaContract, SchemaMode};
    use std::sync::Arc;
    use uuid::Uuid as UuidT;

    fn spec(triggers: Vec<AggregationTrigger>) -> AggregationSpec {
        let contract = SchemaContract::builder(SchemaMode::Observed).build();
        AggregationSpec {
            name: "sum_agg".into(),
            config: serde_json::json!({}),
            input_schema: contract.clone(),
            output_schema: contract,
            settings: AggregationSettings {
                output_mode: AggregationOutputMode::Transform,
                triggers,
                expected_output_count: None,
            },
        }
    }

    fn token(row_id: UuidT) -> Token {
        let contract = Arc::new(SchemaContract::builder(SchemaMode::Observed).build());
        Token::new_root(row_id, RowData::new(contract, serde_json::Map::new()))
    }

    #[test]
    fn count_trigger_flushes_in_source_order_even_if_inserted_out_of_order() {
        let spec = spec(vec![AggregationTrigger::Count(3)]);
        let exec = AggregationExecutor::new("agg_1", &spec).unwrap();
        let contract = Arc::new(SchemaContract::builder(SchemaMode::Observed).build());
        let empty_row = RowData::new(contract, serde_json::Map::new());

        let t1 = token(UuidT::new_v4());
        let t2 = token(UuidT::new_v4());
        let t3 = token(UuidT::new_v4());

        assert!(matches!(exec.accept(2, t2.clone(), &empty_row), AggregationFlush::Held { .. }));
        assert!(matches!(exec.accept(1, t1.clone(), &empty_row), AggregationFlush::Held { .. }));
        match exec.accept(3, t3.clone(), &empty_row) {
            AggregationFlush::Flushed { tokens, trigger, .. } => {
                assert_eq!(trigger, "count");
                assert_eq!(tokens[0].0, 1);
                assert_eq!(tokens[1].0, 2);
                assert_eq!(tokens[2].0, 3);
                assert_eq!(tokens[0].1.row_id, t1.row_id);
                assert_eq!(tokens[1].1.row_id, t2.row_id);
                assert_eq!(tokens[2].1.row_id, t3.row_id);
            }
            _ => panic!("expected flush"),
        }
    }

    #[test]
    fn end_of_source_flushes_partial_batch() {
        let spec = spec(vec![AggregationTrigger::Count(10)]);
        let exec = AggregationExecutor::new("agg_1", &spec).unwrap();
        let contract = Arc::new(SchemaContract::builder(SchemaMode::Observed).build());
        let empty_row = RowData::new(contract, serde_json::Map::new());
        exec.accept(1, token(UuidT::new_v4()), &empty_row);
        let flush = exec.flush_end_of_source().unwrap();
        match flush {
            AggregationFlush::Flushed { tokens, trigger, .. } => {
                assert_eq!(tokens.len(), 1);
                assert_eq!(trigger, "end_of_source");
            }
            _ => panic!("expected flush"),
        }
    }
}
