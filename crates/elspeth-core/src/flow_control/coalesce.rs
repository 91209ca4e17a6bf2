//! Coalesce executor. Keyed by `(coalesce_name, row_id)`; holds
//! the arrival state for one pending join per key and a bounded FIFO of
//! recently completed keys used to detect late arrivals.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use elspeth_domain::{merge_rows_nested, merge_rows_union, MergeStrategy, RowData, SchemaContract};
use uuid::Uuid;

use crate::constants::COALESCE_COMPLETED_FIFO_CAP;
use crate::graph::{CoalescePolicy, CoalesceSpec};
use crate::model::{FailureReason, Token};

struct PendingJoin {
    arrived: HashMap<String, Token>,
    arrival_times: HashMap<String, Instant>,
    first_arrival: Instant,
    lost_branches: HashSet<String>,
}

impl PendingJoin {
    fn new() -> Self {
        Self {
            arrived: HashMap::new(),
            arrival_times: HashMap::new(),
            first_arrival: Instant::now(),
            lost_branches: HashSet::new(),
        }
    }

    fn accounted_for(&self, expected: &[String]) -> bool {
        expected.iter().all(|b| self.arrived.contains_key(b) || self.lost_branches.contains(b))
    }
}

pub enum CoalesceOutcome {
    Held,
    Merged {
        join_group_id: Uuid,
        token: Token,
        consumed: Vec<Token>,
        collisions: Vec<String>,
    },
    /// Every token accumulated so far failed together under the
    /// policy's timeout/branch-loss rule.
    Failed {
        consumed: Vec<Token>,
        reason: FailureReason,
    },
    LateArrival {
        token: Token,
    },
}

pub struct CoalesceExecutor {
    pub node_id: String,
    name: String,
    spec: CoalesceSpec,
    pending: Mutex<HashMap<Uuid, PendingJoin>>,
    completed: Mutex<(VecDeque<Uuid>, HashSet<Uuid>)>,
}

impl CoalesceExecutor {
    pub fn new(node_id: impl Into<String>, name: impl Into<String>, spec: CoalesceSpec) -> Self {
        Self {
            node_id: node_id.into(),
            name: name.into(),
            spec,
            pending: Mutex::new(HashMap::new()),
            completed: Mutex::new((VecDeque::new(), HashSet::new())),
        }
    }

    fn mark_completed(&self, row_id: Uuid) {
        let mut guard = self.completed.lock().expect("coalesce completed lock poisoned");
        let (queue, set) = &mut *guard;
        queue.push_back(row_id);
        set.insert(row_id);
        if queue.len() > COALESCE_COMPLETED_FIFO_CAP {
            if let Some(evicted) = queue.pop_front() {
                set.remove(&evicted);
            }
        }
    }

    fn is_completed(&self, row_id: Uuid) -> bool {
        self.completed.lock().expect("coalesce completed lock poisoned").1.contains(&row_id)
    }

    /// Offers a token arriving on `branch` for its `row_id`'s join.
    pub fn accept(&self, row_id: Uuid, branch: String, token: Token) -> CoalesceOutcome {
        if self.is_completed(row_id) {
            return CoalesceOutcome::LateArrival { token };
        }

        let mut pending = self.pending.lock().expect("coalesce pending lock poisoned");
        let join = pending.entry(row_id).or_insert_with(PendingJoin::new);
        join.arrived.insert(branch.clone(), token);
        join.arrival_times.insert(branch, Instant::now());

        let decision = self.decide(join);
        self.apply_decision(&mut pending, row_id, decision)
    }

    /// Called by the orchestrator when a DIVERT route consumes a token
    /// that would otherwise have reached this coalesce.
    pub fn notify_branch_loss(&self, row_id: Uuid, branch: String) -> CoalesceOutcome {
        if self.is_completed(row_id) {
            return CoalesceOutcome::Held;
        }
        let mut pending = self.pending.lock().expect("coalesce pending lock poisoned");
        let join = pending.entry(row_id).or_insert_with(PendingJoin::new);
        join.lost_branches.insert(branch);

        let decision = self.decide(join);
        self.apply_decision(&mut pending, row_id, decision)
    }

    /// Checked on arrivals and at end-of-source (no background timer,
    /// timeout). `timeout` is supplied by the orchestrator's pipelining
    /// config.
    pub fn check_timeout(&self, row_id: Uuid, timeout: Duration) -> CoalesceOutcome {
        let mut pending = self.pending.lock().expect("coalesce pending lock poisoned");
        let Some(join) = pending.get(&row_id) else {
            return CoalesceOutcome::Held;
        };
        if join.first_arrival.elapsed() < timeout {
            return CoalesceOutcome::Held;
        }
        let decision = self.decide_on_timeout(join);
        self.apply_decision(&mut pending, row_id, decision)
    }

    fn decide(&self, join: &PendingJoin) -> Decision {
        let arrived = join.arrived.len();
        match self.spec.policy {
            CoalescePolicy::First => Decision::Merge,
            CoalescePolicy::RequireAll => {
                if join.accounted_for(&self.spec.expected_branches) && join.lost_branches.is_empty() {
                    Decision::Merge
                } else if !join.lost_branches.is_empty() {
                    Decision::Fail(FailureReason::CoalesceBranchLoss)
                } else {
                    Decision::Pending
                }
            }
            CoalescePolicy::Quorum(n) => {
                if arrived >= n {
                    Decision::Merge
                } else {
                    let remaining = self.spec.expected_branches.len() - arrived - join.lost_branches.len();
                    if remaining + arrived < n {
                        Decision::Fail(FailureReason::CoalesceQuorumUnmet { arrived, required: n })
                    } else {
                        Decision::Pending
                    }
                }
            }
            CoalescePolicy::BestEffort => {
                if join.accounted_for(&self.spec.expected_branches) {
                    Decision::Merge
                } else {
                    Decision::Pending
                }
            }
        }
    }

    fn decide_on_timeout(&self, join: &PendingJoin) -> Decision {
        match self.spec.policy {
            CoalescePolicy::First => Decision::Merge,
            CoalescePolicy::RequireAll => Decision::Fail(FailureReason::CoalesceTimeout),
            CoalescePolicy::Quorum(n) => {
                if join.arrived.len() >= n {
                    Decision::Merge
                } else {
                    Decision::Fail(FailureReason::CoalesceQuorumUnmet {
                        arrived: join.arrived.len(),
                        required: n,
                    })
                }
            }
            CoalescePolicy::BestEffort => Decision::Merge,
        }
    }

    fn apply_decision(&self, pending: &mut HashMap<Uuid, PendingJoin>, row_id: Uuid, decision: Decision) -> CoalesceOutcome {
        match decision {
            Decision::Pending => CoalesceOutcome::Held,
            Decision::Merge => {
                let join = pending.remove(&row_id).expect("join present");
                self.mark_completed(row_id);
                let mut branches: Vec<(String, Token)> = join.arrived.into_iter().collect();
                branches.sort_by(|a, b| a.0.cmp(&b.0));
                let consumed: Vec<Token> = branches.iter().map(|(_, t)| t.clone()).collect();
                let join_group_id = Uuid::new_v4();
                let (merged_row, collisions) = self.merge_rows(&branches);
                let merged_token = Token::merged(join_group_id, row_id, merged_row);
                CoalesceOutcome::Merged {
                    join_group_id,
                    token: merged_token,
                    consumed,
                    collisions,
                }
            }
            Decision::Fail(reason) => {
                let join = pending.remove(&row_id).expect("join present");
                self.mark_completed(row_id);
                let consumed: Vec<Token> = join.arrived.into_values().collect();
                CoalesceOutcome::Failed { consumed, reason }
            }
        }
    }

    fn merge_rows(&self, branches: &[(String, Token)]) -> (RowData, Vec<String>) {
        let contract_branches: Vec<(String, SchemaContract)> =
            branches.iter().map(|(n, t)| (n.clone(), (*t.row_data.contract).clone())).collect();
        let merged_contract = SchemaContract::merge(&contract_branches, self.spec.merge_strategy)
            .unwrap_or_else(|_| contract_branches[0].1.clone());

        let field_branches: Vec<(String, serde_json::Map<String, serde_json::Value>)> =
            branches.iter().map(|(n, t)| (n.clone(), t.row_data.fields.clone())).collect();

        let (fields, collisions) = match self.spec.merge_strategy {
            MergeStrategy::Union => {
                let result = merge_rows_union(&field_branches);
                (result.fields, result.collisions)
            }
            MergeStrategy::Nested => (merge_rows_nested(&field_branches), Vec::new()),
            MergeStrategy::Select => (field_branches[0].1.clone(), Vec::new()),
        };

        (RowData::new(std::sync::Arc::new(merged_contract), fields), collisions)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Row ids with an open join, for the orchestrator's end-of-source
    /// timeout sweep — no background timer.
    pub fn pending_row_ids(&self) -> Vec<Uuid> {
        self.pending.lock().expect("coalesce pending lock poisoned").keys().copied().collect()
    }
}

enum Decision {
    Pending,
    Merge,
    Fail(FailureReason),
}

#[cfg(test)]
mod tests {
    use super::*;
    use elspeth_domain::SchemaMode;
    use std::sync::Arc;

    fn spec(policy: CoalescePolicy, branches: &[&str]) -> CoalesceSpec {
        CoalesceSpec {
            name: "join".into(),
            config: serde_json::json!({}),
            expected_branches: branches.iter().map(|s| s.to_string()).collect(),
            policy,
            merge_strategy: MergeStrategy::Union,
            continues_on: "main".into(),
        }
    }

    fn token_with_field(row_id: Uuid, field: &str, value: serde_json::Value) -> Token {
        let contract = Arc::new(SchemaContract::builder(SchemaMode::Observed).build());
        let mut fields = serde_json::Map::new();
        fields.insert(field.to_string(), value);
        Token::new_root(row_id, RowData::new(contract, fields))
    }

    #[test]
    fn require_all_merges_once_every_branch_arrives() {
        let exec = CoalesceExecutor::new("coal_1", "join", spec(CoalescePolicy::RequireAll, &["sentiment_path", "entity_path"]));
        let row_id = Uuid::new_v4();
        let t1 = token_with_field(row_id, "sentiment", serde_json::json!("positive"));
        let t2 = token_with_field(row_id, "entities", serde_json::json!(["X"]));

        assert!(matches!(exec.accept(row_id, "sentiment_path".into(), t1), CoalesceOutcome::Held));
        match exec.accept(row_id, "entity_path".into(), t2) {
            CoalesceOutcome::Merged { token, consumed, .. } => {
                assert_eq!(consumed.len(), 2);
                assert!(token.row_data.fields.contains_key("sentiment"));
                assert!(token.row_data.fields.contains_key("entities"));
            }
            _ => panic!("expected merge"),
        }
    }

    #[test]
    fn late_arrival_after_merge_is_flagged() {
        let exec = CoalesceExecutor::new("coal_1", "join", spec(CoalescePolicy::First, &["only"]));
        let row_id = Uuid::new_v4();
        let t1 = token_with_field(row_id, "a", serde_json::json!(1));
        assert!(matches!(exec.accept(row_id, "only".into(), t1), CoalesceOutcome::Merged { .. }));

        let late = token_with_field(row_id, "a", serde_json::json!(2));
        assert!(matches!(exec.accept(row_id, "only".into(), late), CoalesceOutcome::LateArrival { .. }));
    }

    #[test]
    fn require_all_fails_on_branch_loss() {
        let exec = CoalesceExecutor::new("coal_1", "join", spec(CoalescePolicy::RequireAll, &["a", "b"]));
        let row_id = Uuid::new_v4();
        let t1 = token_with_field(row_id, "x", serde_json::json!(1));
        assert!(matches!(exec.accept(row_id, "a".into(), t1), CoalesceOutcome::Held));
        match exec.notify_branch_loss(row_id, "b".into()) {
            CoalesceOutcome::Failed { reason, .. } => assert_eq!(reason, FailureReason::CoalesceBranchLoss),
            _ => panic!("expected failure"),
        }
    }
}
