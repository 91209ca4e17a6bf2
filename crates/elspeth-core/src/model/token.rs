use serde::{Deserialize, Serialize};
use uuid::Uuid;

use elspeth_domain::RowData;

/// One instance of a source row inside a specific path through the DAG.
/// Immutable identity fields; row data updates produce a new `Token` value
/// with lineage preserved.
#[derive(Debug, Clone)]
pub struct Token {
    pub row_id: Uuid,
    pub token_id: Uuid,
    pub row_data: RowData,
    pub branch_name: Option<String>,
    pub fork_group_id: Option<Uuid>,
    pub join_group_id: Option<Uuid>,
    pub expand_group_id: Option<Uuid>,
}

impl Token {
    pub fn new_root(row_id: Uuid, row_data: RowData) -> Self {
        Self {
            row_id,
            token_id: Uuid::new_v4(),
            row_data,
            branch_name: None,
            fork_group_id: None,
            join_group_id: None,
            expand_group_id: None,
        }
    }

    /// Produces a new token value carrying updated row data. Identity and
    /// lineage (`row_id`, `token_id`, branch/fork/join/expand group) are
    /// preserved — a transform updating a token's data in place is still
    /// the same traversal instance, not a new one; only fork, expand and
    /// coalesce mint a fresh `token_id` because those are the points where
    /// a token's identity actually branches or merges.
    pub fn with_row_data(&self, row_data: RowData) -> Self {
        Self {
            row_id: self.row_id,
            token_id: self.token_id,
            row_data,
            branch_name: self.branch_name.clone(),
            fork_group_id: self.fork_group_id,
            join_group_id: self.join_group_id,
            expand_group_id: self.expand_group_id,
        }
    }

    pub fn fork_child(&self, branch_name: impl Into<String>, fork_group_id: Uuid, row_data: RowData) -> Self {
        Self {
            row_id: self.row_id,
            token_id: Uuid::new_v4(),
            row_data,
            branch_name: Some(branch_name.into()),
            fork_group_id: Some(fork_group_id),
            join_group_id: None,
            expand_group_id: None,
        }
    }

    pub fn expand_child(&self, expand_group_id: Uuid, row_data: RowData) -> Self {
        Self {
            row_id: self.row_id,
            token_id: Uuid::new_v4(),
            row_data,
            branch_name: self.branch_name.clone(),
            fork_group_id: self.fork_group_id,
            join_group_id: None,
            expand_group_id: Some(expand_group_id),
        }
    }

    pub fn merged(join_group_id: Uuid, row_id: Uuid, row_data: RowData) -> Self {
        Self {
            row_id,
            token_id: Uuid::new_v4(),
            row_data,
            branch_name: None,
            fork_group_id: None,
            join_group_id: Some(join_group_id),
            expand_group_id: None,
        }
    }
}

/// A work item in the row processor's queue: a token plus the pipeline
/// step index it should resume from.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub token: Token,
    pub start_step: usize,
    pub coalesce_at_step: Option<usize>,
}

impl WorkItem {
    pub fn new(token: Token, start_step: usize) -> Self {
        Self {
            token,
            start_step,
            coalesce_at_step: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Determinism {
    Deterministic,
    Seeded,
    IoRead,
    IoWrite,
    ExternalCall,
    NonDeterministic,
}
