//! Diesel schema for the eleven-table audit store.
//!
//! Hand-written rather than `diesel print-schema`'d, so it tracks
//! `migrations/` exactly; regenerate both together if either changes.
//!
//! Composite-key tables (`nodes`, `token_parents`, `routing_events`,
//! `batch_members`) mean any query that joins through them must filter
//! by `run_id` explicitly — Diesel won't do it for you.

diesel::table! {
    runs (run_id) {
        run_id -> Uuid,
        status -> Text,
        started_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
        pipelining_config -> Jsonb,
        failure_cause -> Nullable<Text>,
    }
}

diesel::table! {
    rows (row_id) {
        row_id -> Uuid,
        run_id -> Uuid,
        sequence_number -> BigInt,
        content_hash -> Text,
    }
}

diesel::table! {
    tokens (token_id) {
        token_id -> Uuid,
        run_id -> Uuid,
        row_id -> Uuid,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    token_parents (token_id, parent_token_id) {
        token_id -> Uuid,
        parent_token_id -> Uuid,
        run_id -> Uuid,
    }
}

diesel::table! {
    nodes (node_id, run_id) {
        node_id -> Text,
        run_id -> Uuid,
        node_type -> Text,
        plugin_name -> Text,
    }
}

diesel::table! {
    node_states (state_id) {
        state_id -> Uuid,
        run_id -> Uuid,
        token_id -> Uuid,
        node_id -> Text,
        status -> Text,
        attempt -> Integer,
        started_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    routing_events (state_id, edge_id) {
        state_id -> Uuid,
        edge_id -> Text,
        run_id -> Uuid,
        mode -> Text,
        reason -> Jsonb,
        recorded_at -> Timestamptz,
    }
}

diesel::table! {
    token_outcomes (outcome_id) {
        outcome_id -> Uuid,
        run_id -> Uuid,
        token_id -> Uuid,
        outcome -> Text,
        is_terminal -> Bool,
        sink_name -> Nullable<Text>,
        error_hash -> Nullable<Text>,
        fork_group_id -> Nullable<Uuid>,
        join_group_id -> Nullable<Uuid>,
        expand_group_id -> Nullable<Uuid>,
        batch_id -> Nullable<Uuid>,
        recorded_at -> Timestamptz,
    }
}

diesel::table! {
    artifacts (artifact_id) {
        artifact_id -> Uuid,
        run_id -> Uuid,
        token_id -> Uuid,
        sink_name -> Text,
        content_hash -> Text,
        size_bytes -> BigInt,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    batches (batch_id) {
        batch_id -> Uuid,
        run_id -> Uuid,
        aggregation_node_id -> Text,
        status -> Text,
        trigger_type -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    batch_members (batch_id, token_id) {
        batch_id -> Uuid,
        token_id -> Uuid,
        run_id -> Uuid,
        ordinal -> Integer,
    }
}

diesel::table! {
    checkpoints (checkpoint_id) {
        checkpoint_id -> Uuid,
        run_id -> Uuid,
        released_through_seq -> BigInt,
        state_blob -> Jsonb,
        created_at -> Timestamptz,
    }
}

// Bookkeeping table, not one of the eleven audit tables: gives every
// `AuditEvent` a per-run monotonic `seq` and a durable payload so `list`
// can replay events in the shape `AuditRecorder` promises, independent of
// how they're fanned out across the eleven domain tables above.
diesel::table! {
    audit_log (run_id, seq) {
        run_id -> Uuid,
        seq -> BigInt,
        kind_tag -> Text,
        payload -> Jsonb,
        ts -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    runs,
    rows,
    tokens,
    token_parents,
    nodes,
    node_states,
    routing_events,
    token_outcomes,
    artifacts,
    batches,
    batch_members,
    checkpoints,
    audit_log,
);
