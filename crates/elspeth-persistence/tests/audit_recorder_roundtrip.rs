mod test_support;

use elspeth_core::audit::{AuditEventKind, AuditRecorder};
use elspeth_core::model::Outcome;
use elspeth_persistence::pg::{PgAuditRecorder, PoolProvider};
use uuid::Uuid;

fn skip_without_database() -> bool {
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("DATABASE_URL not set - skipping audit recorder test");
        return true;
    }
    false
}

#[test]
fn linear_run_appends_in_source_order_and_replays_identically() {
    if skip_without_database() {
        return;
    }
    let Some(pool) = test_support::TEST_POOL.clone() else {
        eprintln!("no test pool available - skipping");
        return;
    };
    let recorder = PgAuditRecorder::new(PoolProvider { pool });
    let run_id = Uuid::new_v4();

    recorder
        .append(run_id, AuditEventKind::RunStarted { pipelining_config: serde_json::json!({"max_rows_in_flight": 4}) })
        .expect("append RunStarted");
    recorder.register_node(run_id, "source_vec_1", "source", "vec_source").expect("register node");
    recorder.register_node(run_id, "sink_vec_1", "sink", "vec_sink").expect("register node");

    let row_id = Uuid::new_v4();
    recorder
        .append(run_id, AuditEventKind::RowPulled { row_id, sequence_number: 1, content_hash: "deadbeef".into() })
        .expect("append RowPulled");

    let token_id = Uuid::new_v4();
    recorder
        .append(run_id, AuditEventKind::TokenCreated { token_id, row_id, parent_token_ids: vec![] })
        .expect("append TokenCreated");

    let state_id = Uuid::new_v4();
    recorder
        .append(run_id, AuditEventKind::NodeStateBegin { state_id, token_id, node_id: "sink_vec_1".into(), attempt: 1 })
        .expect("append NodeStateBegin");
    recorder
        .append(run_id, AuditEventKind::NodeStateComplete { state_id, status: elspeth_core::audit::NodeStateStatus::Completed })
        .expect("append NodeStateComplete");

    let outcome_id = Uuid::new_v4();
    recorder
        .append(run_id, AuditEventKind::TokenOutcome { outcome_id, token_id, outcome: Outcome::Completed { sink_name: "sink_vec_1".into() } })
        .expect("append TokenOutcome");

    let artifact_id = Uuid::new_v4();
    recorder
        .append(run_id, AuditEventKind::Artifact { artifact_id, token_id, sink_name: "sink_vec_1".into(), content_hash: "cafebabe".into(), size_bytes: 42 })
        .expect("append Artifact");

    recorder.append(run_id, AuditEventKind::RunCompleted).expect("append RunCompleted");

    let events = recorder.list(run_id);
    assert_eq!(events.len(), 7);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as u64);
    }
    assert!(matches!(events[0].kind, AuditEventKind::RunStarted { .. }));
    assert!(matches!(events.last().unwrap().kind, AuditEventKind::RunCompleted));
}

#[test]
fn fork_children_and_parent_outcome_are_atomic() {
    if skip_without_database() {
        return;
    }
    let Some(pool) = test_support::TEST_POOL.clone() else {
        eprintln!("no test pool available - skipping");
        return;
    };
    let recorder = PgAuditRecorder::new(PoolProvider { pool });
    let run_id = Uuid::new_v4();
    recorder.append(run_id, AuditEventKind::RunStarted { pipelining_config: serde_json::json!({}) }).expect("append RunStarted");

    let row_id = Uuid::new_v4();
    recorder
        .append(run_id, AuditEventKind::RowPulled { row_id, sequence_number: 1, content_hash: "hash".into() })
        .expect("append RowPulled");
    let parent_id = Uuid::new_v4();
    recorder
        .append(run_id, AuditEventKind::TokenCreated { token_id: parent_id, row_id, parent_token_ids: vec![] })
        .expect("append TokenCreated");

    let fork_group_id = Uuid::new_v4();
    let child_a = Uuid::new_v4();
    let child_b = Uuid::new_v4();
    let parent_outcome = Uuid::new_v4();

    let events = recorder
        .append_atomic(
            run_id,
            vec![
                AuditEventKind::TokenCreated { token_id: child_a, row_id, parent_token_ids: vec![parent_id] },
                AuditEventKind::TokenCreated { token_id: child_b, row_id, parent_token_ids: vec![parent_id] },
                AuditEventKind::TokenOutcome { outcome_id: parent_outcome, token_id: parent_id, outcome: Outcome::Forked { fork_group_id } },
            ],
        )
        .expect("append_atomic fork");
    assert_eq!(events.len(), 3);

    let all = recorder.list(run_id);
    let token_created_count =
        all.iter().filter(|e| matches!(e.kind, AuditEventKind::TokenCreated { .. })).count();
    assert_eq!(token_created_count, 3);
}
