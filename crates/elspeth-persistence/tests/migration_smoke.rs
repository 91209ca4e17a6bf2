use uuid::Uuid;

#[test]
fn migrations_create_the_eleven_audit_tables() {
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("DATABASE_URL not set - skipping migration smoke test");
        return;
    }

    use diesel::prelude::*;
    use elspeth_persistence::pg::build_dev_pool_from_env;

    let pool = build_dev_pool_from_env().expect("build pool");
    let mut conn = pool.get().expect("checkout connection");

    #[derive(QueryableByName)]
    struct TableName {
        #[diesel(sql_type = diesel::sql_types::Text)]
        table_name: String,
    }

    let rows: Vec<TableName> = diesel::sql_query(
        "SELECT table_name FROM information_schema.tables WHERE table_schema = 'public' AND table_type = 'BASE TABLE'",
    )
    .load(&mut conn)
    .expect("list tables");
    let names: Vec<String> = rows.into_iter().map(|r| r.table_name).collect();

    for expected in [
        "runs",
        "rows",
        "tokens",
        "token_parents",
        "nodes",
        "node_states",
        "routing_events",
        "token_outcomes",
        "artifacts",
        "batches",
        "batch_members",
        "checkpoints",
        "audit_log",
    ] {
        assert!(names.contains(&expected.to_string()), "missing table {expected}");
    }

    // Sanity check pgcrypto ran: uuid columns accept gen_random_uuid().
    let _ = Uuid::new_v4();
}
