use diesel::result::{DatabaseErrorKind, Error as DieselError};
use elspeth_persistence::PersistenceError;

#[derive(Debug)]
struct FakeDbError(String);

impl diesel::result::DatabaseErrorInformation for FakeDbError {
    fn message(&self) -> &str {
        &self.0
    }
    fn details(&self) -> Option<&str> {
        None
    }
    fn hint(&self) -> Option<&str> {
        None
    }
    fn table_name(&self) -> Option<&str> {
        None
    }
    fn column_name(&self) -> Option<&str> {
        None
    }
    fn constraint_name(&self) -> Option<&str> {
        None
    }
    fn statement_position(&self) -> Option<i32> {
        None
    }
}

#[test]
fn unique_violation_maps_to_unique_violation_variant() {
    let diesel_err = DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, Box::new(FakeDbError("duplicate key".into())));
    let mapped: PersistenceError = diesel_err.into();
    assert!(matches!(mapped, PersistenceError::UniqueViolation(msg) if msg == "duplicate key"));
}

#[test]
fn serialization_failure_is_retryable() {
    let diesel_err = DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, Box::new(FakeDbError("could not serialize access".into())));
    let mapped: PersistenceError = diesel_err.into();
    assert!(matches!(mapped, PersistenceError::SerializationConflict));
}

#[test]
fn not_found_maps_cleanly() {
    let mapped: PersistenceError = DieselError::NotFound.into();
    assert!(matches!(mapped, PersistenceError::NotFound));
}
