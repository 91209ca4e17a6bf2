// elspeth-domain library entry point
pub mod contract;
pub mod error;
pub mod field;
pub mod row;

pub use contract::{FieldError, MergeStrategy, SchemaContract, SchemaContractBuilder, SchemaMode};
pub use error::DomainError;
pub use field::{FieldDef, FieldType};
pub use row::{merge_rows_nested, merge_rows_union, RowData, UnionMergeResult};
