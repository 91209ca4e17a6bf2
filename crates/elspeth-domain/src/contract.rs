use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::field::{FieldDef, FieldType};
use crate::row::RowData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaMode {
    // Ordered so that `max` implements the `fixed > flexible > observed`
    // precedence used when merging contracts across fork branches.
    Observed,
    Flexible,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Union,
    Nested,
    Select,
}

/// Describes one row's expected shape. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaContract {
    pub mode: SchemaMode,
    pub fields: Vec<FieldDef>,
    pub guaranteed_fields: BTreeSet<String>,
    pub required_fields: BTreeSet<String>,
    pub audit_fields: BTreeSet<String>,
}

pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl SchemaContract {
    pub fn builder(mode: SchemaMode) -> SchemaContractBuilder {
        SchemaContractBuilder::new(mode)
    }

    fn declared_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// `validate(row) -> Result<row, FieldErrors>`.
    pub fn validate(&self, row: &RowData) -> Result<(), Vec<FieldError>> {
        if self.mode == SchemaMode::Observed {
            return Ok(());
        }
        let mut errors = Vec::new();
        for field in &self.fields {
            match row.fields.get(&field.name) {
                Some(value) => {
                    if !value_matches_type(value, &field.field_type) {
                        errors.push(FieldError {
                            field: field.name.clone(),
                            message: format!("expected {:?}", field.field_type),
                        });
                    }
                }
                None if field.required && field.default.is_none() => {
                    errors.push(FieldError {
                        field: field.name.clone(),
                        message: "required field missing".to_string(),
                    });
                }
                None => {}
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// `satisfies(other) -> Result<(), missing_fields>`. `self` is the
    /// producer, `other` the consumer.
    pub fn satisfies(&self, consumer: &SchemaContract) -> Result<(), Vec<String>> {
        if self.mode == SchemaMode::Observed || consumer.mode == SchemaMode::Observed {
            return Ok(());
        }
        let mut missing = Vec::new();
        for field in &consumer.required_fields {
            let producer_has = self.guaranteed_fields.contains(field) || self.declared_field(field).is_some();
            if !producer_has {
                missing.push(field.clone());
                continue;
            }
            if let (Some(p), Some(c)) = (self.declared_field(field), consumer.declared_field(field)) {
                if !p.field_type.compatible_with(&c.field_type) {
                    missing.push(field.clone());
                }
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing)
        }
    }

    /// Merge several branch contracts across a fork/coalesce into one,
    /// per the contract's merge strategy.
    pub fn merge(
        branches: &[(String, SchemaContract)],
        strategy: MergeStrategy,
    ) -> Result<SchemaContract, DomainError> {
        if branches.is_empty() {
            return Err(DomainError::ValidationError(
                "cannot merge zero branches".to_string(),
            ));
        }
        match strategy {
            MergeStrategy::Select => Ok(branches[0].1.clone()),
            MergeStrategy::Nested => {
                // The merged contract carries one field per branch, each
                // typed as the nested branch payload (Json is the only
                // structural fit since fields are flat scalars).
                let mode = branches
                    .iter()
                    .map(|(_, c)| c.mode)
                    .max()
                    .unwrap_or(SchemaMode::Observed);
                let fields = branches
                    .iter()
                    .map(|(name, _)| FieldDef::new(name.clone(), FieldType::Json, true))
                    .collect();
                Ok(SchemaContract {
                    mode,
                    fields,
                    guaranteed_fields: branches.iter().map(|(n, _)| n.clone()).collect(),
                    required_fields: branches.iter().map(|(n, _)| n.clone()).collect(),
                    audit_fields: BTreeSet::new(),
                })
            }
            MergeStrategy::Union => {
                let mode = branches
                    .iter()
                    .map(|(_, c)| c.mode)
                    .max()
                    .unwrap_or(SchemaMode::Observed);

                // Field set: intersection of declared fields across
                // branches, plus all guaranteed fields from any branch.
                let mut field_sets: Vec<BTreeSet<String>> = branches
                    .iter()
                    .map(|(_, c)| c.fields.iter().map(|f| f.name.clone()).collect())
                    .collect();
                let mut intersection = field_sets.pop().unwrap_or_default();
                for set in &field_sets {
                    intersection = intersection.intersection(set).cloned().collect();
                }
                let mut guaranteed = BTreeSet::new();
                for (_, c) in branches {
                    guaranteed.extend(c.guaranteed_fields.iter().cloned());
                }
                let mut field_names: BTreeSet<String> = intersection;
                field_names.extend(guaranteed.iter().cloned());

                let mut fields = Vec::new();
                for name in &field_names {
                    let def = branches
                        .iter()
                        .find_map(|(_, c)| c.declared_field(name).cloned())
                        .unwrap_or_else(|| FieldDef::new(name.clone(), FieldType::Json, false));
                    fields.push(def);
                }

                Ok(SchemaContract {
                    mode,
                    fields,
                    guaranteed_fields: guaranteed,
                    required_fields: field_names,
                    audit_fields: BTreeSet::new(),
                })
            }
        }
    }
}

fn value_matches_type(value: &serde_json::Value, ty: &FieldType) -> bool {
    use serde_json::Value;
    match (value, ty) {
        (Value::Null, _) => true,
        (Value::String(_), FieldType::String) => true,
        (Value::String(_), FieldType::Timestamp) => true,
        (Value::Number(n), FieldType::Integer) => n.is_i64() || n.is_u64(),
        (Value::Number(_), FieldType::Float) => true,
        (Value::Bool(_), FieldType::Boolean) => true,
        (Value::Array(items), FieldType::Array(inner)) => {
            items.iter().all(|v| value_matches_type(v, inner))
        }
        (_, FieldType::Json) => true,
        _ => false,
    }
}

pub struct SchemaContractBuilder {
    mode: SchemaMode,
    fields: Vec<FieldDef>,
    guaranteed_fields: BTreeSet<String>,
    required_fields: BTreeSet<String>,
    audit_fields: BTreeSet<String>,
}

impl SchemaContractBuilder {
    pub fn new(mode: SchemaMode) -> Self {
        Self {
            mode,
            fields: Vec::new(),
            guaranteed_fields: BTreeSet::new(),
            required_fields: BTreeSet::new(),
            audit_fields: BTreeSet::new(),
        }
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        if field.required {
            self.required_fields.insert(field.name.clone());
        }
        self.guaranteed_fields.insert(field.name.clone());
        self.fields.push(field);
        self
    }

    pub fn audit_field(mut self, name: impl Into<String>) -> Self {
        self.audit_fields.insert(name.into());
        self
    }

    pub fn build(self) -> SchemaContract {
        SchemaContract {
            mode: self.mode,
            fields: self.fields,
            guaranteed_fields: self.guaranteed_fields,
            required_fields: self.required_fields,
            audit_fields: self.audit_fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_field(name: &str, required: bool) -> FieldDef {
        FieldDef::new(name, FieldType::String, required)
    }

    #[test]
    fn satisfies_reports_ordered_missing_fields() {
        let producer = SchemaContract::builder(SchemaMode::Fixed)
            .field(string_field("id", true))
            .build();
        let consumer = SchemaContract::builder(SchemaMode::Fixed)
            .field(string_field("id", true))
            .field(string_field("text", true))
            .build();
        let missing = producer.satisfies(&consumer).unwrap_err();
        assert_eq!(missing, vec!["text".to_string()]);
    }

    #[test]
    fn observed_mode_bypasses_satisfies() {
        let producer = SchemaContract::builder(SchemaMode::Observed).build();
        let consumer = SchemaContract::builder(SchemaMode::Fixed)
            .field(string_field("id", true))
            .build();
        assert!(producer.satisfies(&consumer).is_ok());
    }

    #[test]
    fn union_merge_intersects_declared_fields_and_keeps_guaranteed() {
        let a = SchemaContract::builder(SchemaMode::Fixed)
            .field(string_field("id", true))
            .field(string_field("sentiment", true))
            .build();
        let b = SchemaContract::builder(SchemaMode::Fixed)
            .field(string_field("id", true))
            .field(string_field("entities", true))
            .build();
        let merged = SchemaContract::merge(
            &[("sentiment_path".into(), a), ("entity_path".into(), b)],
            MergeStrategy::Union,
        )
        .unwrap();
        let names: BTreeSet<_> = merged.fields.iter().map(|f| f.name.clone()).collect();
        assert!(names.contains("id"));
    }
}
