use serde::{Deserialize, Serialize};

/// A field's declared type. Covariant on widening (`Integer -> Float`);
/// everything else is compared structurally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Json,
    Array(Box<FieldType>),
}

impl FieldType {
    /// True if a producer field declared as `self` may stand in for a
    /// consumer field declared as `other`.
    pub fn compatible_with(&self, other: &FieldType) -> bool {
        if self == other {
            return true;
        }
        match (self, other) {
            (FieldType::Integer, FieldType::Float) => true,
            (_, FieldType::Json) | (FieldType::Json, _) => true,
            (FieldType::Array(a), FieldType::Array(b)) => a.compatible_with(b),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub default: Option<serde_json::Value>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType, required: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            required,
            default: None,
        }
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }
}
