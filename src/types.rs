//! Core types shared by the compiler and the serializer.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Query parameter names understood by the compiler.
pub const PARAM_FILTER: &str = "filter";
pub const PARAM_SORT: &str = "sort";
pub const PARAM_PAGE_OFFSET: &str = "page[offset]";
pub const PARAM_PAGE_LIMIT: &str = "page[limit]";
pub const PARAM_FIELDS: &str = "fields";
pub const PARAM_INCLUDE: &str = "include";
pub const PARAM_DATA: &str = "_data";

/// Literal accepted by `page[limit]` to request every record.
pub const UNBOUNDED_TOKEN: &str = "unbounded";

/// Maximum number of segments in an include or `_data` path.
pub const MAX_PATH_DEPTH: usize = 3;

pub const DEFAULT_LIMIT: u64 = 100;

/// Attribute every resource exposes and every sort ends on.
pub const ID_FIELD: &str = "id";

/// Returns the JSON type name for error messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Declared type category of an attribute.
///
/// The category selects which filter operators a field accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeCategory {
    #[serde(alias = "integer", alias = "int")]
    Numeric,
    Float,
    #[serde(alias = "str", alias = "enum")]
    String,
    List,
    Datetime,
    Bool,
}

impl TypeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeCategory::Numeric => "numeric",
            TypeCategory::Float => "float",
            TypeCategory::String => "string",
            TypeCategory::List => "list",
            TypeCategory::Datetime => "datetime",
            TypeCategory::Bool => "bool",
        }
    }
}

/// Whether a relationship points at one record or many.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    #[default]
    One,
    Many,
}

/// Page size: a fixed count or every matching record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Limit {
    Bounded(u64),
    Unbounded,
}

impl Limit {
    /// Returns the count, or `None` when unbounded.
    pub fn as_count(&self) -> Option<u64> {
        match self {
            Limit::Bounded(n) => Some(*n),
            Limit::Unbounded => None,
        }
    }
}

impl Default for Limit {
    fn default() -> Self {
        Limit::Bounded(DEFAULT_LIMIT)
    }
}

impl Serialize for Limit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Limit::Bounded(n) => serializer.serialize_u64(*n),
            Limit::Unbounded => serializer.serialize_str(UNBOUNDED_TOKEN),
        }
    }
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Limit::Bounded(n) => write!(f, "{}", n),
            Limit::Unbounded => f.write_str(UNBOUNDED_TOKEN),
        }
    }
}

/// One sort key. `rel.field` names are allowed one level deep.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SortKey {
    pub field: String,
    pub ascending: bool,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: true,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: false,
        }
    }

    /// Parse `name` or `-name`. Returns `None` for an empty name.
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim();
        let key = match token.strip_prefix('-') {
            Some(rest) => SortKey::desc(rest),
            None => SortKey::asc(token),
        };
        (!key.field.is_empty()).then_some(key)
    }
}

impl std::fmt::Display for SortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.ascending {
            f.write_str(&self.field)
        } else {
            write!(f, "-{}", self.field)
        }
    }
}
