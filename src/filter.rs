//! Filter expression model.
//!
//! A compiled filter is a tree of [`FilterExpr`] nodes: leaves compare one
//! field against a value, groups combine children with AND or OR.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::ApiError;
use crate::types::TypeCategory;

/// Filter operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Between two bounds, inclusive.
    Bt,
    In,
    Isnull,
    Isnotnull,
    /// Contains (substring for text, any-of for lists).
    Ct,
    /// Starts with.
    Sw,
    /// Ends with.
    Ew,
    /// List is empty.
    Em,
    /// List is not empty.
    Nem,
    /// List contains every comma-separated value.
    Cts,
    /// List equals the given array.
    Aeq,
    /// List contains every element of the given array.
    Act,
}

const NUMERIC_OPS: &[Operator] = &[
    Operator::Eq,
    Operator::Gt,
    Operator::Gte,
    Operator::Lt,
    Operator::Lte,
    Operator::Ne,
    Operator::Bt,
    Operator::In,
    Operator::Isnull,
    Operator::Isnotnull,
];

const FLOAT_OPS: &[Operator] = &[
    Operator::Eq,
    Operator::Gt,
    Operator::Gte,
    Operator::Lt,
    Operator::Lte,
    Operator::Bt,
];

const STRING_OPS: &[Operator] = &[
    Operator::Ct,
    Operator::Sw,
    Operator::Ew,
    Operator::Eq,
    Operator::In,
    Operator::Ne,
    Operator::Isnull,
    Operator::Isnotnull,
];

const LIST_OPS: &[Operator] = &[
    Operator::Eq,
    Operator::Ne,
    Operator::Em,
    Operator::Nem,
    Operator::Cts,
    Operator::Aeq,
    Operator::Ct,
    Operator::Act,
];

const DATETIME_OPS: &[Operator] = &[
    Operator::Eq,
    Operator::Gt,
    Operator::Gte,
    Operator::Lt,
    Operator::Lte,
    Operator::Bt,
];

const BOOL_OPS: &[Operator] = &[Operator::Eq];

/// Operators a field of the given category accepts.
pub fn vocabulary(category: TypeCategory) -> &'static [Operator] {
    match category {
        TypeCategory::Numeric => NUMERIC_OPS,
        TypeCategory::Float => FLOAT_OPS,
        TypeCategory::String => STRING_OPS,
        TypeCategory::List => LIST_OPS,
        TypeCategory::Datetime => DATETIME_OPS,
        TypeCategory::Bool => BOOL_OPS,
    }
}

impl Operator {
    /// Parse a wire operator. `in_` is accepted for `in`.
    pub fn parse(s: &str) -> Option<Self> {
        let op = match s {
            "eq" => Operator::Eq,
            "ne" => Operator::Ne,
            "gt" => Operator::Gt,
            "gte" => Operator::Gte,
            "lt" => Operator::Lt,
            "lte" => Operator::Lte,
            "bt" => Operator::Bt,
            "in" | "in_" => Operator::In,
            "isnull" => Operator::Isnull,
            "isnotnull" => Operator::Isnotnull,
            "ct" => Operator::Ct,
            "sw" => Operator::Sw,
            "ew" => Operator::Ew,
            "em" => Operator::Em,
            "nem" => Operator::Nem,
            "cts" => Operator::Cts,
            "aeq" => Operator::Aeq,
            "act" => Operator::Act,
            _ => return None,
        };
        Some(op)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Bt => "bt",
            Operator::In => "in",
            Operator::Isnull => "isnull",
            Operator::Isnotnull => "isnotnull",
            Operator::Ct => "ct",
            Operator::Sw => "sw",
            Operator::Ew => "ew",
            Operator::Em => "em",
            Operator::Nem => "nem",
            Operator::Cts => "cts",
            Operator::Aeq => "aeq",
            Operator::Act => "act",
        }
    }

    /// Only the whole-array operators take an array literal.
    pub fn takes_array(&self) -> bool {
        matches!(self, Operator::Aeq | Operator::Act)
    }

    pub fn allows_empty(&self) -> bool {
        matches!(self, Operator::Em | Operator::Nem)
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed filter operand.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FilterValue {
    Null,
    Bool(bool),
    Text(String),
    /// Comma-separated values.
    List(Vec<String>),
    /// Array literal, only for `aeq` / `act`.
    Array(Vec<Value>),
}

impl FilterValue {
    /// Single-value view; lists yield their elements.
    pub fn texts(&self) -> Vec<String> {
        match self {
            FilterValue::Null => Vec::new(),
            FilterValue::Bool(b) => vec![b.to_string()],
            FilterValue::Text(s) => vec![s.clone()],
            FilterValue::List(items) => items.clone(),
            FilterValue::Array(items) => items.iter().map(value_text).collect(),
        }
    }
}

impl std::fmt::Display for FilterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterValue::Null => f.write_str("null"),
            FilterValue::Bool(b) => write!(f, "{}", b),
            FilterValue::Text(s) => f.write_str(s),
            FilterValue::List(items) => f.write_str(&items.join(",")),
            FilterValue::Array(items) => write!(f, "{}", Value::Array(items.clone())),
        }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One `field op value` predicate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterLeaf {
    pub field: String,
    pub op: Operator,
    pub value: FilterValue,
}

impl FilterLeaf {
    pub fn new(field: impl Into<String>, op: Operator, value: FilterValue) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    /// Validate and build a leaf from wire text.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::InvalidQuery` when the operator is unknown or not in
    /// the category's vocabulary, when the value is empty (except `em`/`nem`),
    /// or when the value's array shape does not match the operator.
    pub fn parse(
        field: &str,
        category: TypeCategory,
        op: &str,
        raw: Option<&str>,
    ) -> Result<Self, ApiError> {
        let op = Operator::parse(op).ok_or_else(|| {
            ApiError::invalid_query(format!("unknown filter operator '{}' on '{}'", op, field))
        })?;

        if !vocabulary(category).contains(&op) {
            return Err(ApiError::invalid_query(format!(
                "operator '{}' is not supported for {} field '{}'",
                op,
                category.as_str(),
                field
            )));
        }

        let raw = raw.unwrap_or("").trim();
        if raw.is_empty() && !op.allows_empty() {
            return Err(ApiError::invalid_query(format!(
                "filter value for '{}' must not be empty",
                field
            )));
        }

        let array_shaped = raw.contains('[');
        if op.takes_array() && !array_shaped {
            return Err(ApiError::invalid_query(format!(
                "operator '{}' on '{}' needs an array value such as [a,b]",
                op, field
            )));
        }
        if !op.takes_array() && array_shaped {
            return Err(ApiError::invalid_query(format!(
                "operator '{}' on '{}' does not accept an array value",
                op, field
            )));
        }

        if op == Operator::Eq && raw == "null" {
            if !vocabulary(category).contains(&Operator::Isnull) {
                return Err(ApiError::invalid_query(format!(
                    "'eq null' is not supported for {} field '{}'",
                    category.as_str(),
                    field
                )));
            }
            return Ok(FilterLeaf::new(field, Operator::Isnull, FilterValue::Null));
        }

        let value = if raw.is_empty() {
            FilterValue::Null
        } else if array_shaped {
            FilterValue::Array(parse_array_literal(raw).ok_or_else(|| {
                ApiError::invalid_query(format!("malformed array value '{}' on '{}'", raw, field))
            })?)
        } else if raw.contains(',') {
            FilterValue::List(raw.split(',').map(|s| s.trim().to_string()).collect())
        } else if raw == "true" {
            FilterValue::Bool(true)
        } else if raw == "false" {
            FilterValue::Bool(false)
        } else {
            FilterValue::Text(raw.to_string())
        };

        if op == Operator::Bt && !matches!(&value, FilterValue::List(bounds) if bounds.len() == 2) {
            return Err(ApiError::invalid_query(format!(
                "operator 'bt' on '{}' needs two comma-separated bounds",
                field
            )));
        }

        Ok(FilterLeaf::new(field, op, value))
    }
}

impl std::fmt::Display for FilterLeaf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({} {} {})", self.field, self.op, self.value)
    }
}

/// Parse `[1,2]`, `['a','b']` or `[..],[..]` into a JSON array.
fn parse_array_literal(raw: &str) -> Option<Vec<Value>> {
    let candidates = [raw.to_string(), format!("[{}]", raw)];
    for candidate in candidates {
        for text in [candidate.clone(), candidate.replace('\'', "\"")] {
            if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&text) {
                return Some(items);
            }
        }
    }
    None
}

/// How a group combines its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    And,
    Or,
}

impl Combinator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Combinator::And => "and",
            Combinator::Or => "or",
        }
    }
}

/// Non-empty AND/OR group.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterGroup {
    combinator: Combinator,
    children: Vec<FilterExpr>,
}

impl FilterGroup {
    /// Returns `None` for an empty child list.
    pub fn new(combinator: Combinator, children: Vec<FilterExpr>) -> Option<Self> {
        if children.is_empty() {
            None
        } else {
            Some(Self {
                combinator,
                children,
            })
        }
    }

    pub fn combinator(&self) -> Combinator {
        self.combinator
    }

    pub fn children(&self) -> &[FilterExpr] {
        &self.children
    }
}

impl Serialize for FilterGroup {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.combinator.as_str(), &self.children)?;
        map.end()
    }
}

/// Leaf or group.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FilterExpr {
    Leaf(FilterLeaf),
    Group(FilterGroup),
}

impl FilterExpr {
    /// AND of the given children; `None` when empty.
    pub fn all(children: Vec<FilterExpr>) -> Option<Self> {
        FilterGroup::new(Combinator::And, children).map(FilterExpr::Group)
    }

    /// OR of the given children; `None` when empty.
    pub fn any(children: Vec<FilterExpr>) -> Option<Self> {
        FilterGroup::new(Combinator::Or, children).map(FilterExpr::Group)
    }

    /// Combine with AND, extending an existing AND group in place.
    pub fn and(self, other: FilterExpr) -> FilterExpr {
        match self {
            FilterExpr::Group(mut group) if group.combinator == Combinator::And => {
                group.children.push(other);
                FilterExpr::Group(group)
            }
            this => FilterExpr::Group(FilterGroup {
                combinator: Combinator::And,
                children: vec![this, other],
            }),
        }
    }

    /// Combine with OR, extending an existing OR group in place.
    pub fn or(self, other: FilterExpr) -> FilterExpr {
        match self {
            FilterExpr::Group(mut group) if group.combinator == Combinator::Or => {
                group.children.push(other);
                FilterExpr::Group(group)
            }
            this => FilterExpr::Group(FilterGroup {
                combinator: Combinator::Or,
                children: vec![this, other],
            }),
        }
    }

    /// First leaf on `field`, depth first.
    pub fn find_leaf(&self, field: &str) -> Option<&FilterLeaf> {
        match self {
            FilterExpr::Leaf(leaf) => (leaf.field == field).then_some(leaf),
            FilterExpr::Group(group) => group.children.iter().find_map(|c| c.find_leaf(field)),
        }
    }

    /// Children of a flat AND group of leaves.
    fn and_leaves_mut(&mut self) -> Option<&mut Vec<FilterExpr>> {
        match self {
            FilterExpr::Group(group)
                if group.combinator == Combinator::And
                    && group
                        .children
                        .iter()
                        .all(|c| matches!(c, FilterExpr::Leaf(_))) =>
            {
                Some(&mut group.children)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterExpr::Leaf(leaf) => write!(f, "{}", leaf),
            FilterExpr::Group(group) => {
                f.write_str("(")?;
                for (i, child) in group.children.iter().enumerate() {
                    if i > 0 {
                        write!(f, " {} ", group.combinator.as_str())?;
                    }
                    write!(f, "{}", child)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Remove and return the first leaf on `field` from a bare leaf or a flat AND group.
///
/// An emptied group collapses to `None`.
///
/// # Errors
///
/// Returns `ApiError::InternalConsistency` when the filter is anything other
/// than a bare leaf or a single AND group of leaves.
pub fn take_leaf(
    filter: &mut Option<FilterExpr>,
    field: &str,
) -> Result<Option<FilterLeaf>, ApiError> {
    let Some(expr) = filter.as_mut() else {
        return Ok(None);
    };
    if let FilterExpr::Leaf(leaf) = expr {
        if leaf.field != field {
            return Ok(None);
        }
        return Ok(match filter.take() {
            Some(FilterExpr::Leaf(leaf)) => Some(leaf),
            _ => None,
        });
    }
    let description = expr.to_string();
    let children = expr.and_leaves_mut().ok_or_else(|| {
        ApiError::internal(format!(
            "cannot take '{}' from filter {}: expected an AND group of leaves",
            field, description
        ))
    })?;

    let position = children
        .iter()
        .position(|c| matches!(c, FilterExpr::Leaf(leaf) if leaf.field == field));
    let Some(position) = position else {
        return Ok(None);
    };

    let taken = match children.remove(position) {
        FilterExpr::Leaf(leaf) => Some(leaf),
        FilterExpr::Group(_) => None,
    };
    if children.is_empty() {
        *filter = None;
    }
    Ok(taken)
}
