//! Relationship descriptors: the static declaration of one named edge.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::filter::{FilterExpr, FilterLeaf, FilterValue, Operator};
use crate::provider::Record;
use crate::types::{Cardinality, ID_FIELD};

/// Computed linkage between owners and targets.
///
/// Implementations derive a target filter from a batch of owners and decide
/// which fetched targets belong to which owner.
pub trait RelationCondition: Send + Sync + fmt::Debug {
    /// Filter selecting the targets of every owner in `owners`.
    ///
    /// `None` means no target can match and the fetch is skipped.
    fn condition(&self, owners: &[Record]) -> Option<FilterExpr>;

    /// Whether `target` belongs to `owner`.
    fn links(&self, owner: &Record, target: &Record) -> bool;
}

/// Targets whose `field` holds, or contains, the owner id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseField {
    field: String,
}

impl ReverseField {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }
}

impl RelationCondition for ReverseField {
    fn condition(&self, owners: &[Record]) -> Option<FilterExpr> {
        let ids = unique(owners.iter().map(|o| o.id.clone()));
        id_set_leaf(&self.field, ids)
    }

    fn links(&self, owner: &Record, target: &Record) -> bool {
        ids_in(target.get(&self.field)).iter().any(|id| *id == owner.id)
    }
}

/// How a relationship locates its targets.
#[derive(Clone)]
pub enum FetchMode {
    /// Owner attribute holding the target id or id list.
    MappingField(String),
    Condition(Arc<dyn RelationCondition>),
}

impl fmt::Debug for FetchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchMode::MappingField(field) => f.debug_tuple("MappingField").field(field).finish(),
            FetchMode::Condition(cond) => f.debug_tuple("Condition").field(cond).finish(),
        }
    }
}

/// Which links and endpoints a relationship exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visibility {
    pub self_link: bool,
    pub related_link: bool,
    pub exposes_api: bool,
}

impl Default for Visibility {
    fn default() -> Self {
        Self {
            self_link: true,
            related_link: true,
            exposes_api: true,
        }
    }
}

/// Static declaration of a relationship from an owner type to a target type.
#[derive(Debug, Clone)]
pub struct RelationshipDescriptor {
    pub target: String,
    pub cardinality: Cardinality,
    pub fetch: FetchMode,
    pub visibility: Visibility,
    pub mutable: bool,
    pub required: bool,
    /// Cap on records fetched when the relationship is included.
    pub include_limit: Option<u64>,
    pub meta: Option<Value>,
}

impl RelationshipDescriptor {
    fn new(target: impl Into<String>, fetch: FetchMode) -> Self {
        Self {
            target: target.into(),
            cardinality: Cardinality::One,
            fetch,
            visibility: Visibility::default(),
            mutable: true,
            required: false,
            include_limit: None,
            meta: None,
        }
    }

    /// Relationship resolved through an owner attribute.
    pub fn mapping(target: impl Into<String>, field: impl Into<String>) -> Self {
        Self::new(target, FetchMode::MappingField(field.into()))
    }

    /// Relationship resolved through a computed condition.
    pub fn condition(target: impl Into<String>, condition: Arc<dyn RelationCondition>) -> Self {
        Self::new(target, FetchMode::Condition(condition))
    }

    pub fn many(mut self) -> Self {
        self.cardinality = Cardinality::Many;
        self
    }

    pub fn with_include_limit(mut self, limit: u64) -> Self {
        self.include_limit = Some(limit);
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn mapping_field(&self) -> Option<&str> {
        match &self.fetch {
            FetchMode::MappingField(field) => Some(field),
            FetchMode::Condition(_) => None,
        }
    }

    pub fn is_many(&self) -> bool {
        self.cardinality == Cardinality::Many
    }

    /// Filter selecting the targets of all `owners`, or `None` when nothing
    /// can match.
    pub fn target_filter(&self, owners: &[Record]) -> Option<FilterExpr> {
        match &self.fetch {
            FetchMode::MappingField(field) => {
                let ids = unique(owners.iter().flat_map(|o| ids_in(o.get(field))));
                id_set_leaf(ID_FIELD, ids)
            }
            FetchMode::Condition(cond) => cond.condition(owners),
        }
    }

    /// Whether `target` is linked from `owner` through this relationship.
    pub fn links(&self, owner: &Record, target: &Record) -> bool {
        match &self.fetch {
            FetchMode::MappingField(field) => ids_in(owner.get(field)).contains(&target.id),
            FetchMode::Condition(cond) => cond.links(owner, target),
        }
    }
}

/// Ids held by an attribute value: a scalar, a list, or nothing.
pub fn ids_in(value: Option<&Value>) -> Vec<String> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().filter_map(id_text).collect(),
        Some(other) => id_text(other).into_iter().collect(),
    }
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn unique(ids: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    ids.filter(|id| seen.insert(id.clone())).collect()
}

fn id_set_leaf(field: &str, ids: Vec<String>) -> Option<FilterExpr> {
    if ids.is_empty() {
        return None;
    }
    Some(FilterExpr::Leaf(FilterLeaf::new(
        field,
        Operator::In,
        FilterValue::List(ids),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, attrs: Value) -> Record {
        Record::from_attributes(id, attrs)
    }

    #[test]
    fn mapping_target_filter_dedups_ids() {
        let rel = RelationshipDescriptor::mapping("users", "user_id");
        let owners = vec![
            record("1", json!({"user_id": "7"})),
            record("2", json!({"user_id": 7})),
            record("3", json!({"user_id": null})),
        ];
        let filter = rel.target_filter(&owners).unwrap();
        assert_eq!(filter.to_string(), "(id in 7)");
    }

    #[test]
    fn mapping_list_field() {
        let rel = RelationshipDescriptor::mapping("tags", "tag_ids").many();
        let owner = record("1", json!({"tag_ids": ["a", "b"]}));
        assert_eq!(
            rel.target_filter(std::slice::from_ref(&owner))
                .unwrap()
                .to_string(),
            "(id in a,b)"
        );
        assert!(rel.links(&owner, &record("b", json!({}))));
        assert!(!rel.links(&owner, &record("c", json!({}))));
        assert!(rel.is_many());
    }

    #[test]
    fn mapping_without_ids_skips_fetch() {
        let rel = RelationshipDescriptor::mapping("users", "user_id");
        assert!(rel.target_filter(&[record("1", json!({}))]).is_none());
        assert!(rel.target_filter(&[]).is_none());
    }

    #[test]
    fn reverse_field_condition() {
        let rel = RelationshipDescriptor::condition("comments", Arc::new(ReverseField::new("post_id")))
            .many();
        let owners = vec![record("p1", json!({})), record("p2", json!({}))];
        assert_eq!(
            rel.target_filter(&owners).unwrap().to_string(),
            "(post_id in p1,p2)"
        );
        assert!(rel.mapping_field().is_none());

        let comment = record("c1", json!({"post_id": "p2"}));
        assert!(rel.links(&owners[1], &comment));
        assert!(!rel.links(&owners[0], &comment));
    }

    #[test]
    fn reverse_field_matches_list_members() {
        let cond = ReverseField::new("owners");
        let target = record("t", json!({"owners": ["u1", "u2"]}));
        assert!(cond.links(&record("u2", json!({})), &target));
        assert!(!cond.links(&record("u3", json!({})), &target));
    }

    #[test]
    fn builder_flags() {
        let rel = RelationshipDescriptor::mapping("users", "user_id")
            .with_include_limit(5)
            .with_meta(json!({"note": "owner"}))
            .with_visibility(Visibility {
                self_link: false,
                ..Visibility::default()
            });
        assert_eq!(rel.include_limit, Some(5));
        assert_eq!(rel.meta, Some(json!({"note": "owner"})));
        assert!(!rel.visibility.self_link);
        assert!(rel.visibility.related_link);
        assert_eq!(rel.mapping_field(), Some("user_id"));
    }

    #[test]
    fn ids_in_ignores_non_scalars() {
        assert_eq!(ids_in(Some(&json!([1, "x", null, {"a": 1}]))), vec!["1", "x"]);
        assert!(ids_in(Some(&json!(true))).is_empty());
        assert!(ids_in(None).is_empty());
    }
}
