//! Record providers.
//!
//! Storage is owned by the caller: each resource type is backed by a
//! [`Provider`] that evaluates a compiled filter, sort and page. The crate
//! ships [`MemoryProvider`] for fixtures and the CLI.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::ApiError;
use crate::filter::{Combinator, FilterExpr, FilterLeaf, FilterValue, Operator};
use crate::relationship::ids_in;
use crate::types::{Limit, SortKey, ID_FIELD};

/// Opaque entity: an id, attribute values and optional meta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

fn deserialize_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "record id must be a string or number, got {}",
            crate::types::json_type_name(&other)
        ))),
    }
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Map::new(),
            meta: None,
        }
    }

    /// Build from a JSON object of attributes; anything else yields none.
    pub fn from_attributes(id: impl Into<String>, attributes: Value) -> Self {
        let attributes = match attributes {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id: id.into(),
            attributes,
            meta: None,
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Attribute value. Does not see `id`; use [`Record::field`] for that.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Field value including `id`.
    pub fn field(&self, name: &str) -> Option<Cow<'_, Value>> {
        if name == ID_FIELD {
            return Some(Cow::Owned(Value::String(self.id.clone())));
        }
        self.attributes.get(name).map(Cow::Borrowed)
    }
}

/// Async data source for one resource type.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Resource type served by this provider.
    fn type_name(&self) -> &str;

    /// Records matching `filter`, ordered by `sort`, paged by `skip`/`limit`.
    async fn fetch_many(
        &self,
        filter: Option<&FilterExpr>,
        skip: u64,
        limit: Limit,
        sort: &[SortKey],
    ) -> Result<Vec<Record>, ApiError>;

    /// Number of records matching `filter`, ignoring paging.
    async fn count(&self, filter: Option<&FilterExpr>) -> Result<u64, ApiError>;

    /// The single record matching `filter`.
    ///
    /// The default implementation fetches up to two rows and applies
    /// [`expect_single`].
    async fn fetch_scoped(&self, filter: &FilterExpr, label: &str) -> Result<Record, ApiError> {
        let records = self
            .fetch_many(Some(filter), 0, Limit::Bounded(2), &[])
            .await?;
        expect_single(records, label)
    }

    /// The record with `id`.
    async fn fetch_one(&self, id: &str) -> Result<Record, ApiError> {
        let filter = id_filter(id);
        let label = format!("{}/{}", self.type_name(), id);
        self.fetch_scoped(&filter, &label).await
    }
}

/// Leaf selecting one id.
pub fn id_filter(id: &str) -> FilterExpr {
    FilterExpr::Leaf(FilterLeaf::new(
        ID_FIELD,
        Operator::Eq,
        FilterValue::Text(id.to_string()),
    ))
}

/// AND an id leaf onto an optional filter.
pub fn scope_to_id(filter: Option<FilterExpr>, id: &str) -> FilterExpr {
    match filter {
        Some(expr) => expr.and(id_filter(id)),
        None => id_filter(id),
    }
}

/// Cardinality check for an id-scoped lookup.
///
/// # Errors
///
/// `NotFound` for zero records, `InternalConsistency` for more than one.
pub fn expect_single(mut records: Vec<Record>, label: &str) -> Result<Record, ApiError> {
    match records.len() {
        0 => Err(ApiError::not_found(label.to_string())),
        1 => Ok(records.remove(0)),
        n => Err(ApiError::internal(format!(
            "{} records returned for {}",
            n, label
        ))),
    }
}

/// Providers keyed by resource type.
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, provider: Arc<dyn Provider>) {
        self.providers
            .insert(provider.type_name().to_string(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn Provider>) -> Self {
        self.insert(provider);
        self
    }

    /// # Errors
    ///
    /// A registered type without a provider is an `InternalConsistency` error.
    pub fn get(&self, type_name: &str) -> Result<&Arc<dyn Provider>, ApiError> {
        self.providers
            .get(type_name)
            .ok_or_else(|| ApiError::internal(format!("no provider for type '{}'", type_name)))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.providers.contains_key(type_name)
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.providers.keys()).finish()
    }
}

/// To-one relationship a [`MemoryProvider`] can follow for `rel.field` sorts.
#[derive(Debug, Clone)]
struct Join {
    mapping_field: String,
    targets: Arc<Vec<Record>>,
}

/// Provider over an in-memory record list.
#[derive(Debug, Clone)]
pub struct MemoryProvider {
    type_name: String,
    records: Vec<Record>,
    joins: BTreeMap<String, Join>,
}

impl MemoryProvider {
    pub fn new(type_name: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            type_name: type_name.into(),
            records,
            joins: BTreeMap::new(),
        }
    }

    /// Resolve sort keys `relationship.field` through `mapping_field` into
    /// `targets`.
    pub fn with_join(
        mut self,
        relationship: impl Into<String>,
        mapping_field: impl Into<String>,
        targets: Arc<Vec<Record>>,
    ) -> Self {
        self.joins.insert(
            relationship.into(),
            Join {
                mapping_field: mapping_field.into(),
                targets,
            },
        );
        self
    }

    fn check_sort(&self, sort: &[SortKey]) -> Result<(), ApiError> {
        for key in sort {
            if let Some((rel, _)) = key.field.split_once('.') {
                if !self.joins.contains_key(rel) {
                    return Err(ApiError::internal(format!(
                        "memory provider for '{}' cannot sort by '{}'",
                        self.type_name, key.field
                    )));
                }
            }
        }
        Ok(())
    }

    /// Sort value of `key` for `record`, following a join for dotted keys.
    fn sort_value<'r>(&'r self, record: &'r Record, key: &str) -> Option<Cow<'r, Value>> {
        let Some((rel, field)) = key.split_once('.') else {
            return record.field(key);
        };
        let join = self.joins.get(rel)?;
        let target_id = ids_in(record.get(&join.mapping_field)).into_iter().next()?;
        join.targets
            .iter()
            .find(|t| t.id == target_id)
            .and_then(|t| t.field(field))
            .map(|v| Cow::Owned(v.into_owned()))
    }

    fn compare(&self, a: &Record, b: &Record, sort: &[SortKey]) -> Ordering {
        for key in sort {
            let left = self.sort_value(a, &key.field);
            let right = self.sort_value(b, &key.field);
            let ordering = compare_optional(left.as_deref(), right.as_deref());
            let ordering = if key.ascending {
                ordering
            } else {
                ordering.reverse()
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    fn matching(&self, filter: Option<&FilterExpr>) -> Vec<&Record> {
        self.records
            .iter()
            .filter(|r| filter.map_or(true, |f| matches_expr(r, f)))
            .collect()
    }
}

#[async_trait::async_trait]
impl Provider for MemoryProvider {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    async fn fetch_many(
        &self,
        filter: Option<&FilterExpr>,
        skip: u64,
        limit: Limit,
        sort: &[SortKey],
    ) -> Result<Vec<Record>, ApiError> {
        self.check_sort(sort)?;
        let mut rows = self.matching(filter);
        rows.sort_by(|a, b| self.compare(a, b, sort));

        let skip = usize::try_from(skip).unwrap_or(usize::MAX);
        let take = limit
            .as_count()
            .map_or(usize::MAX, |n| usize::try_from(n).unwrap_or(usize::MAX));
        Ok(rows.into_iter().skip(skip).take(take).cloned().collect())
    }

    async fn count(&self, filter: Option<&FilterExpr>) -> Result<u64, ApiError> {
        Ok(self.matching(filter).len() as u64)
    }
}

// --- Filter evaluation ---

fn matches_expr(record: &Record, expr: &FilterExpr) -> bool {
    match expr {
        FilterExpr::Leaf(leaf) => matches_leaf(record, leaf),
        FilterExpr::Group(group) => match group.combinator() {
            Combinator::And => group.children().iter().all(|c| matches_expr(record, c)),
            Combinator::Or => group.children().iter().any(|c| matches_expr(record, c)),
        },
    }
}

fn matches_leaf(record: &Record, leaf: &FilterLeaf) -> bool {
    let actual = record.field(&leaf.field);
    let actual = actual.as_deref().filter(|v| !v.is_null());
    let wanted = &leaf.value;

    match leaf.op {
        Operator::Isnull => actual.is_none(),
        Operator::Isnotnull => actual.is_some(),
        Operator::Em => actual.map_or(true, |v| as_list(v).is_empty()),
        Operator::Nem => actual.is_some_and(|v| !as_list(v).is_empty()),
        _ => {
            let Some(actual) = actual else {
                return leaf.op == Operator::Ne;
            };
            matches_present(actual, leaf.op, wanted)
        }
    }
}

fn matches_present(actual: &Value, op: Operator, wanted: &FilterValue) -> bool {
    let wanted_text = wanted.to_string();
    match op {
        Operator::Eq => equals(actual, &wanted_text),
        Operator::Ne => !equals(actual, &wanted_text),
        Operator::Gt => compare_text(actual, &wanted_text) == Ordering::Greater,
        Operator::Gte => compare_text(actual, &wanted_text) != Ordering::Less,
        Operator::Lt => compare_text(actual, &wanted_text) == Ordering::Less,
        Operator::Lte => compare_text(actual, &wanted_text) != Ordering::Greater,
        Operator::Bt => match wanted.texts().as_slice() {
            [low, high] => {
                compare_text(actual, low) != Ordering::Less
                    && compare_text(actual, high) != Ordering::Greater
            }
            _ => false,
        },
        Operator::In => {
            let set = wanted.texts();
            as_list(actual).iter().any(|a| set.contains(a))
        }
        Operator::Ct => match actual {
            Value::Array(_) => {
                let items = as_list(actual);
                wanted.texts().iter().any(|w| items.contains(w))
            }
            other => text_of(other).contains(&wanted_text),
        },
        Operator::Sw => text_of(actual).starts_with(&wanted_text),
        Operator::Ew => text_of(actual).ends_with(&wanted_text),
        Operator::Cts => {
            let items = as_list(actual);
            wanted.texts().iter().all(|w| items.contains(w))
        }
        Operator::Aeq => match wanted {
            FilterValue::Array(literal) => normalize(actual) == normalize(&Value::Array(literal.clone())),
            _ => false,
        },
        Operator::Act => match (actual, wanted) {
            (Value::Array(items), FilterValue::Array(literal)) => {
                let items: Vec<Value> = items.iter().map(normalize).collect();
                literal.iter().map(normalize).all(|w| items.contains(&w))
            }
            _ => false,
        },
        Operator::Isnull | Operator::Isnotnull | Operator::Em | Operator::Nem => false,
    }
}

/// Scalar equality; a list matches when any member is equal.
fn equals(actual: &Value, wanted: &str) -> bool {
    match actual {
        Value::Array(_) => as_list(actual).iter().any(|a| a == wanted),
        Value::Number(_) => compare_text(actual, wanted) == Ordering::Equal,
        other => text_of(other) == wanted,
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(text_of).collect(),
        Value::Null => Vec::new(),
        other => vec![text_of(other)],
    }
}

/// Numbers and numeric strings become strings so `[1]` equals `['1']`.
fn normalize(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Number(n) => Value::String(n.to_string()),
        other => other.clone(),
    }
}

fn compare_text(actual: &Value, wanted: &str) -> Ordering {
    compare_scalars(&text_of(actual), wanted)
}

/// Numeric when both sides parse as numbers, lexicographic otherwise.
fn compare_scalars(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

/// Nulls sort first.
fn compare_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => compare_scalars(&text_of(x), &text_of(y)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeCategory;
    use serde_json::json;

    fn fixture() -> MemoryProvider {
        MemoryProvider::new(
            "items",
            vec![
                Record::from_attributes("1", json!({"name": "apple", "count": 10, "tags": ["red", "fruit"]})),
                Record::from_attributes("2", json!({"name": "banana", "count": 2, "tags": ["yellow", "fruit"]})),
                Record::from_attributes("3", json!({"name": "carrot", "count": null, "tags": []})),
                Record::from_attributes("10", json!({"name": "车", "count": 7})),
            ],
        )
    }

    fn leaf(field: &str, category: TypeCategory, op: &str, value: &str) -> FilterExpr {
        FilterExpr::Leaf(FilterLeaf::parse(field, category, op, Some(value)).unwrap())
    }

    async fn ids(provider: &MemoryProvider, filter: Option<&FilterExpr>, sort: &[SortKey]) -> Vec<String> {
        provider
            .fetch_many(filter, 0, Limit::Unbounded, sort)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect()
    }

    #[tokio::test]
    async fn evaluates_text_operators() {
        let p = fixture();
        let f = leaf("name", TypeCategory::String, "ct", "车");
        assert_eq!(ids(&p, Some(&f), &[]).await, vec!["10"]);
        let f = leaf("name", TypeCategory::String, "sw", "ba");
        assert_eq!(ids(&p, Some(&f), &[]).await, vec!["2"]);
        let f = leaf("name", TypeCategory::String, "ew", "ot");
        assert_eq!(ids(&p, Some(&f), &[]).await, vec!["3"]);
        let f = leaf("name", TypeCategory::String, "in", "apple,carrot");
        assert_eq!(ids(&p, Some(&f), &[]).await, vec!["1", "3"]);
    }

    #[tokio::test]
    async fn evaluates_numeric_operators() {
        let p = fixture();
        let f = leaf("count", TypeCategory::Numeric, "gt", "5");
        assert_eq!(ids(&p, Some(&f), &[]).await, vec!["1", "10"]);
        let f = leaf("count", TypeCategory::Numeric, "bt", "2,7");
        assert_eq!(ids(&p, Some(&f), &[]).await, vec!["2", "10"]);
        let f = leaf("count", TypeCategory::Numeric, "eq", "null");
        assert_eq!(ids(&p, Some(&f), &[]).await, vec!["3"]);
        let f = leaf("count", TypeCategory::Numeric, "isnotnull", "true");
        assert_eq!(ids(&p, Some(&f), &[]).await, vec!["1", "2", "10"]);
        let f = leaf("count", TypeCategory::Numeric, "ne", "10");
        assert_eq!(ids(&p, Some(&f), &[]).await, vec!["2", "3", "10"]);
    }

    #[tokio::test]
    async fn evaluates_list_operators() {
        let p = fixture();
        let f = leaf("tags", TypeCategory::List, "ct", "red,yellow");
        assert_eq!(ids(&p, Some(&f), &[]).await, vec!["1", "2"]);
        let f = leaf("tags", TypeCategory::List, "cts", "red,fruit");
        assert_eq!(ids(&p, Some(&f), &[]).await, vec!["1"]);
        let f = FilterExpr::Leaf(FilterLeaf::parse("tags", TypeCategory::List, "em", None).unwrap());
        assert_eq!(ids(&p, Some(&f), &[]).await, vec!["3", "10"]);
        let f = FilterExpr::Leaf(FilterLeaf::parse("tags", TypeCategory::List, "nem", None).unwrap());
        assert_eq!(ids(&p, Some(&f), &[]).await, vec!["1", "2"]);
        let f = leaf("tags", TypeCategory::List, "aeq", "['yellow','fruit']");
        assert_eq!(ids(&p, Some(&f), &[]).await, vec!["2"]);
        let f = leaf("tags", TypeCategory::List, "act", "['fruit']");
        assert_eq!(ids(&p, Some(&f), &[]).await, vec!["1", "2"]);
        let f = leaf("tags", TypeCategory::List, "eq", "red");
        assert_eq!(ids(&p, Some(&f), &[]).await, vec!["1"]);
    }

    #[tokio::test]
    async fn evaluates_groups() {
        let p = fixture();
        let f = FilterExpr::any(vec![
            leaf("name", TypeCategory::String, "eq", "apple"),
            FilterExpr::all(vec![
                leaf("count", TypeCategory::Numeric, "lt", "5"),
                leaf("tags", TypeCategory::List, "ct", "fruit"),
            ])
            .unwrap(),
        ])
        .unwrap();
        assert_eq!(ids(&p, Some(&f), &[]).await, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn sorts_numeric_aware_nulls_first() {
        let p = fixture();
        assert_eq!(
            ids(&p, None, &[SortKey::asc("count")]).await,
            vec!["3", "2", "10", "1"]
        );
        assert_eq!(
            ids(&p, None, &[SortKey::desc("count")]).await,
            vec!["1", "10", "2", "3"]
        );
        assert_eq!(
            ids(&p, None, &[SortKey::asc("id")]).await,
            vec!["1", "2", "3", "10"]
        );
    }

    #[tokio::test]
    async fn sorts_through_joined_relationship() {
        let owners = Arc::new(vec![
            Record::from_attributes("o1", json!({"name": "zed"})),
            Record::from_attributes("o2", json!({"name": "amy"})),
        ]);
        let p = MemoryProvider::new(
            "items",
            vec![
                Record::from_attributes("1", json!({"owner_id": "o1"})),
                Record::from_attributes("2", json!({"owner_id": "o2"})),
                Record::from_attributes("3", json!({})),
            ],
        )
        .with_join("owner", "owner_id", owners);

        assert_eq!(
            ids(&p, None, &[SortKey::asc("owner.name"), SortKey::asc("id")]).await,
            vec!["3", "2", "1"]
        );
        assert_eq!(
            ids(&p, None, &[SortKey::desc("owner.name")]).await,
            vec!["1", "2", "3"]
        );
    }

    #[tokio::test]
    async fn rejects_sort_through_unknown_join() {
        let err = fixture()
            .fetch_many(None, 0, Limit::Unbounded, &[SortKey::asc("owner.name")])
            .await
            .unwrap_err();
        assert_eq!(err.status(), 500);
        assert!(err.to_string().contains("owner.name"));
    }

    #[tokio::test]
    async fn paginates_and_counts() {
        let p = fixture();
        let page = p
            .fetch_many(None, 1, Limit::Bounded(2), &[SortKey::asc("id")])
            .await
            .unwrap();
        assert_eq!(page.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["2", "3"]);

        let f = leaf("tags", TypeCategory::List, "ct", "fruit");
        assert_eq!(p.count(Some(&f)).await.unwrap(), 2);
        assert_eq!(p.count(None).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn fetch_one_checks_cardinality() {
        let p = fixture();
        assert_eq!(p.fetch_one("2").await.unwrap().id, "2");

        let err = p.fetch_one("99").await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound { ref detail } if detail == "items/99"));

        let twins = MemoryProvider::new(
            "items",
            vec![Record::new("7"), Record::new("7")],
        );
        let err = twins.fetch_one("7").await.unwrap_err();
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn scope_to_id_ands_leaf() {
        let base = leaf("name", TypeCategory::String, "ct", "a");
        assert_eq!(
            scope_to_id(Some(base), "5").to_string(),
            "((name ct a) and (id eq 5))"
        );
        assert_eq!(scope_to_id(None, "5").to_string(), "(id eq 5)");
    }

    #[test]
    fn record_deserializes_numeric_id() {
        let record: Record =
            serde_json::from_value(json!({"id": 42, "attributes": {"name": "x"}})).unwrap();
        assert_eq!(record.id, "42");
        assert_eq!(record.get("name"), Some(&json!("x")));
        assert!(serde_json::from_value::<Record>(json!({"id": true})).is_err());
    }

    #[test]
    fn provider_set_lookup() {
        let set = ProviderSet::new().with(Arc::new(fixture()));
        assert!(set.contains("items"));
        assert!(set.get("items").is_ok());
        assert!(matches!(
            set.get("ghosts"),
            Err(ApiError::InternalConsistency { .. })
        ));
    }
}
