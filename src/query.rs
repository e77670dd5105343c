//! Query compiler: raw request parameters to validated [`QueryArgs`].
//!
//! Compilation is pure and atomic. Either every parameter validates against
//! the registry and a complete `QueryArgs` comes back, or the first problem
//! is reported as `ApiError::InvalidQuery` and nothing is fetched.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use url::form_urlencoded;

use crate::codec;
use crate::error::ApiError;
use crate::filter::{FilterExpr, FilterLeaf, Operator};
use crate::registry::{Registry, ResourceSchema};
use crate::types::{
    Limit, SortKey, TypeCategory, ID_FIELD, MAX_PATH_DEPTH, PARAM_DATA, PARAM_FIELDS,
    PARAM_FILTER, PARAM_INCLUDE, PARAM_PAGE_LIMIT, PARAM_PAGE_OFFSET, PARAM_SORT,
    UNBOUNDED_TOKEN,
};

/// Which endpoint a request targets; selects the parameter whitelist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Collection,
    Single,
    Related,
}

const COLLECTION_PARAMS: &[&str] = &[
    PARAM_FILTER,
    PARAM_SORT,
    PARAM_PAGE_OFFSET,
    PARAM_PAGE_LIMIT,
    PARAM_FIELDS,
    PARAM_INCLUDE,
    PARAM_DATA,
];

const SINGLE_PARAMS: &[&str] = &[PARAM_INCLUDE, PARAM_DATA, PARAM_FIELDS];

impl Endpoint {
    pub fn accepts(&self, name: &str) -> bool {
        let whitelist = match self {
            Endpoint::Collection | Endpoint::Related => COLLECTION_PARAMS,
            Endpoint::Single => SINGLE_PARAMS,
        };
        whitelist.contains(&name) || typed_fieldset_name(name).is_some()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Collection => "collection",
            Endpoint::Single => "single",
            Endpoint::Related => "related",
        }
    }
}

/// `fields[articles]` -> `articles`.
fn typed_fieldset_name(name: &str) -> Option<&str> {
    name.strip_prefix("fields[")?
        .strip_suffix(']')
        .filter(|t| !t.is_empty() && !t.contains(['[', ']']))
}

/// Decoded request parameters; repeated names keep their order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawParams {
    pairs: Vec<(String, String)>,
}

impl RawParams {
    /// Parse a raw query string. A leading `?` is ignored.
    pub fn parse(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        Self {
            pairs: form_urlencoded::parse(query.as_bytes())
                .filter(|(k, _)| !k.is_empty())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
        }
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            pairs: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in request order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Compiled query for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryArgs {
    pub filter: Option<FilterExpr>,
    pub sort: Vec<SortKey>,
    pub skip: u64,
    pub limit: Limit,
    pub include: Vec<String>,
    pub data: Vec<String>,
    /// Sparse fieldsets: type -> field names.
    pub fields: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl QueryArgs {
    /// Defaults for `schema` with nothing requested.
    pub fn defaults(schema: &ResourceSchema) -> Self {
        Self {
            filter: None,
            sort: with_trailing_id(schema.defaults.sort.clone()),
            skip: schema.defaults.offset,
            limit: schema.defaults.limit,
            include: Vec::new(),
            data: Vec::new(),
            fields: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    pub fn fieldset(&self, type_name: &str) -> Option<&[String]> {
        self.fields.get(type_name).map(Vec::as_slice)
    }
}

/// Compile `params` for `type_name` at `endpoint`.
///
/// # Errors
///
/// `ApiError::InvalidQuery` for any parameter that does not validate against
/// the registry; `ApiError::InternalConsistency` when `type_name` is not
/// registered.
pub fn compile(
    registry: &Registry,
    type_name: &str,
    endpoint: Endpoint,
    params: &RawParams,
) -> Result<QueryArgs, ApiError> {
    let schema = registry.schema(type_name)?;

    for (name, _) in params.pairs() {
        if !endpoint.accepts(name) {
            return Err(ApiError::invalid_query(format!(
                "unknown parameter '{}'",
                name
            )));
        }
    }

    let mut args = QueryArgs::defaults(schema);

    if endpoint != Endpoint::Single {
        args.filter = compile_filter(schema, &params.get_all(PARAM_FILTER), &mut args.warnings)?;
        if let Some(raw) = params.get(PARAM_SORT) {
            args.sort = with_trailing_id(compile_sort(registry, schema, raw)?);
        }
        if let Some(raw) = params.get(PARAM_PAGE_OFFSET) {
            args.skip = parse_count(PARAM_PAGE_OFFSET, raw)?;
        }
        if let Some(raw) = params.get(PARAM_PAGE_LIMIT) {
            args.limit = compile_limit(schema, raw)?;
        }
    }

    if let Some(raw) = params.get(PARAM_INCLUDE) {
        args.include = compile_paths(registry, schema, PARAM_INCLUDE, raw)?;
    }
    if let Some(raw) = params.get(PARAM_DATA) {
        args.data = compile_paths(registry, schema, PARAM_DATA, raw)?;
    }
    args.fields = compile_fields(registry, params)?;

    tracing::debug!(
        type_name,
        endpoint = endpoint.as_str(),
        filter = %args.filter.as_ref().map(ToString::to_string).unwrap_or_default(),
        include = ?args.include,
        "query compiled"
    );
    Ok(args)
}

fn compile_filter(
    schema: &ResourceSchema,
    occurrences: &[&str],
    warnings: &mut Vec<String>,
) -> Result<Option<FilterExpr>, ApiError> {
    let mut groups = Vec::with_capacity(occurrences.len());

    for raw in occurrences {
        let map = codec::decode(raw);
        let mut leaves = Vec::with_capacity(map.len());
        for (field, spec) in &map {
            let leaf = compile_leaf(schema, field, spec)?;
            if leaf.op == Operator::Eq
                && schema.field_category(&leaf.field) == Some(TypeCategory::List)
            {
                warnings.push(format!(
                    "operator 'eq' on list field '{}' is deprecated, use 'ct' instead",
                    field
                ));
            }
            leaves.push(FilterExpr::Leaf(leaf));
        }
        let group = FilterExpr::all(leaves).ok_or_else(|| {
            ApiError::invalid_query("filter parameter names no fields".to_string())
        })?;
        groups.push(group);
    }

    Ok(match groups.len() {
        0 => None,
        1 => groups.pop(),
        _ => FilterExpr::any(groups),
    })
}

fn compile_leaf(schema: &ResourceSchema, field: &str, spec: &Value) -> Result<FilterLeaf, ApiError> {
    let Value::Object(spec) = spec else {
        return Err(ApiError::invalid_query(format!(
            "filter on '{}' must carry op and value, e.g. {}[op]=eq&{}[value]=x",
            field, field, field
        )));
    };
    let op = match spec.get("op") {
        Some(Value::String(op)) => op.as_str(),
        Some(_) => {
            return Err(ApiError::invalid_query(format!(
                "filter op on '{}' must be a single operator",
                field
            )))
        }
        None => {
            return Err(ApiError::invalid_query(format!(
                "filter on '{}' is missing op",
                field
            )))
        }
    };
    let value = match spec.get("value") {
        None => None,
        Some(Value::String(v)) => Some(v.as_str()),
        Some(_) => {
            return Err(ApiError::invalid_query(format!(
                "filter value on '{}' must be a single string",
                field
            )))
        }
    };

    let (target_field, category) = resolve_filter_field(schema, field)?;
    FilterLeaf::parse(target_field, category, op, value)
}

/// Map a wire filter field to a schema attribute. `rel.id` resolves to the
/// relationship's mapping field.
fn resolve_filter_field<'a>(
    schema: &'a ResourceSchema,
    field: &'a str,
) -> Result<(&'a str, TypeCategory), ApiError> {
    let unsupported = || ApiError::invalid_query(format!("unsupported filter field '{}'", field));

    let Some((rel_name, rel_field)) = field.split_once('.') else {
        let category = schema.field_category(field).ok_or_else(unsupported)?;
        return Ok((field, category));
    };

    if rel_field != ID_FIELD {
        return Err(unsupported());
    }
    let mapping = schema
        .get_relationship(rel_name)
        .and_then(|rel| rel.mapping_field())
        .ok_or_else(unsupported)?;
    let category = schema.field_category(mapping).ok_or_else(unsupported)?;
    Ok((mapping, category))
}

fn compile_sort(
    registry: &Registry,
    schema: &ResourceSchema,
    raw: &str,
) -> Result<Vec<SortKey>, ApiError> {
    let mut keys = Vec::new();
    for token in raw.split(',') {
        let key = SortKey::parse(token)
            .ok_or_else(|| ApiError::invalid_query(format!("empty sort key in '{}'", raw)))?;
        let name = key.field.as_str();
        let not_sortable =
            || ApiError::invalid_query(format!("'{}' cannot be used as a sort key", name));

        match name.split_once('.') {
            None => {
                if schema.field_category(name).is_none() {
                    return Err(not_sortable());
                }
            }
            Some((rel_name, rel_field)) => {
                if rel_field.contains('.') {
                    return Err(ApiError::invalid_query(format!(
                        "sort key '{}' is nested too deep, only rel.field is supported",
                        name
                    )));
                }
                let rel = schema.get_relationship(rel_name).ok_or_else(not_sortable)?;
                let target = registry.schema(&rel.target)?;
                if target.field_category(rel_field).is_none() {
                    return Err(not_sortable());
                }
            }
        }

        keys.push(key);
    }
    Ok(keys)
}

/// Append the ascending `id` tiebreak.
fn with_trailing_id(mut keys: Vec<SortKey>) -> Vec<SortKey> {
    keys.push(SortKey::asc(ID_FIELD));
    keys
}

fn parse_count(name: &str, raw: &str) -> Result<u64, ApiError> {
    raw.trim().parse::<u64>().map_err(|_| {
        ApiError::invalid_query(format!("{} must be a non-negative integer, got '{}'", name, raw))
    })
}

fn compile_limit(schema: &ResourceSchema, raw: &str) -> Result<Limit, ApiError> {
    let raw = raw.trim();
    if raw == UNBOUNDED_TOKEN || raw == "null" {
        return if schema.defaults.allow_unbounded {
            Ok(Limit::Unbounded)
        } else {
            Err(ApiError::invalid_query(format!(
                "{} cannot be unbounded for '{}'",
                PARAM_PAGE_LIMIT, schema.type_name
            )))
        };
    }
    parse_count(PARAM_PAGE_LIMIT, raw).map(Limit::Bounded)
}

/// Validate a comma list of dotted relationship paths.
fn compile_paths(
    registry: &Registry,
    schema: &ResourceSchema,
    param: &str,
    raw: &str,
) -> Result<Vec<String>, ApiError> {
    let mut paths: Vec<String> = Vec::new();

    for path in raw.split(',').map(|p| p.trim().replace('-', "_")) {
        if path.is_empty() {
            continue;
        }
        let segments: Vec<&str> = path.split('.').collect();
        if segments.len() > MAX_PATH_DEPTH {
            return Err(ApiError::invalid_query(format!(
                "{} path '{}' is deeper than {} levels",
                param, path, MAX_PATH_DEPTH
            )));
        }

        let mut current = schema;
        for segment in &segments {
            let rel = current.get_relationship(segment).ok_or_else(|| {
                ApiError::invalid_query(format!(
                    "{} path '{}' has unknown relationship '{}'",
                    param, path, segment
                ))
            })?;
            current = registry.schema(&rel.target)?;
        }

        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    Ok(paths)
}

fn compile_fields(
    registry: &Registry,
    params: &RawParams,
) -> Result<BTreeMap<String, Vec<String>>, ApiError> {
    let mut requested: Vec<(String, String)> = Vec::new();

    for raw in params.get_all(PARAM_FIELDS) {
        for (type_name, names) in codec::decode(raw) {
            match names {
                Value::String(names) => requested.push((type_name, names)),
                _ => {
                    return Err(ApiError::invalid_query(format!(
                        "fields for '{}' must be a comma-separated list",
                        type_name
                    )))
                }
            }
        }
    }
    for (name, value) in params.pairs() {
        if let Some(type_name) = typed_fieldset_name(name) {
            requested.push((type_name.to_string(), value.to_string()));
        }
    }

    let mut fields: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (type_name, names) in requested {
        let schema = registry
            .get(&type_name)
            .ok_or_else(|| ApiError::invalid_query(format!("unknown resource type '{}'", type_name)))?;
        let entry = fields.entry(type_name.clone()).or_default();
        for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if !schema.has_field(name) {
                return Err(ApiError::invalid_query(format!(
                    "unknown field '{}.{}'",
                    type_name, name
                )));
            }
            if !entry.iter().any(|n| n == name) {
                entry.push(name.to_string());
            }
        }
    }
    Ok(fields)
}
