//! Registry and fixture loading.
//!
//! Registries are declared in JSON and loaded from files, strings, or
//! HTTP URLs. Record fixtures back a [`MemoryProvider`] per type.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{LoadError, RegistryError};
use crate::provider::{MemoryProvider, ProviderSet, Record};
use crate::registry::{Registry, ResourceSchema};
use crate::relationship::{RelationshipDescriptor, ReverseField, Visibility};
use crate::types::{Cardinality, Limit, SortKey, TypeCategory, UNBOUNDED_TOKEN};

#[cfg(feature = "remote")]
use std::time::Duration;

/// Default timeout for HTTP requests (10 seconds).
#[cfg(feature = "remote")]
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryDecl {
    resources: Vec<ResourceDecl>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceDecl {
    #[serde(rename = "type")]
    type_name: String,
    link: Option<String>,
    #[serde(default)]
    attributes: BTreeMap<String, AttributeDecl>,
    #[serde(default)]
    relationships: BTreeMap<String, RelationshipDecl>,
    #[serde(default)]
    defaults: DefaultsDecl,
    parent: Option<String>,
}

/// `"string"` or `{"category": "string", "hidden": true}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AttributeDecl {
    Category(TypeCategory),
    Full {
        category: TypeCategory,
        #[serde(default)]
        hidden: bool,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RelationshipDecl {
    target: String,
    #[serde(default)]
    cardinality: Cardinality,
    mapping_field: Option<String>,
    condition: Option<ConditionDecl>,
    #[serde(default)]
    links: LinksDecl,
    #[serde(default = "yes")]
    api: bool,
    #[serde(default = "yes")]
    mutable: bool,
    #[serde(default)]
    required: bool,
    include_limit: Option<u64>,
    meta: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ConditionDecl {
    /// Target records whose `field` holds the owner id.
    Reverse(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LinksDecl {
    #[serde(rename = "self", default = "yes")]
    self_link: bool,
    #[serde(default = "yes")]
    related: bool,
}

impl Default for LinksDecl {
    fn default() -> Self {
        Self {
            self_link: true,
            related: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefaultsDecl {
    sort: Option<String>,
    offset: Option<u64>,
    limit: Option<LimitDecl>,
    #[serde(default)]
    allow_unbounded: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LimitDecl {
    Count(u64),
    Token(String),
}

fn yes() -> bool {
    true
}

fn declaration_error(message: impl Into<String>) -> LoadError {
    LoadError::Registry(RegistryError::InvalidDeclaration {
        message: message.into(),
    })
}

impl ResourceDecl {
    fn into_schema(self) -> Result<ResourceSchema, LoadError> {
        let link = self
            .link
            .unwrap_or_else(|| format!("/{}", self.type_name));
        let mut schema = ResourceSchema::new(self.type_name, link);

        for (name, attr) in self.attributes {
            schema = match attr {
                AttributeDecl::Category(category) => schema.attribute(name, category),
                AttributeDecl::Full {
                    category,
                    hidden: false,
                } => schema.attribute(name, category),
                AttributeDecl::Full {
                    category,
                    hidden: true,
                } => schema.hidden_attribute(name, category),
            };
        }

        for (name, decl) in self.relationships {
            let rel = decl.into_descriptor(&schema.type_name, &name)?;
            schema = schema.relationship(name, rel);
        }

        let defaults = self.defaults;
        if let Some(sort) = defaults.sort.as_deref() {
            let keys = sort
                .split(',')
                .map(|token| {
                    SortKey::parse(token).ok_or_else(|| {
                        declaration_error(format!(
                            "empty key in default sort '{}' on '{}'",
                            sort, schema.type_name
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            schema = schema.default_sort(keys);
        }
        if let Some(offset) = defaults.offset {
            schema = schema.default_offset(offset);
        }
        if let Some(limit) = defaults.limit {
            let limit = match limit {
                LimitDecl::Count(n) => Limit::Bounded(n),
                LimitDecl::Token(token) if token == UNBOUNDED_TOKEN || token == "null" => {
                    Limit::Unbounded
                }
                LimitDecl::Token(token) => {
                    return Err(declaration_error(format!(
                        "default limit '{}' on '{}' is not a count",
                        token, schema.type_name
                    )))
                }
            };
            schema = schema.default_limit(limit);
        }
        if defaults.allow_unbounded {
            schema = schema.allow_unbounded();
        }
        if let Some(parent) = self.parent {
            schema = schema.with_parent(parent);
        }

        Ok(schema)
    }
}

impl RelationshipDecl {
    fn into_descriptor(self, owner: &str, name: &str) -> Result<RelationshipDescriptor, LoadError> {
        let mut rel = match (self.mapping_field, self.condition) {
            (Some(field), None) => RelationshipDescriptor::mapping(self.target, field),
            (None, Some(ConditionDecl::Reverse(field))) => {
                RelationshipDescriptor::condition(self.target, Arc::new(ReverseField::new(field)))
            }
            _ => {
                return Err(LoadError::Registry(RegistryError::InvalidFetchMode {
                    owner: owner.to_string(),
                    relationship: name.to_string(),
                }))
            }
        };

        if self.cardinality == Cardinality::Many {
            rel = rel.many();
        }
        rel = rel.with_visibility(Visibility {
            self_link: self.links.self_link,
            related_link: self.links.related,
            exposes_api: self.api,
        });
        if let Some(limit) = self.include_limit {
            rel = rel.with_include_limit(limit);
        }
        if let Some(meta) = self.meta {
            rel = rel.with_meta(meta);
        }
        rel.mutable = self.mutable;
        rel.required = self.required;
        Ok(rel)
    }
}

/// Build a registry from an already parsed declaration.
///
/// # Errors
///
/// Returns `LoadError::Registry` if the declaration is malformed or fails
/// registry validation.
pub fn parse_registry(value: Value) -> Result<Registry, LoadError> {
    let decl: RegistryDecl =
        serde_json::from_value(value).map_err(|e| declaration_error(e.to_string()))?;

    let mut builder = Registry::builder();
    for resource in decl.resources {
        builder = builder.register(resource.into_schema()?);
    }
    Ok(builder.build()?)
}

fn read_json(path: &Path) -> Result<Value, LoadError> {
    if !path.exists() {
        return Err(LoadError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    let content = std::fs::read_to_string(path).map_err(|source| LoadError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_str(&content).map_err(|source| LoadError::InvalidJson { source })
}

/// Load a registry declaration from a file path.
///
/// # Errors
///
/// Returns `LoadError::FileNotFound` if the file doesn't exist,
/// `LoadError::InvalidJson` if the file isn't valid JSON, or
/// `LoadError::Registry` if the declaration is rejected.
pub fn load_registry(path: &Path) -> Result<Registry, LoadError> {
    parse_registry(read_json(path)?)
}

/// Load a registry declaration from a JSON string.
///
/// # Errors
///
/// Returns `LoadError::InvalidJson` if the string isn't valid JSON, or
/// `LoadError::Registry` if the declaration is rejected.
pub fn load_registry_str(content: &str) -> Result<Registry, LoadError> {
    let value = serde_json::from_str(content).map_err(|source| LoadError::InvalidJson { source })?;
    parse_registry(value)
}

/// Load a registry declaration from an HTTP/HTTPS URL.
///
/// Requires the `remote` feature (enabled by default).
///
/// # Errors
///
/// Returns `LoadError::NetworkError` if the request fails or the server
/// answers with an error status, `LoadError::InvalidJson` if the body isn't
/// valid JSON.
#[cfg(feature = "remote")]
pub fn load_registry_url(url: &str) -> Result<Registry, LoadError> {
    let network = |source| LoadError::NetworkError {
        url: url.to_string(),
        source,
    };

    let client = reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(network)?;

    let body = client
        .get(url)
        .send()
        .and_then(|response| response.error_for_status())
        .and_then(|response| response.text())
        .map_err(network)?;

    tracing::debug!(url, bytes = body.len(), "registry fetched");
    load_registry_str(&body)
}

/// Check if a string looks like a URL.
pub fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Load a registry from a file path or URL.
///
/// # Errors
///
/// Returns an error if loading fails.
pub fn load_registry_auto(source: &str) -> Result<Registry, LoadError> {
    #[cfg(feature = "remote")]
    if is_url(source) {
        return load_registry_url(source);
    }

    load_registry(Path::new(source))
}

/// Parse a fixture object: `{"type": [record, ...], ...}`.
///
/// # Errors
///
/// Returns `LoadError::InvalidRecords` if the value is not an object of
/// record arrays.
pub fn parse_records(value: Value) -> Result<BTreeMap<String, Vec<Record>>, LoadError> {
    let Value::Object(map) = value else {
        return Err(LoadError::InvalidRecords {
            message: format!(
                "expected an object keyed by type, got {}",
                crate::types::json_type_name(&value)
            ),
        });
    };

    map.into_iter()
        .map(|(type_name, records)| -> Result<(String, Vec<Record>), LoadError> {
            let records: Vec<Record> =
                serde_json::from_value(records).map_err(|e| LoadError::InvalidRecords {
                    message: format!("{}: {}", type_name, e),
                })?;
            Ok((type_name, records))
        })
        .collect()
}

/// Load record fixtures from a file path.
///
/// # Errors
///
/// Returns the same IO and JSON errors as [`load_registry`], or
/// `LoadError::InvalidRecords` for a malformed fixture.
pub fn load_records(path: &Path) -> Result<BTreeMap<String, Vec<Record>>, LoadError> {
    parse_records(read_json(path)?)
}

/// One [`MemoryProvider`] per registered type, filled from `records`.
///
/// Registered types missing from `records` get an empty provider. To-one
/// mapping relationships are joined so `rel.field` sort keys resolve.
///
/// # Errors
///
/// Returns `LoadError::InvalidRecords` if `records` names an unregistered type.
pub fn memory_providers(
    registry: &Registry,
    mut records: BTreeMap<String, Vec<Record>>,
) -> Result<ProviderSet, LoadError> {
    if let Some(unknown) = records.keys().find(|t| registry.get(t).is_none()) {
        return Err(LoadError::InvalidRecords {
            message: format!("unregistered resource type '{}'", unknown),
        });
    }

    let tables: BTreeMap<&str, Arc<Vec<Record>>> = registry
        .types()
        .map(|t| (t, Arc::new(records.remove(t).unwrap_or_default())))
        .collect();

    let mut providers = ProviderSet::new();
    for (&type_name, rows) in &tables {
        let mut provider = MemoryProvider::new(type_name, rows.as_ref().clone());
        if let Some(schema) = registry.get(type_name) {
            for (name, rel) in &schema.relationships {
                let Some(field) = rel.mapping_field().filter(|_| !rel.is_many()) else {
                    continue;
                };
                if let Some(targets) = tables.get(rel.target.as_str()) {
                    provider = provider.with_join(name.as_str(), field, Arc::clone(targets));
                }
            }
        }
        providers.insert(Arc::new(provider));
    }
    Ok(providers)
}
