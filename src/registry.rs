//! Resource schemas and the registry that holds them.
//!
//! The registry is built once, validated as a whole, and read-only afterwards.

use std::collections::BTreeMap;

use crate::error::{ApiError, RegistryError};
use crate::relationship::{FetchMode, RelationshipDescriptor};
use crate::types::{Limit, SortKey, TypeCategory, ID_FIELD};

/// Declared attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeSpec {
    pub category: TypeCategory,
    /// Hidden attributes are filterable but never rendered.
    pub hidden: bool,
}

/// Per-resource pagination and ordering defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defaults {
    pub sort: Vec<SortKey>,
    pub offset: u64,
    pub limit: Limit,
    pub allow_unbounded: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            sort: Vec::new(),
            offset: 0,
            limit: Limit::default(),
            allow_unbounded: false,
        }
    }
}

/// Schema of one resource type.
#[derive(Debug, Clone)]
pub struct ResourceSchema {
    pub type_name: String,
    /// Path segment under the base URL, e.g. `/articles`.
    pub link: String,
    pub attributes: BTreeMap<String, AttributeSpec>,
    pub relationships: BTreeMap<String, RelationshipDescriptor>,
    pub defaults: Defaults,
    /// Name of a to-one mapping relationship pointing at the parent scope.
    pub parent: Option<String>,
}

impl ResourceSchema {
    pub fn new(type_name: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            link: link.into(),
            attributes: BTreeMap::new(),
            relationships: BTreeMap::new(),
            defaults: Defaults::default(),
            parent: None,
        }
    }

    pub fn attribute(mut self, name: impl Into<String>, category: TypeCategory) -> Self {
        self.attributes.insert(
            name.into(),
            AttributeSpec {
                category,
                hidden: false,
            },
        );
        self
    }

    pub fn hidden_attribute(mut self, name: impl Into<String>, category: TypeCategory) -> Self {
        self.attributes.insert(
            name.into(),
            AttributeSpec {
                category,
                hidden: true,
            },
        );
        self
    }

    pub fn relationship(mut self, name: impl Into<String>, rel: RelationshipDescriptor) -> Self {
        self.relationships.insert(name.into(), rel);
        self
    }

    pub fn default_sort(mut self, sort: Vec<SortKey>) -> Self {
        self.defaults.sort = sort;
        self
    }

    pub fn default_limit(mut self, limit: Limit) -> Self {
        self.defaults.limit = limit;
        self
    }

    pub fn default_offset(mut self, offset: u64) -> Self {
        self.defaults.offset = offset;
        self
    }

    pub fn allow_unbounded(mut self) -> Self {
        self.defaults.allow_unbounded = true;
        self
    }

    pub fn with_parent(mut self, relationship: impl Into<String>) -> Self {
        self.parent = Some(relationship.into());
        self
    }

    pub fn get_relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.get(name)
    }

    /// Category of a filterable or sortable field. `id` is always a string.
    pub fn field_category(&self, name: &str) -> Option<TypeCategory> {
        if name == ID_FIELD {
            return Some(TypeCategory::String);
        }
        self.attributes.get(name).map(|a| a.category)
    }

    /// True for `id`, declared attributes and relationship names.
    pub fn has_field(&self, name: &str) -> bool {
        name == ID_FIELD || self.attributes.contains_key(name) || self.relationships.contains_key(name)
    }

    /// The parent relationship name and descriptor, if declared.
    pub fn parent_relationship(&self) -> Option<(&str, &RelationshipDescriptor)> {
        let name = self.parent.as_deref()?;
        self.relationships.get(name).map(|rel| (name, rel))
    }
}

/// Immutable set of resource schemas keyed by type name.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    schemas: BTreeMap<String, ResourceSchema>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, type_name: &str) -> Option<&ResourceSchema> {
        self.schemas.get(type_name)
    }

    /// Schema lookup on the request path.
    ///
    /// # Errors
    ///
    /// An unknown type here means a descriptor escaped validation, so it is
    /// reported as `ApiError::InternalConsistency`.
    pub fn schema(&self, type_name: &str) -> Result<&ResourceSchema, ApiError> {
        self.schemas
            .get(type_name)
            .ok_or_else(|| ApiError::internal(format!("unregistered resource type '{}'", type_name)))
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

/// Collects schemas and validates them together.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    schemas: Vec<ResourceSchema>,
}

impl RegistryBuilder {
    pub fn register(mut self, schema: ResourceSchema) -> Self {
        self.schemas.push(schema);
        self
    }

    /// Validate every schema and freeze the registry.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` for duplicate types, relationships targeting
    /// unregistered types, mapping fields that are not declared attributes,
    /// and parents that are not to-one mapping relationships.
    pub fn build(self) -> Result<Registry, RegistryError> {
        let mut schemas = BTreeMap::new();
        for schema in self.schemas {
            if schemas.contains_key(&schema.type_name) {
                return Err(RegistryError::DuplicateType {
                    type_name: schema.type_name,
                });
            }
            schemas.insert(schema.type_name.clone(), schema);
        }

        for schema in schemas.values() {
            for (name, rel) in &schema.relationships {
                validate_relationship(&schemas, schema, name, rel)?;
            }
            if let Some(parent) = &schema.parent {
                validate_parent(schema, parent)?;
            }
            validate_defaults(&schemas, schema)?;
        }

        tracing::debug!(types = schemas.len(), "registry built");
        Ok(Registry { schemas })
    }
}

fn validate_relationship(
    schemas: &BTreeMap<String, ResourceSchema>,
    owner: &ResourceSchema,
    name: &str,
    rel: &RelationshipDescriptor,
) -> Result<(), RegistryError> {
    if !schemas.contains_key(&rel.target) {
        return Err(RegistryError::UnknownTarget {
            owner: owner.type_name.clone(),
            relationship: name.to_string(),
            target: rel.target.clone(),
        });
    }
    if let FetchMode::MappingField(field) = &rel.fetch {
        if !owner.attributes.contains_key(field) {
            return Err(RegistryError::UnknownMappingField {
                owner: owner.type_name.clone(),
                relationship: name.to_string(),
                field: field.clone(),
            });
        }
    }
    Ok(())
}

fn validate_defaults(
    schemas: &BTreeMap<String, ResourceSchema>,
    schema: &ResourceSchema,
) -> Result<(), RegistryError> {
    for key in &schema.defaults.sort {
        let sortable = match key.field.split_once('.') {
            None => schema.field_category(&key.field).is_some(),
            Some((rel, field)) => schema
                .relationships
                .get(rel)
                .and_then(|r| schemas.get(&r.target))
                .is_some_and(|target| target.field_category(field).is_some()),
        };
        if !sortable {
            return Err(RegistryError::InvalidDeclaration {
                message: format!(
                    "default sort '{}' on '{}' is not a sortable field",
                    key, schema.type_name
                ),
            });
        }
    }
    if schema.defaults.limit == Limit::Unbounded && !schema.defaults.allow_unbounded {
        return Err(RegistryError::InvalidDeclaration {
            message: format!(
                "'{}' defaults to an unbounded limit without allowing it",
                schema.type_name
            ),
        });
    }
    Ok(())
}

fn validate_parent(schema: &ResourceSchema, parent: &str) -> Result<(), RegistryError> {
    let invalid = |message: &str| RegistryError::InvalidParent {
        owner: schema.type_name.clone(),
        relationship: parent.to_string(),
        message: message.to_string(),
    };
    let rel = schema
        .relationships
        .get(parent)
        .ok_or_else(|| invalid("no such relationship"))?;
    if rel.is_many() {
        return Err(invalid("parent must be a to-one relationship"));
    }
    if rel.mapping_field().is_none() {
        return Err(invalid("parent must use a mapping field"));
    }
    Ok(())
}
