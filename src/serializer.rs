//! Resource graph serializer.
//!
//! Renders primary records and walks the requested relationship paths to
//! build a deduplicated `included` set. Resolution runs in two phases:
//!
//! 1. An arena of [`InclusionNode`]s is built, one per dotted path prefix, and
//!    resolved depth by depth. Siblings at one depth are fetched concurrently;
//!    each node fetches from its parent's full record set.
//! 2. Primary records are rendered, then every included node in breadth-first
//!    order. The [`IncludedRegistry`], seeded with the primary records, drops
//!    records that were already rendered.

use std::collections::{BTreeMap, HashMap, HashSet};

use futures::future::try_join_all;
use serde_json::{Map, Value};

use crate::document::{Links, RelationshipData, RelationshipObject, ResourceIdentifier, ResourceObject};
use crate::error::ApiError;
use crate::provider::{ProviderSet, Record};
use crate::query::QueryArgs;
use crate::registry::{Registry, ResourceSchema};
use crate::relationship::{ids_in, FetchMode, RelationshipDescriptor};
use crate::types::{Limit, SortKey, ID_FIELD, MAX_PATH_DEPTH};

/// Primary data plus the compound `included` list.
#[derive(Debug, Clone, PartialEq)]
pub struct Compound {
    pub data: Vec<ResourceObject>,
    pub included: Vec<ResourceObject>,
}

/// Request-scoped set of `(type, id)` pairs already rendered.
#[derive(Debug, Default)]
pub struct IncludedRegistry {
    seen: HashSet<(String, String)>,
}

impl IncludedRegistry {
    pub fn seeded(type_name: &str, records: &[Record]) -> Self {
        let mut registry = Self::default();
        for record in records {
            registry.insert(type_name, &record.id);
        }
        registry
    }

    /// Returns `true` when the pair was not seen before.
    pub fn insert(&mut self, type_name: &str, id: &str) -> bool {
        self.seen.insert((type_name.to_string(), id.to_string()))
    }

    pub fn contains(&self, type_name: &str, id: &str) -> bool {
        self.seen.contains(&(type_name.to_string(), id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// One dotted path in the inclusion arena.
#[derive(Debug)]
pub struct InclusionNode<'r> {
    pub path: String,
    /// Index of the parent node; `None` under the primary records.
    parent: Option<usize>,
    rel: &'r RelationshipDescriptor,
    pub depth: usize,
    /// Rendered into `included`, as opposed to linkage-only.
    pub included: bool,
    fetched: bool,
    pub records: Vec<Record>,
}

impl InclusionNode<'_> {
    pub fn target(&self) -> &str {
        &self.rel.target
    }
}

#[derive(Debug, Default)]
struct InclusionArena<'r> {
    nodes: Vec<InclusionNode<'r>>,
    index: HashMap<String, usize>,
}

impl<'r> InclusionArena<'r> {
    fn build(
        registry: &'r Registry,
        root: &'r ResourceSchema,
        include: &[String],
        data: &[String],
    ) -> Result<Self, ApiError> {
        let mut arena = Self::default();
        for (paths, included) in [(include, true), (data, false)] {
            for path in paths {
                arena.add_path(registry, root, path, included)?;
            }
        }
        Ok(arena)
    }

    fn add_path(
        &mut self,
        registry: &'r Registry,
        root: &'r ResourceSchema,
        path: &str,
        included: bool,
    ) -> Result<(), ApiError> {
        let segments: Vec<&str> = path.split('.').collect();
        if segments.len() > MAX_PATH_DEPTH {
            return Err(ApiError::invalid_query(format!(
                "path '{}' is deeper than {} levels",
                path, MAX_PATH_DEPTH
            )));
        }

        let mut schema = root;
        let mut parent = None;
        for depth in 1..=segments.len() {
            let segment = segments[depth - 1];
            let prefix = segments[..depth].join(".");
            let rel = schema.get_relationship(segment).ok_or_else(|| {
                ApiError::internal(format!(
                    "'{}' has no relationship '{}' (path '{}')",
                    schema.type_name, segment, path
                ))
            })?;

            let idx = match self.index.get(&prefix) {
                Some(&idx) => {
                    self.nodes[idx].included |= included;
                    idx
                }
                None => {
                    self.nodes.push(InclusionNode {
                        path: prefix.clone(),
                        parent,
                        rel,
                        depth,
                        included,
                        fetched: false,
                        records: Vec::new(),
                    });
                    self.index.insert(prefix, self.nodes.len() - 1);
                    self.nodes.len() - 1
                }
            };

            schema = registry.schema(&rel.target)?;
            parent = Some(idx);
        }
        Ok(())
    }

    fn get(&self, path: &str) -> Option<&InclusionNode<'r>> {
        self.index.get(path).map(|&idx| &self.nodes[idx])
    }

    /// Included nodes fetch; linkage-only condition nodes fetch when their
    /// owners get rendered.
    fn needs_fetch(&self, idx: usize) -> bool {
        let node = &self.nodes[idx];
        if node.included {
            return true;
        }
        let owners_rendered = node.parent.map_or(true, |p| self.nodes[p].included);
        owners_rendered && matches!(node.rel.fetch, FetchMode::Condition(_))
    }

    /// Node indices at `depth`, in insertion order.
    fn level(&self, depth: usize) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].depth == depth)
            .collect()
    }
}

/// Renders records into JSON:API resource objects.
#[derive(Debug, Clone, Copy)]
pub struct GraphSerializer<'a> {
    registry: &'a Registry,
    providers: &'a ProviderSet,
    base_url: &'a str,
}

impl<'a> GraphSerializer<'a> {
    pub fn new(registry: &'a Registry, providers: &'a ProviderSet, base_url: &'a str) -> Self {
        Self {
            registry,
            providers,
            base_url: base_url.trim_end_matches('/'),
        }
    }

    /// Render `records` of `type_name` with the include, `_data` and fieldset
    /// scope of `args`.
    ///
    /// # Errors
    ///
    /// Propagates provider failures; an inconsistent registry or a missing
    /// provider is `ApiError::InternalConsistency`.
    pub async fn serialize(
        &self,
        type_name: &str,
        records: &[Record],
        args: &QueryArgs,
    ) -> Result<Compound, ApiError> {
        let schema = self.registry.schema(type_name)?;
        let mut arena = InclusionArena::build(self.registry, schema, &args.include, &args.data)?;
        self.resolve(&mut arena, records).await?;

        let data = records
            .iter()
            .map(|r| self.render(schema, r, None, &arena, args))
            .collect::<Result<Vec<_>, _>>()?;

        let mut seen = IncludedRegistry::seeded(type_name, records);
        let mut included = Vec::new();
        for depth in 1..=MAX_PATH_DEPTH {
            for idx in arena.level(depth) {
                let node = &arena.nodes[idx];
                if !node.included {
                    continue;
                }
                let target = self.registry.schema(node.target())?;
                for record in &node.records {
                    if seen.insert(node.target(), &record.id) {
                        included.push(self.render(target, record, Some(node.path.as_str()), &arena, args)?);
                    }
                }
            }
        }

        tracing::debug!(
            type_name,
            primary = data.len(),
            included = included.len(),
            "graph serialized"
        );
        Ok(Compound { data, included })
    }

    /// Relationship object for the relationship endpoint; data is always
    /// resolved.
    ///
    /// # Errors
    ///
    /// `NotFound` when `name` is not a relationship of `schema` or does not
    /// expose an endpoint; provider failures propagate.
    pub async fn relationship(
        &self,
        schema: &ResourceSchema,
        owner: &Record,
        name: &str,
    ) -> Result<RelationshipObject, ApiError> {
        let rel = schema
            .get_relationship(name)
            .filter(|rel| rel.visibility.exposes_api)
            .ok_or_else(|| {
                ApiError::not_found(format!("{}/{}/relationships/{}", schema.type_name, owner.id, name))
            })?;

        let data = match &rel.fetch {
            FetchMode::MappingField(field) => {
                linkage(rel, ids_in(owner.get(field)).into_iter().map(|id| (id, None)))
            }
            FetchMode::Condition(_) => {
                let targets = self.fetch(rel, std::slice::from_ref(owner)).await?;
                linkage(
                    rel,
                    targets
                        .into_iter()
                        .filter(|t| rel.links(owner, t))
                        .map(|t| (t.id, t.meta)),
                )
            }
        };

        Ok(RelationshipObject {
            links: self.relationship_links(schema, owner, name, rel),
            data: Some(data),
            meta: rel.meta.clone(),
        })
    }

    async fn resolve(&self, arena: &mut InclusionArena<'_>, primary: &[Record]) -> Result<(), ApiError> {
        for depth in 1..=MAX_PATH_DEPTH {
            let level: Vec<usize> = arena
                .level(depth)
                .into_iter()
                .filter(|&idx| arena.needs_fetch(idx))
                .collect();
            if level.is_empty() {
                continue;
            }

            let fetched = {
                let arena = &*arena;
                try_join_all(level.iter().map(|&idx| {
                    let node = &arena.nodes[idx];
                    let owners = match node.parent {
                        Some(parent) => arena.nodes[parent].records.as_slice(),
                        None => primary,
                    };
                    self.fetch(node.rel, owners)
                }))
                .await?
            };

            for (idx, records) in level.into_iter().zip(fetched) {
                let node = &mut arena.nodes[idx];
                tracing::debug!(path = %node.path, depth, records = records.len(), "node resolved");
                node.records = records;
                node.fetched = true;
            }
        }
        Ok(())
    }

    /// Targets of `rel` for all `owners`, capped by the include limit.
    async fn fetch(&self, rel: &RelationshipDescriptor, owners: &[Record]) -> Result<Vec<Record>, ApiError> {
        let Some(filter) = rel.target_filter(owners) else {
            return Ok(Vec::new());
        };
        let limit = rel.include_limit.map_or(Limit::Unbounded, Limit::Bounded);
        let provider = self.providers.get(&rel.target)?;
        provider
            .fetch_many(Some(&filter), 0, limit, &[SortKey::asc(ID_FIELD)])
            .await
    }

    fn render(
        &self,
        schema: &ResourceSchema,
        record: &Record,
        prefix: Option<&str>,
        arena: &InclusionArena<'_>,
        args: &QueryArgs,
    ) -> Result<ResourceObject, ApiError> {
        let fieldset = args.fieldset(&schema.type_name);
        let wanted = |name: &str| fieldset.map_or(true, |f| f.iter().any(|n| n == name));

        let mut attributes = Map::new();
        for (name, spec) in &schema.attributes {
            if spec.hidden || !wanted(name) {
                continue;
            }
            let value = record.get(name).cloned().unwrap_or(Value::Null);
            attributes.insert(name.clone(), value);
        }

        let mut relationships = BTreeMap::new();
        for (name, rel) in &schema.relationships {
            if !wanted(name) {
                continue;
            }
            let path = match prefix {
                Some(prefix) => format!("{}.{}", prefix, name),
                None => name.clone(),
            };
            let node = arena.get(&path).filter(|n| n.fetched);
            relationships.insert(
                name.clone(),
                RelationshipObject {
                    links: self.relationship_links(schema, record, name, rel),
                    data: relationship_data(rel, record, node),
                    meta: rel.meta.clone(),
                },
            );
        }

        Ok(ResourceObject {
            type_name: schema.type_name.clone(),
            id: record.id.clone(),
            attributes,
            relationships,
            links: Some(self.resource_links(schema, record)?),
            meta: record.meta.clone(),
        })
    }

    fn resource_links(&self, schema: &ResourceSchema, record: &Record) -> Result<Links, ApiError> {
        let parent = match schema.parent_relationship() {
            Some((_, rel)) => {
                let target = self.registry.schema(&rel.target)?;
                rel.mapping_field()
                    .and_then(|field| ids_in(record.get(field)).into_iter().next())
                    .map(|id| format!("{}{}/{}", self.base_url, target.link, id))
            }
            None => None,
        };
        Ok(Links {
            self_link: Some(format!("{}{}/{}", self.base_url, schema.link, record.id)),
            related: None,
            parent,
        })
    }

    fn relationship_links(
        &self,
        schema: &ResourceSchema,
        record: &Record,
        name: &str,
        rel: &RelationshipDescriptor,
    ) -> Option<Links> {
        let owner = format!("{}{}/{}", self.base_url, schema.link, record.id);
        let links = Links {
            self_link: rel
                .visibility
                .self_link
                .then(|| format!("{}/relationships/{}", owner, name)),
            related: rel
                .visibility
                .related_link
                .then(|| format!("{}/{}", owner, name)),
            parent: None,
        };
        (!links.is_empty()).then_some(links)
    }
}

/// Identifier data for one owner.
///
/// Mapping relationships always carry data. Condition relationships only do
/// when their path was resolved for this request.
fn relationship_data(
    rel: &RelationshipDescriptor,
    owner: &Record,
    node: Option<&InclusionNode<'_>>,
) -> Option<RelationshipData> {
    let meta_of = |id: &str| {
        node.and_then(|n| n.records.iter().find(|r| r.id == id))
            .and_then(|r| r.meta.clone())
    };

    match &rel.fetch {
        FetchMode::MappingField(field) => {
            let ids = ids_in(owner.get(field));
            Some(linkage(
                rel,
                ids.into_iter().map(|id| {
                    let meta = meta_of(&id);
                    (id, meta)
                }),
            ))
        }
        FetchMode::Condition(_) => {
            let node = node?;
            Some(linkage(
                rel,
                node.records
                    .iter()
                    .filter(|t| rel.links(owner, t))
                    .map(|t| (t.id.clone(), t.meta.clone())),
            ))
        }
    }
}

fn linkage(
    rel: &RelationshipDescriptor,
    targets: impl Iterator<Item = (String, Option<Value>)>,
) -> RelationshipData {
    let mut identifiers = targets.map(|(id, meta)| ResourceIdentifier {
        type_name: rel.target.clone(),
        id,
        meta,
    });
    if rel.is_many() {
        RelationshipData::Many(identifiers.collect())
    } else {
        RelationshipData::One(identifiers.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;
    use crate::query::{compile, Endpoint, RawParams};
    use crate::relationship::{ReverseField, Visibility};
    use crate::types::TypeCategory;
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> Registry {
        Registry::builder()
            .register(
                ResourceSchema::new("posts", "/posts")
                    .attribute("title", TypeCategory::String)
                    .attribute("author_id", TypeCategory::String)
                    .hidden_attribute("secret", TypeCategory::String)
                    .relationship("author", RelationshipDescriptor::mapping("users", "author_id"))
                    .relationship(
                        "comments",
                        RelationshipDescriptor::condition(
                            "comments",
                            Arc::new(ReverseField::new("post_id")),
                        )
                        .many()
                        .with_meta(json!({"ordered": "id"})),
                    ),
            )
            .register(
                ResourceSchema::new("users", "/users")
                    .attribute("name", TypeCategory::String)
                    .attribute("boss_id", TypeCategory::String)
                    .relationship(
                        "boss",
                        RelationshipDescriptor::mapping("users", "boss_id").with_visibility(
                            Visibility {
                                self_link: false,
                                related_link: false,
                                exposes_api: false,
                            },
                        ),
                    )
                    .with_parent("boss"),
            )
            .register(
                ResourceSchema::new("comments", "/comments")
                    .attribute("body", TypeCategory::String)
                    .attribute("post_id", TypeCategory::String)
                    .attribute("user_id", TypeCategory::String)
                    .relationship("user", RelationshipDescriptor::mapping("users", "user_id")),
            )
            .build()
            .unwrap()
    }

    fn providers() -> ProviderSet {
        ProviderSet::new()
            .with(Arc::new(MemoryProvider::new(
                "posts",
                vec![
                    Record::from_attributes("p1", json!({"title": "One", "author_id": "u1", "secret": "x"})),
                    Record::from_attributes("p2", json!({"title": "Two", "author_id": "u2"})),
                ],
            )))
            .with(Arc::new(MemoryProvider::new(
                "users",
                vec![
                    Record::from_attributes("u1", json!({"name": "Ann", "boss_id": "u2"})),
                    Record::from_attributes("u2", json!({"name": "Bob"})).with_meta(json!({"role": "lead"})),
                ],
            )))
            .with(Arc::new(MemoryProvider::new(
                "comments",
                vec![
                    Record::from_attributes("c1", json!({"body": "hi", "post_id": "p1", "user_id": "u2"})),
                    Record::from_attributes("c2", json!({"body": "yo", "post_id": "p1", "user_id": "u1"})),
                    Record::from_attributes("c3", json!({"body": "ok", "post_id": "p2", "user_id": "u2"})),
                ],
            )))
    }

    async fn posts() -> Vec<Record> {
        providers()
            .get("posts")
            .unwrap()
            .fetch_many(None, 0, Limit::Unbounded, &[SortKey::asc("id")])
            .await
            .unwrap()
    }

    fn args(type_name: &str, query: &str) -> QueryArgs {
        compile(&registry(), type_name, Endpoint::Collection, &RawParams::parse(query)).unwrap()
    }

    #[tokio::test]
    async fn renders_attributes_and_links() {
        let registry = registry();
        let providers = providers();
        let serializer = GraphSerializer::new(&registry, &providers, "http://api/");
        let compound = serializer
            .serialize("posts", &posts().await, &args("posts", ""))
            .await
            .unwrap();

        let first = serde_json::to_value(&compound.data[0]).unwrap();
        assert_eq!(first["attributes"], json!({"author_id": "u1", "title": "One"}));
        assert_eq!(first["links"], json!({"self": "http://api/posts/p1"}));
        assert_eq!(
            first["relationships"]["author"],
            json!({
                "links": {
                    "self": "http://api/posts/p1/relationships/author",
                    "related": "http://api/posts/p1/author"
                },
                "data": {"type": "users", "id": "u1"}
            })
        );
        // condition relationships reveal no data unless requested
        assert!(first["relationships"]["comments"].get("data").is_none());
        assert_eq!(first["relationships"]["comments"]["meta"], json!({"ordered": "id"}));
        assert!(compound.included.is_empty());
    }

    #[tokio::test]
    async fn includes_are_deduplicated() {
        let registry = registry();
        let providers = providers();
        let serializer = GraphSerializer::new(&registry, &providers, "");
        let compound = serializer
            .serialize("posts", &posts().await, &args("posts", "include=author,comments.user"))
            .await
            .unwrap();

        let keys: Vec<(String, String)> = compound
            .included
            .iter()
            .map(|r| (r.type_name.clone(), r.id.clone()))
            .collect();
        let unique: HashSet<_> = keys.iter().cloned().collect();
        assert_eq!(keys.len(), unique.len());
        // depth 1 first: author users, then comments; depth 2 users are all seen
        assert_eq!(
            keys,
            vec![
                ("users".to_string(), "u1".to_string()),
                ("users".to_string(), "u2".to_string()),
                ("comments".to_string(), "c1".to_string()),
                ("comments".to_string(), "c2".to_string()),
                ("comments".to_string(), "c3".to_string()),
            ]
        );

        let post = serde_json::to_value(&compound.data[0]).unwrap();
        assert_eq!(
            post["relationships"]["comments"]["data"],
            json!([{"type": "comments", "id": "c1"}, {"type": "comments", "id": "c2"}])
        );

        // identifier meta comes from the fetched target
        let post2 = serde_json::to_value(&compound.data[1]).unwrap();
        assert_eq!(
            post2["relationships"]["author"]["data"],
            json!({"type": "users", "id": "u2", "meta": {"role": "lead"}})
        );
    }

    #[tokio::test]
    async fn secondary_data_resolves_linkage_only() {
        let registry = registry();
        let providers = providers();
        let serializer = GraphSerializer::new(&registry, &providers, "");
        let compound = serializer
            .serialize("posts", &posts().await, &args("posts", "_data=comments"))
            .await
            .unwrap();

        assert!(compound.included.is_empty());
        let post = serde_json::to_value(&compound.data[1]).unwrap();
        assert_eq!(
            post["relationships"]["comments"]["data"],
            json!([{"type": "comments", "id": "c3"}])
        );
    }

    #[tokio::test]
    async fn sparse_fieldsets_and_hidden_links() {
        let registry = registry();
        let providers = providers();
        let serializer = GraphSerializer::new(&registry, &providers, "");
        let compound = serializer
            .serialize(
                "posts",
                &posts().await,
                &args("posts", "include=author&fields[posts]=title&fields[users]=name,boss"),
            )
            .await
            .unwrap();

        let post = serde_json::to_value(&compound.data[0]).unwrap();
        assert_eq!(post["attributes"], json!({"title": "One"}));
        assert!(post.get("relationships").is_none());

        let ann = serde_json::to_value(&compound.included[0]).unwrap();
        assert_eq!(ann["attributes"], json!({"name": "Ann"}));
        // no links when both are hidden, no meta when the target was not fetched
        assert_eq!(ann["relationships"]["boss"], json!({"data": {"type": "users", "id": "u2"}}));
        assert_eq!(ann["links"], json!({"self": "/users/u1", "parent": "/users/u2"}));
    }

    #[tokio::test]
    async fn relationship_endpoint_always_resolves() {
        let registry = registry();
        let providers = providers();
        let serializer = GraphSerializer::new(&registry, &providers, "");
        let schema = registry.schema("posts").unwrap();
        let owner = posts().await.remove(0);

        let obj = serializer.relationship(schema, &owner, "comments").await.unwrap();
        assert_eq!(
            serde_json::to_value(obj.data).unwrap(),
            json!([{"type": "comments", "id": "c1"}, {"type": "comments", "id": "c2"}])
        );

        let users = registry.schema("users").unwrap();
        let err = serializer
            .relationship(users, &Record::new("u1"), "boss")
            .await
            .unwrap_err();
        assert_eq!(err.status(), 404);
    }

    #[test]
    fn included_registry_tracks_pairs() {
        let mut seen = IncludedRegistry::seeded("posts", &[Record::new("1")]);
        assert!(seen.contains("posts", "1"));
        assert!(!seen.insert("posts", "1"));
        assert!(seen.insert("users", "1"));
        assert_eq!(seen.len(), 2);
    }
}
