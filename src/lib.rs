//! JSON:API Graph
//!
//! Compiles JSON:API query strings into validated query arguments and
//! serializes resource graphs into compound documents.
//!
//! Resource types are declared once in a [`Registry`]. Each type is backed by
//! a [`Provider`] that evaluates compiled filters, sorts and pages against
//! whatever storage the caller owns. [`JsonApi`] ties the two together and
//! answers collection, single, relationship and related requests.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use jsonapi_graph::{
//!     JsonApi, MemoryProvider, Operation, ProviderSet, Record, RelationshipDescriptor,
//!     Registry, Request, ResourceSchema, Response, TypeCategory,
//! };
//! use serde_json::json;
//!
//! let registry = Registry::builder()
//!     .register(ResourceSchema::new("people", "/people").attribute("name", TypeCategory::String))
//!     .register(
//!         ResourceSchema::new("articles", "/articles")
//!             .attribute("title", TypeCategory::String)
//!             .attribute("author_id", TypeCategory::String)
//!             .relationship("author", RelationshipDescriptor::mapping("people", "author_id")),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let providers = ProviderSet::new()
//!     .with(Arc::new(MemoryProvider::new(
//!         "people",
//!         vec![Record::new("p1").with("name", json!("Ada"))],
//!     )))
//!     .with(Arc::new(MemoryProvider::new(
//!         "articles",
//!         vec![Record::new("a1")
//!             .with("title", json!("Engines"))
//!             .with("author_id", json!("p1"))],
//!     )));
//!
//! let api = JsonApi::new(Arc::new(registry), providers);
//! let request = Request::new(
//!     Operation::Collection { type_name: "articles".into() },
//!     "filter=title%5Bop%5D%3Deq%26title%5Bvalue%5D%3DEngines&include=author",
//! );
//!
//! let runtime = tokio::runtime::Builder::new_current_thread()
//!     .enable_time()
//!     .build()
//!     .unwrap();
//! let response = runtime.block_on(api.handle(&request));
//!
//! let Response::Document(document) = response else { panic!("request failed") };
//! let value = serde_json::to_value(&document).unwrap();
//! assert_eq!(value["data"][0]["id"], "a1");
//! assert_eq!(value["included"][0]["attributes"]["name"], "Ada");
//! ```
//!
//! # Query Parameters
//!
//! | Parameter | Form | Example |
//! |-----------|------|---------|
//! | `filter` | encoded deep object, one AND group per occurrence | `name[op]=eq&name[value]=Ann` |
//! | `sort` | comma list, `-` for descending | `-count,name` |
//! | `page[offset]` / `page[limit]` | non-negative integers | `page[limit]=20` |
//! | `include` | dotted relationship paths | `author,comments.author` |
//! | `_data` | paths resolved to linkage only | `tags` |
//! | `fields[TYPE]` | sparse fieldset | `fields[people]=name` |
//!
//! Repeated `filter` parameters are OR-ed together.

mod codec;
mod document;
mod engine;
mod error;
mod filter;
mod loader;
mod provider;
mod query;
mod registry;
mod relationship;
mod serializer;
mod types;

pub use codec::{decode, encode, DeepMap};
pub use document::{
    Document, ErrorDocument, Links, PrimaryData, RelationshipData, RelationshipObject,
    ResourceIdentifier, ResourceObject, JSONAPI_VERSION,
};
pub use engine::{
    EngineOptions, JsonApi, Operation, Request, RequestContext, Response, DEFAULT_TIMEOUT,
};
pub use error::{ApiError, ErrorObject, LoadError, ProviderFailure, RegistryError};
pub use filter::{
    take_leaf, vocabulary, Combinator, FilterExpr, FilterGroup, FilterLeaf, FilterValue, Operator,
};
pub use loader::{
    is_url, load_records, load_registry, load_registry_auto, load_registry_str, memory_providers,
    parse_records, parse_registry,
};
pub use provider::{
    expect_single, id_filter, scope_to_id, MemoryProvider, Provider, ProviderSet, Record,
};
pub use query::{compile, Endpoint, QueryArgs, RawParams};
pub use registry::{AttributeSpec, Defaults, Registry, RegistryBuilder, ResourceSchema};
pub use relationship::{
    ids_in, FetchMode, RelationCondition, RelationshipDescriptor, ReverseField, Visibility,
};
pub use serializer::{Compound, GraphSerializer, InclusionNode, IncludedRegistry};
pub use types::{
    json_type_name, Cardinality, Limit, SortKey, TypeCategory, DEFAULT_LIMIT, ID_FIELD,
    MAX_PATH_DEPTH, UNBOUNDED_TOKEN,
};

#[cfg(feature = "remote")]
pub use loader::load_registry_url;
