//! Request pipeline: compile, fetch, serialize.
//!
//! [`JsonApi::handle`] runs one request under a single deadline. Any failure,
//! including the deadline, replaces the whole response with an error
//! document; nothing partial is returned.

use std::slice;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::document::{Document, ErrorDocument, Links, PrimaryData, RelationshipData};
use crate::error::ApiError;
use crate::filter::FilterExpr;
use crate::provider::{scope_to_id, ProviderSet, Record};
use crate::query::{compile, Endpoint, QueryArgs, RawParams};
use crate::registry::{Registry, ResourceSchema};
use crate::relationship::RelationshipDescriptor;
use crate::serializer::GraphSerializer;
use crate::types::Limit;

/// Default request deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Prefix for every generated link, e.g. `https://api.example.com`.
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl EngineOptions {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Caller-supplied request details, logged when a request fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub method: String,
    pub url: String,
    pub client: Option<String>,
    pub token: Option<String>,
    pub body: Option<String>,
}

/// What a request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Collection {
        type_name: String,
    },
    Single {
        type_name: String,
        id: String,
    },
    Relationship {
        type_name: String,
        id: String,
        relationship: String,
    },
    Related {
        type_name: String,
        id: String,
        relationship: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub operation: Operation,
    /// Raw query string, with or without the leading `?`.
    pub query: String,
    pub context: RequestContext,
}

impl Request {
    pub fn new(operation: Operation, query: impl Into<String>) -> Self {
        Self {
            operation,
            query: query.into(),
            context: RequestContext::default(),
        }
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }
}

/// Either a document or the error document replacing it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Document(Box<Document>),
    Error(ErrorDocument),
}

impl Response {
    pub fn status(&self) -> u16 {
        match self {
            Response::Document(_) => 200,
            Response::Error(doc) => doc.status(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error(_))
    }
}

/// Registry, providers and options for serving requests.
#[derive(Debug, Clone)]
pub struct JsonApi {
    registry: Arc<Registry>,
    providers: ProviderSet,
    options: EngineOptions,
}

impl JsonApi {
    pub fn new(registry: Arc<Registry>, providers: ProviderSet) -> Self {
        Self {
            registry,
            providers,
            options: EngineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Run `request` under the configured deadline.
    pub async fn handle(&self, request: &Request) -> Response {
        let params = RawParams::parse(&request.query);
        let pipeline = async {
            match &request.operation {
                Operation::Collection { type_name } => self.get_many(type_name, &params).await,
                Operation::Single { type_name, id } => self.get_one(type_name, id, &params).await,
                Operation::Relationship {
                    type_name,
                    id,
                    relationship,
                } => self.relationship(type_name, id, relationship).await,
                Operation::Related {
                    type_name,
                    id,
                    relationship,
                } => self.related(type_name, id, relationship, &params).await,
            }
        };

        let outcome = match tokio::time::timeout(self.options.timeout, pipeline).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ApiError::Timeout {
                millis: u64::try_from(self.options.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        };

        match outcome {
            Ok(document) => Response::Document(Box::new(document)),
            Err(err) => {
                log_failure(&request.context, &err);
                Response::Error(ErrorDocument::from(&err))
            }
        }
    }

    /// Collection of `type_name`.
    pub async fn get_many(&self, type_name: &str, params: &RawParams) -> Result<Document, ApiError> {
        let args = compile(&self.registry, type_name, Endpoint::Collection, params)?;
        let schema = self.registry.schema(type_name)?;
        let mut document = self.collection(schema, args.filter.as_ref(), &args).await?;
        document.links = Some(self.links(&schema.link));
        Ok(document)
    }

    /// One record of `type_name`.
    pub async fn get_one(
        &self,
        type_name: &str,
        id: &str,
        params: &RawParams,
    ) -> Result<Document, ApiError> {
        let args = compile(&self.registry, type_name, Endpoint::Single, params)?;
        let schema = self.registry.schema(type_name)?;
        let provider = self.providers.get(type_name)?;

        let filter = scope_to_id(args.filter.clone(), id);
        let record = provider
            .fetch_scoped(&filter, &format!("{}/{}", type_name, id))
            .await?;

        let mut document = self.single(schema, Some(record), &args).await?;
        document.links = Some(self.links(&format!("{}/{}", schema.link, id)));
        Ok(document)
    }

    /// Linkage of one relationship of one record.
    pub async fn relationship(
        &self,
        type_name: &str,
        id: &str,
        relationship: &str,
    ) -> Result<Document, ApiError> {
        let schema = self.registry.schema(type_name)?;
        let owner = self.providers.get(type_name)?.fetch_one(id).await?;
        let object = self
            .serializer()
            .relationship(schema, &owner, relationship)
            .await?;

        let mut document = Document::new(PrimaryData::Linkage(
            object.data.unwrap_or(RelationshipData::One(None)),
        ));
        document.links = object.links;
        if let Some(serde_json::Value::Object(meta)) = object.meta {
            document.meta = meta;
        }
        Ok(document)
    }

    /// Targets of one relationship of one record, with the request's own
    /// query applied to the target type.
    pub async fn related(
        &self,
        type_name: &str,
        id: &str,
        relationship: &str,
        params: &RawParams,
    ) -> Result<Document, ApiError> {
        let schema = self.registry.schema(type_name)?;
        let rel = exposed_relationship(schema, id, relationship)?;
        let target = self.registry.schema(&rel.target)?;
        let args = compile(&self.registry, &rel.target, Endpoint::Related, params)?;
        let owner = self.providers.get(type_name)?.fetch_one(id).await?;

        let scope = rel.target_filter(slice::from_ref(&owner));
        let filter = match (scope, args.filter.clone()) {
            (None, _) => None,
            (Some(scope), None) => Some(scope),
            (Some(scope), Some(requested)) => Some(requested.and(scope)),
        };

        let mut document = if rel.is_many() {
            match &filter {
                Some(filter) => self.collection(target, Some(filter), &args).await?,
                None => {
                    let mut document = Document::new(PrimaryData::Many(Vec::new()));
                    document.set_pagination(0, args.limit.as_count(), args.skip);
                    document.set_warnings(&args.warnings);
                    document
                }
            }
        } else {
            let record = match &filter {
                Some(filter) => {
                    let mut records = self
                        .providers
                        .get(&rel.target)?
                        .fetch_many(Some(filter), 0, Limit::Bounded(2), &args.sort)
                        .await?
                        .into_iter()
                        .filter(|t| rel.links(&owner, t));
                    let first = records.next();
                    if records.next().is_some() {
                        return Err(ApiError::internal(format!(
                            "to-one relationship {}/{}/{} matched several records",
                            type_name, id, relationship
                        )));
                    }
                    first
                }
                None => None,
            };
            self.single(target, record, &args).await?
        };

        document.links = Some(self.links(&format!("{}/{}/{}", schema.link, id, relationship)));
        Ok(document)
    }

    fn serializer(&self) -> GraphSerializer<'_> {
        GraphSerializer::new(&self.registry, &self.providers, &self.options.base_url)
    }

    fn links(&self, path: &str) -> Links {
        Links {
            self_link: Some(format!(
                "{}{}",
                self.options.base_url.trim_end_matches('/'),
                path
            )),
            ..Links::default()
        }
    }

    /// Fetch, count and render a page; pagination meta belongs to this level only.
    async fn collection(
        &self,
        schema: &ResourceSchema,
        filter: Option<&FilterExpr>,
        args: &QueryArgs,
    ) -> Result<Document, ApiError> {
        let provider = self.providers.get(&schema.type_name)?;
        let (records, total) = futures::try_join!(
            provider.fetch_many(filter, args.skip, args.limit, &args.sort),
            provider.count(filter),
        )?;
        tracing::debug!(
            type_name = %schema.type_name,
            fetched = records.len(),
            total,
            "primary records fetched"
        );

        let compound = self
            .serializer()
            .serialize(&schema.type_name, &records, args)
            .await?;
        let mut document = Document::new(PrimaryData::Many(compound.data));
        document.included = compound.included;
        document.set_pagination(total, args.limit.as_count(), args.skip);
        document.set_warnings(&args.warnings);
        Ok(document)
    }

    async fn single(
        &self,
        schema: &ResourceSchema,
        record: Option<Record>,
        args: &QueryArgs,
    ) -> Result<Document, ApiError> {
        let Some(record) = record else {
            return Ok(Document::new(PrimaryData::One(None)));
        };
        let compound = self
            .serializer()
            .serialize(&schema.type_name, slice::from_ref(&record), args)
            .await?;
        let mut document = Document::new(PrimaryData::One(
            compound.data.into_iter().next().map(Box::new),
        ));
        document.included = compound.included;
        document.set_warnings(&args.warnings);
        Ok(document)
    }
}

fn exposed_relationship<'s>(
    schema: &'s ResourceSchema,
    id: &str,
    name: &str,
) -> Result<&'s RelationshipDescriptor, ApiError> {
    schema
        .get_relationship(name)
        .filter(|rel| rel.visibility.exposes_api)
        .ok_or_else(|| ApiError::not_found(format!("{}/{}/{}", schema.type_name, id, name)))
}

fn log_failure(context: &RequestContext, err: &ApiError) {
    if err.is_server_error() {
        tracing::error!(
            status = err.status(),
            method = %context.method,
            url = %context.url,
            client = context.client.as_deref().unwrap_or("-"),
            token = context.token.as_deref().unwrap_or("-"),
            body = context.body.as_deref().unwrap_or("-"),
            error = %err,
            "request failed"
        );
    } else {
        tracing::warn!(
            status = err.status(),
            method = %context.method,
            url = %context.url,
            error = %err,
            "request rejected"
        );
    }
}
