//! JSON:API wire types produced by the serializer.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::{ApiError, ErrorObject};

pub const JSONAPI_VERSION: &str = "1.0";

/// `{type, id, meta}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceIdentifier {
    #[serde(rename = "type")]
    pub type_name: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl ResourceIdentifier {
    pub fn new(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
            meta: None,
        }
    }
}

/// Identifier linkage: one (possibly null) or many.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RelationshipData {
    One(Option<ResourceIdentifier>),
    Many(Vec<ResourceIdentifier>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Links {
    #[serde(rename = "self", skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related: Option<String>,
    /// Resource links only: the record's parent scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl Links {
    pub fn is_empty(&self) -> bool {
        self.self_link.is_none() && self.related.is_none() && self.parent.is_none()
    }
}

/// `{links, data, meta}`. `data` is omitted unless linkage was resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RelationshipObject {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<Links>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<RelationshipData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceObject {
    #[serde(rename = "type")]
    pub type_name: String,
    pub id: String,
    pub attributes: Map<String, Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, RelationshipObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<Links>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl ResourceObject {
    pub fn identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier::new(self.type_name.clone(), self.id.clone())
    }
}

/// Primary data: a single resource (or null) or a collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PrimaryData {
    One(Option<Box<ResourceObject>>),
    Many(Vec<ResourceObject>),
    /// Relationship endpoint linkage.
    Linkage(RelationshipData),
}

/// Top-level success document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub data: PrimaryData,
    pub included: Vec<ResourceObject>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<Links>,
    pub jsonapi: Value,
}

impl Document {
    pub fn new(data: PrimaryData) -> Self {
        Self {
            data,
            included: Vec::new(),
            meta: Map::new(),
            links: None,
            jsonapi: json!({ "version": JSONAPI_VERSION }),
        }
    }

    /// `meta.pagination` for a top-level collection.
    pub fn set_pagination(&mut self, total: u64, limit: Option<u64>, offset: u64) {
        self.meta.insert(
            "pagination".to_string(),
            json!({ "total": total, "limit": limit, "offset": offset }),
        );
    }

    pub fn set_warnings(&mut self, warnings: &[String]) {
        if !warnings.is_empty() {
            self.meta.insert("warnings".to_string(), json!(warnings));
        }
    }
}

/// Top-level error document. Replaces the whole response on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDocument {
    pub errors: Vec<ErrorObject>,
}

impl ErrorDocument {
    /// HTTP status of the first error, 500 if there is none.
    pub fn status(&self) -> u16 {
        self.errors.first().map_or(500, |e| e.status)
    }
}

impl From<&ApiError> for ErrorDocument {
    fn from(err: &ApiError) -> Self {
        Self {
            errors: vec![err.to_error_object()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relationship_data_shapes() {
        let one = RelationshipData::One(Some(ResourceIdentifier::new("users", "1")));
        assert_eq!(
            serde_json::to_value(&one).unwrap(),
            json!({"type": "users", "id": "1"})
        );
        assert_eq!(
            serde_json::to_value(RelationshipData::One(None)).unwrap(),
            Value::Null
        );
        assert_eq!(
            serde_json::to_value(RelationshipData::Many(Vec::new())).unwrap(),
            json!([])
        );
    }

    #[test]
    fn relationship_object_omits_unresolved_data() {
        let rel = RelationshipObject {
            links: Some(Links {
                self_link: Some("/a/1/relationships/b".into()),
                ..Links::default()
            }),
            data: None,
            meta: None,
        };
        assert_eq!(
            serde_json::to_value(&rel).unwrap(),
            json!({"links": {"self": "/a/1/relationships/b"}})
        );

        let rel = RelationshipObject {
            data: Some(RelationshipData::One(None)),
            ..RelationshipObject::default()
        };
        assert_eq!(serde_json::to_value(&rel).unwrap(), json!({"data": null}));
    }

    #[test]
    fn document_meta() {
        let mut doc = Document::new(PrimaryData::Many(Vec::new()));
        doc.set_pagination(12, Some(5), 10);
        doc.set_warnings(&[]);
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(
            value,
            json!({
                "data": [],
                "included": [],
                "meta": {"pagination": {"total": 12, "limit": 5, "offset": 10}},
                "jsonapi": {"version": "1.0"}
            })
        );

        doc.set_warnings(&["use ct".to_string()]);
        assert_eq!(doc.meta["warnings"], json!(["use ct"]));
    }

    #[test]
    fn error_document_from_api_error() {
        let doc = ErrorDocument::from(&ApiError::not_found("articles/9"));
        assert_eq!(doc.status(), 404);
        assert_eq!(
            serde_json::to_value(&doc).unwrap(),
            json!({"errors": [{"status": 404, "title": "Resource not found", "detail": "articles/9"}]})
        );
    }
}
