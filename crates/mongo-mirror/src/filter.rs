//! Per-collection query filter construction.

use mongodb::bson::{doc, Bson, Document};

use crate::config::{CollectionSpec, FilterPrecedence};
use crate::error::{Error, Result};
use crate::identifier::normalize_filter;

/// Builds the source filter for each collection of a run.
#[derive(Debug, Clone)]
pub struct FilterBuilder<'a> {
    tenants: &'a [String],
    tenant_field: &'a str,
    precedence: FilterPrecedence,
}

impl<'a> FilterBuilder<'a> {
    /// Creates a builder scoping multi-tenant collections to `tenants`.
    #[must_use]
    pub fn new(tenants: &'a [String], tenant_field: &'a str, precedence: FilterPrecedence) -> Self {
        Self {
            tenants,
            tenant_field,
            precedence,
        }
    }

    /// Builds and normalizes the filter for `spec`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidFilterSyntax`] if the explicit filter is malformed,
    /// [`Error::InvalidIdentifier`] if a hyphenated value is not a UUID.
    pub fn build(&self, spec: &CollectionSpec) -> Result<Document> {
        let tenant = self.tenant_filter(spec);
        let explicit = match spec.filter.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => Some(parse_filter(&spec.name, text)?),
            _ => None,
        };

        let mut filter = match (tenant, explicit) {
            (Some(tenant), Some(explicit)) => self.combine(tenant, explicit),
            (Some(only), None) | (None, Some(only)) => only,
            (None, None) => Document::new(),
        };

        normalize_filter(&mut filter)?;
        Ok(filter)
    }

    fn tenant_filter(&self, spec: &CollectionSpec) -> Option<Document> {
        if !spec.is_multi_tenant() || self.tenants.is_empty() {
            return None;
        }

        let tenants: Vec<Bson> = self
            .tenants
            .iter()
            .map(|t| Bson::String(t.clone()))
            .collect();
        let mut filter = Document::new();
        filter.insert(self.tenant_field, doc! { "$in": tenants });
        Some(filter)
    }

    fn combine(&self, tenant: Document, explicit: Document) -> Document {
        match self.precedence {
            FilterPrecedence::And => doc! { "$and": [tenant, explicit] },
            FilterPrecedence::Explicit => explicit,
            FilterPrecedence::Merge => {
                let mut merged = tenant;
                for (key, value) in explicit {
                    merged.insert(key, value);
                }
                merged
            }
        }
    }
}

/// Parses a JSON (or extended JSON) object into a filter document.
///
/// # Errors
///
/// Returns [`Error::InvalidFilterSyntax`] if `text` is not a JSON object.
pub fn parse_filter(collection: &str, text: &str) -> Result<Document> {
    let syntax = |message: String| Error::InvalidFilterSyntax {
        collection: collection.to_string(),
        message,
    };

    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| syntax(e.to_string()))?;
    match Bson::try_from(value).map_err(|e| syntax(e.to_string()))? {
        Bson::Document(filter) => Ok(filter),
        other => Err(syntax(format!(
            "expected a JSON object, found {:?}",
            other.element_type()
        ))),
    }
}
