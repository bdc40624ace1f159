//! Error taxonomy for composed-query execution.
//!
//! Validation errors (`UnknownCore`, `InvalidMatchSpecification`, `UnsupportedQuery`,
//! `InvalidFacetSort`, `UnknownField`) are raised before any search is dispatched.
//! Index failures carry the name of the core they happened on.

use thiserror::Error;

/// Errors raised by the composed-query engine.
#[derive(Debug, Error)]
pub enum ComposeError {
    /// The request references a core that is not registered.
    #[error("Unknown core '{0}'")]
    UnknownCore(String),

    /// A match or unite cannot be resolved against the result core.
    #[error("{0}")]
    InvalidMatchSpecification(String),

    /// The composer has no translation for this relation on this field.
    #[error("'{relation}' not supported for the field '{field}'{}", detail(.reason))]
    UnsupportedQuery {
        relation: String,
        field: String,
        reason: String,
    },

    /// Facets can only be ordered by count.
    #[error("Value of \"sortBy\" should be in [\"count\"], got {sort_by:?} for facet '{fieldname}'")]
    InvalidFacetSort { fieldname: String, sort_by: String },

    /// A field named by the request or a document is not declared for the core.
    #[error("Unknown field '{field}' for core '{core}'")]
    UnknownField { core: String, field: String },

    /// A document value does not fit the declared field kind.
    #[error("Invalid value for field '{field}' in core '{core}': {reason}")]
    InvalidFieldValue {
        core: String,
        field: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Index I/O failure; fatal for the current request.
    #[error("Index error in core '{core}': {source}")]
    Index {
        core: String,
        #[source]
        source: tantivy::TantivyError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn detail(reason: &str) -> String {
    if reason.is_empty() {
        String::new()
    } else {
        format!(": {reason}")
    }
}

impl ComposeError {
    pub fn unsupported(
        relation: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::UnsupportedQuery {
            relation: relation.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn unknown_field(core: &str, field: &str) -> Self {
        Self::UnknownField {
            core: core.to_string(),
            field: field.to_string(),
        }
    }
}

pub type Result<T, E = ComposeError> = std::result::Result<T, E>;

/// Attaches the owning core name to tantivy errors.
pub trait OnCore<T> {
    fn on_core(self, core: &str) -> Result<T>;
}

impl<T> OnCore<T> for tantivy::Result<T> {
    fn on_core(self, core: &str) -> Result<T> {
        self.map_err(|source| ComposeError::Index {
            core: core.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_query_names_relation_and_field() {
        let err = ComposeError::unsupported(">", "title", "");
        assert_eq!(err.to_string(), "'>' not supported for the field 'title'");

        let err = ComposeError::unsupported("=", "year", "'abc' is not an integer");
        assert_eq!(
            err.to_string(),
            "'=' not supported for the field 'year': 'abc' is not an integer"
        );
    }

    #[test]
    fn index_errors_carry_core_name() {
        let res: tantivy::Result<()> = Err(tantivy::TantivyError::InvalidArgument("boom".into()));
        let err = res.on_core("coreA").unwrap_err();
        assert!(err.to_string().contains("coreA"));
        assert!(matches!(err, ComposeError::Index { .. }));
    }
}
