//! Field registry: semantic field kinds, their tantivy schema, and document encoding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tantivy::schema::{
    FAST, FacetOptions, Field, INDEXED, IndexRecordOption, STORED, STRING, Schema,
    TextFieldIndexing, TextOptions,
};
use tantivy::schema::{Facet, Term};
use tantivy::TantivyDocument;

use crate::error::{ComposeError, Result};

/// Stored field holding each document's identifier.
pub const IDFIELD: &str = "__id__";

/// Analyzer of stemmed text fields.
pub const STEMMING_TOKENIZER: &str = "en_stem";

/// Separator for hierarchical drilldown values such as `fiction>fantasy`.
pub const DRILLDOWN_SEPARATOR: char = '>';

/// Semantic kind of a field; decides indexing, query translation and sorting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    /// Tokenized full text, optionally with English stemming.
    Text {
        #[serde(default)]
        stemmed: bool,
    },
    /// Exact string, not tokenized.
    Untokenized,
    /// Exact string usable as a sort key.
    Sorted,
    /// 32-bit integer values.
    Integer,
    /// 64-bit integer values.
    Long,
    /// Unsigned join key.
    Key,
    /// Facet values, optionally hierarchical.
    Drilldown {
        #[serde(default)]
        hierarchical: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Value type used to parse query terms for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Integer,
    Long,
    String,
}

/// How a sortable field's values are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortFieldType {
    /// Signed integers (integer and long fields).
    Long,
    /// Unsigned join keys.
    Key,
    /// Exact strings.
    String,
}

/// Comparable sort value. `Min` and `Max` stand in for missing values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SortValue {
    Min,
    Int(i64),
    Str(String),
    Max,
}

/// Value supplied for a document field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Text(String),
    Path(Vec<String>),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        Self::Path(value)
    }
}

/// A document to index: ordered `(field, value)` pairs, fields may repeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreDocument {
    pub fields: Vec<(String, FieldValue)>,
}

impl CoreDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.push((field.to_string(), value.into()));
        self
    }

    pub fn push(&mut self, field: &str, value: impl Into<FieldValue>) {
        self.fields.push((field.to_string(), value.into()));
    }
}

/// Field kinds of one core, in name order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldRegistry {
    fields: BTreeMap<String, FieldKind>,
}

impl FieldRegistry {
    pub fn new(definitions: impl IntoIterator<Item = FieldDefinition>) -> Result<Self> {
        let mut fields = BTreeMap::new();
        for def in definitions {
            if def.name == IDFIELD || def.name.is_empty() {
                return Err(ComposeError::InvalidConfig(format!(
                    "field name '{}' is reserved",
                    def.name
                )));
            }
            if fields.insert(def.name.clone(), def.kind).is_some() {
                return Err(ComposeError::InvalidConfig(format!(
                    "field '{}' declared twice",
                    def.name
                )));
            }
        }
        Ok(Self { fields })
    }

    /// Builder-style declaration, mostly for tests and embedded use.
    pub fn with(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.insert(name.to_string(), kind);
        self
    }

    pub fn kind(&self, field: &str) -> Option<&FieldKind> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn value_type(&self, field: &str) -> ValueType {
        match self.kind(field) {
            Some(FieldKind::Integer) => ValueType::Integer,
            Some(FieldKind::Long | FieldKind::Key) => ValueType::Long,
            _ => ValueType::String,
        }
    }

    pub fn is_untokenized(&self, field: &str) -> bool {
        !matches!(self.kind(field), Some(FieldKind::Text { .. }) | None)
    }

    pub fn is_drilldown_field(&self, field: &str) -> bool {
        matches!(self.kind(field), Some(FieldKind::Drilldown { .. }))
    }

    pub fn is_hierarchical_drilldown(&self, field: &str) -> bool {
        matches!(
            self.kind(field),
            Some(FieldKind::Drilldown { hierarchical: true })
        )
    }

    pub fn is_key_field(&self, field: &str) -> bool {
        matches!(self.kind(field), Some(FieldKind::Key))
    }

    pub fn phrase_query_possible(&self, field: &str) -> bool {
        matches!(self.kind(field), Some(FieldKind::Text { .. }))
    }

    pub fn sort_field_type(&self, field: &str) -> Option<SortFieldType> {
        match self.kind(field)? {
            FieldKind::Integer | FieldKind::Long => Some(SortFieldType::Long),
            FieldKind::Key => Some(SortFieldType::Key),
            FieldKind::Sorted => Some(SortFieldType::String),
            FieldKind::Text { .. } | FieldKind::Untokenized | FieldKind::Drilldown { .. } => None,
        }
    }

    /// Missing values sort last in either direction.
    pub fn default_missing_value_for_sort(&self, _field: &str, descending: bool) -> SortValue {
        if descending {
            SortValue::Min
        } else {
            SortValue::Max
        }
    }

    /// Path segments of a drilldown value; hierarchical values split on `>`.
    pub fn drilldown_path(&self, field: &str, value: &str) -> Vec<String> {
        if self.is_hierarchical_drilldown(field) {
            value
                .split(DRILLDOWN_SEPARATOR)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        } else {
            vec![value.to_string()]
        }
    }

    pub fn make_drilldown_term(&self, field: Field, name: &str, value: &str) -> Term {
        let facet = Facet::from_path(self.drilldown_path(name, value));
        Term::from_facet(field, &facet)
    }

    pub fn fieldnames(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    pub fn drilldown_fieldnames(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|(_, kind)| matches!(kind, FieldKind::Drilldown { .. }))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn build_schema(&self) -> Schema {
        let mut schema_builder = Schema::builder();
        schema_builder.add_text_field(IDFIELD, STRING | STORED);
        for (name, kind) in &self.fields {
            match kind {
                FieldKind::Text { stemmed } => {
                    let tokenizer = if *stemmed { STEMMING_TOKENIZER } else { "default" };
                    let indexing = TextFieldIndexing::default()
                        .set_tokenizer(tokenizer)
                        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
                    schema_builder
                        .add_text_field(name, TextOptions::default().set_indexing_options(indexing));
                }
                FieldKind::Untokenized => {
                    schema_builder.add_text_field(name, STRING);
                }
                FieldKind::Sorted => {
                    schema_builder.add_text_field(name, STRING | FAST);
                }
                FieldKind::Integer | FieldKind::Long => {
                    schema_builder.add_i64_field(name, INDEXED | FAST);
                }
                FieldKind::Key => {
                    schema_builder.add_u64_field(name, INDEXED | FAST);
                }
                FieldKind::Drilldown { .. } => {
                    schema_builder.add_facet_field(name, FacetOptions::default());
                }
            }
        }
        schema_builder.build()
    }

    /// Encode a document for the given schema; `core` only labels errors.
    pub fn encode(
        &self,
        core: &str,
        schema: &Schema,
        identifier: &str,
        document: &CoreDocument,
    ) -> Result<TantivyDocument> {
        let id_field = schema_field(core, schema, IDFIELD)?;
        let mut doc = TantivyDocument::default();
        doc.add_text(id_field, identifier);
        for (name, value) in &document.fields {
            let kind = self
                .kind(name)
                .ok_or_else(|| ComposeError::unknown_field(core, name))?;
            let field = schema_field(core, schema, name)?;
            let invalid = |reason: String| ComposeError::InvalidFieldValue {
                core: core.to_string(),
                field: name.clone(),
                reason,
            };
            match (kind, value) {
                (
                    FieldKind::Text { .. } | FieldKind::Untokenized | FieldKind::Sorted,
                    FieldValue::Text(s),
                ) => doc.add_text(field, s),
                (FieldKind::Text { .. } | FieldKind::Untokenized | FieldKind::Sorted, FieldValue::Int(n)) => {
                    doc.add_text(field, n.to_string())
                }
                (FieldKind::Integer, FieldValue::Int(n)) => {
                    let n = i32::try_from(*n).map_err(|_| invalid(format!("{n} exceeds 32 bits")))?;
                    doc.add_i64(field, i64::from(n));
                }
                (FieldKind::Long, FieldValue::Int(n)) => doc.add_i64(field, *n),
                (FieldKind::Key, FieldValue::Int(n)) => {
                    let key = u64::try_from(*n).map_err(|_| invalid(format!("negative key {n}")))?;
                    doc.add_u64(field, key);
                }
                (FieldKind::Integer | FieldKind::Long | FieldKind::Key, FieldValue::Text(s)) => {
                    let n: i64 = s
                        .trim()
                        .parse()
                        .map_err(|_| invalid(format!("'{s}' is not a number")))?;
                    match kind {
                        FieldKind::Key => {
                            let key = u64::try_from(n)
                                .map_err(|_| invalid(format!("negative key {n}")))?;
                            doc.add_u64(field, key);
                        }
                        FieldKind::Integer => {
                            let n = i32::try_from(n)
                                .map_err(|_| invalid(format!("{n} exceeds 32 bits")))?;
                            doc.add_i64(field, i64::from(n));
                        }
                        _ => doc.add_i64(field, n),
                    }
                }
                (FieldKind::Drilldown { .. }, FieldValue::Text(s)) => {
                    let path = self.drilldown_path(name, s);
                    if path.is_empty() {
                        return Err(invalid("empty drilldown value".to_string()));
                    }
                    doc.add_facet(field, Facet::from_path(path));
                }
                (FieldKind::Drilldown { .. }, FieldValue::Path(path)) => {
                    if path.is_empty() {
                        return Err(invalid("empty drilldown path".to_string()));
                    }
                    doc.add_facet(field, Facet::from_path(path));
                }
                (FieldKind::Drilldown { .. }, FieldValue::Int(n)) => {
                    doc.add_facet(field, Facet::from_path([n.to_string()]));
                }
                (_, FieldValue::Path(_)) => {
                    return Err(invalid("paths are only valid for drilldown fields".to_string()));
                }
            }
        }
        Ok(doc)
    }
}

pub fn schema_field(core: &str, schema: &Schema, name: &str) -> Result<Field> {
    schema
        .get_field(name)
        .map_err(|_| ComposeError::unknown_field(core, name))
}
