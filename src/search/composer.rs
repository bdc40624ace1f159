//! Translation of query expression trees into tantivy queries.

use std::ops::Bound;
use std::sync::Arc;

use fxhash::FxHashSet;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tantivy::query::{
    AllQuery, BooleanQuery, BoostQuery, EmptyQuery, Occur, PhraseQuery, Query, RangeQuery,
    RegexQuery, TermQuery,
};
use tantivy::schema::{Field, IndexRecordOption, Schema, Term};
use tantivy::tokenizer::{
    Language, LowerCaser, PreTokenizedStream, PreTokenizedString, RemoveLongFilter,
    SimpleTokenizer, Stemmer, TextAnalyzer, TokenStream, Tokenizer, TokenizerManager,
};

use crate::error::{ComposeError, Result};
use crate::model::{BoolOp, QueryExpr, Relation};
use crate::search::fields::{FieldKind, FieldRegistry, STEMMING_TOKENIZER, ValueType};

/// Trailing-wildcard prefix term: at least two word characters, then `*`.
static PREFIX_TERM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w-]{2,}\*$").expect("valid prefix pattern"));

/// A field searched by unqualified terms, with its boost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnqualifiedField {
    pub field: String,
    #[serde(default = "default_boost")]
    pub boost: f32,
}

fn default_boost() -> f32 {
    1.0
}

impl UnqualifiedField {
    pub fn new(field: impl Into<String>, boost: f32) -> Self {
        Self {
            field: field.into(),
            boost,
        }
    }
}

/// English stemming that leaves a configured set of words as written, at index and
/// query time alike. Registered in place of `en_stem` on cores that declare such words.
#[derive(Clone)]
pub struct ProtectedStemmer {
    plain: TextAnalyzer,
    stemmed: TextAnalyzer,
    protected: Arc<FxHashSet<String>>,
}

impl ProtectedStemmer {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let plain = TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(RemoveLongFilter::limit(40))
            .filter(LowerCaser)
            .build();
        let stemmed = TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(RemoveLongFilter::limit(40))
            .filter(LowerCaser)
            .filter(Stemmer::new(Language::English))
            .build();
        Self {
            plain,
            stemmed,
            protected: Arc::new(
                words
                    .into_iter()
                    .map(|w| w.as_ref().trim().to_lowercase())
                    .filter(|w| !w.is_empty())
                    .collect(),
            ),
        }
    }

    pub fn register(self, tokenizers: &TokenizerManager) {
        tokenizers.register(STEMMING_TOKENIZER, self);
    }
}

impl Tokenizer for ProtectedStemmer {
    type TokenStream<'a> = PreTokenizedStream;

    fn token_stream<'a>(&'a mut self, text: &'a str) -> Self::TokenStream<'a> {
        let mut tokens = Vec::new();
        let mut stream = self.plain.token_stream(text);
        while stream.advance() {
            tokens.push(stream.token().clone());
        }
        drop(stream);
        for token in &mut tokens {
            if self.protected.contains(&token.text) {
                continue;
            }
            let stem = {
                let mut stems = self.stemmed.token_stream(&token.text);
                stems.advance().then(|| stems.token().text.clone())
            };
            if let Some(stem) = stem {
                token.text = stem;
            }
        }
        PreTokenizedString {
            text: text.to_string(),
            tokens,
        }
        .into()
    }
}

/// Builds tantivy queries for one core.
#[derive(Clone)]
pub struct QueryComposer {
    registry: Arc<FieldRegistry>,
    schema: Schema,
    unqualified: Vec<UnqualifiedField>,
    plain: TextAnalyzer,
    stemmed: TextAnalyzer,
}

impl std::fmt::Debug for QueryComposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryComposer")
            .field("unqualified", &self.unqualified)
            .finish_non_exhaustive()
    }
}

impl QueryComposer {
    pub fn new(
        registry: Arc<FieldRegistry>,
        schema: Schema,
        unqualified: Vec<UnqualifiedField>,
        tokenizers: &TokenizerManager,
    ) -> Result<Self> {
        let analyzer = |name: &str| {
            tokenizers.get(name).ok_or_else(|| {
                ComposeError::InvalidConfig(format!("tokenizer '{name}' is not registered"))
            })
        };
        Ok(Self {
            plain: analyzer("default")?,
            stemmed: analyzer(STEMMING_TOKENIZER)?,
            registry,
            schema,
            unqualified,
        })
    }

    pub fn compose(&self, expr: &QueryExpr) -> Result<Box<dyn Query>> {
        match expr {
            QueryExpr::Term { term } => self.unqualified_query(term),
            QueryExpr::Clause {
                index,
                relation,
                term,
                boost,
            } => {
                let query = self.clause_query(index, relation, term)?;
                Ok(if boost.is_neutral() {
                    query
                } else {
                    Box::new(BoostQuery::new(query, boost.0))
                })
            }
            QueryExpr::Boolean { operator, lhs, rhs } => {
                let (left, right) = match operator {
                    BoolOp::And => (Occur::Must, Occur::Must),
                    BoolOp::Or => (Occur::Should, Occur::Should),
                    BoolOp::Not => (Occur::Must, Occur::MustNot),
                };
                Ok(Box::new(BooleanQuery::new(vec![
                    (left, self.compose(lhs)?),
                    (right, self.compose(rhs)?),
                ])))
            }
        }
    }

    fn unqualified_query(&self, term: &str) -> Result<Box<dyn Query>> {
        if term.trim() == "*" {
            return Ok(Box::new(AllQuery));
        }
        let phrase = self.tokens(&self.plain, term).len() > 1;
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        for uf in &self.unqualified {
            if phrase && !self.registry.phrase_query_possible(&uf.field) {
                continue;
            }
            // Untokenized fields take the term verbatim, as a qualified `=` does.
            let query = self.clause_query(&uf.field, &Relation::Eq, term)?;
            let query: Box<dyn Query> = if uf.boost == 1.0 {
                query
            } else {
                Box::new(BoostQuery::new(query, uf.boost))
            };
            clauses.push((Occur::Should, query));
        }
        Ok(match clauses.len() {
            0 => Box::new(EmptyQuery),
            1 => clauses.remove(0).1,
            _ => Box::new(BooleanQuery::new(clauses)),
        })
    }

    fn clause_query(&self, index: &str, relation: &Relation, term: &str) -> Result<Box<dyn Query>> {
        let Some(kind) = self.registry.kind(index) else {
            return Ok(Box::new(EmptyQuery));
        };
        let Ok(field) = self.schema.get_field(index) else {
            return Ok(Box::new(EmptyQuery));
        };
        match relation {
            Relation::Exact => self.exact_query(field, index, relation, term),
            Relation::Eq if self.registry.is_untokenized(index) => {
                self.exact_query(field, index, relation, term)
            }
            Relation::Eq => {
                let stemmed = matches!(kind, FieldKind::Text { stemmed: true });
                Ok(self.text_query(field, stemmed, term))
            }
            Relation::Lt | Relation::Le | Relation::Ge | Relation::Gt => {
                self.range_query(field, index, relation, term)
            }
            Relation::Other(_) => Err(ComposeError::unsupported(relation.to_string(), index, "")),
        }
    }

    /// Equality on the field's encoded value.
    fn exact_query(
        &self,
        field: Field,
        index: &str,
        relation: &Relation,
        term: &str,
    ) -> Result<Box<dyn Query>> {
        if self.registry.is_drilldown_field(index) {
            let term = self.registry.make_drilldown_term(field, index, term);
            return Ok(Box::new(TermQuery::new(term, IndexRecordOption::Basic)));
        }
        let term = self.encode_term(field, index, relation, term)?;
        let option = if self.registry.phrase_query_possible(index) {
            IndexRecordOption::WithFreqs
        } else {
            IndexRecordOption::Basic
        };
        Ok(Box::new(TermQuery::new(term, option)))
    }

    /// Analyzed match on a tokenized field: term, OR of terms, prefix or phrase.
    fn text_query(&self, field: Field, stemmed: bool, term: &str) -> Box<dyn Query> {
        let pre_tokens = self.tokens(&self.plain, term);
        if pre_tokens.len() == 1 && PREFIX_TERM.is_match(term.trim()) {
            let prefix = regex::escape(&pre_tokens[0]);
            if let Ok(query) = RegexQuery::from_pattern(&format!("{prefix}.*"), field) {
                return Box::new(query);
            }
        }
        let analyzer = if stemmed { &self.stemmed } else { &self.plain };
        let mut tokens = self.tokens(analyzer, term);
        match pre_tokens.len() {
            0 => Box::new(EmptyQuery),
            1 => {
                if stemmed {
                    tokens.extend(pre_tokens);
                }
                tokens.dedup();
                let mut queries: Vec<(Occur, Box<dyn Query>)> = tokens
                    .into_iter()
                    .map(|t| {
                        let query: Box<dyn Query> = Box::new(TermQuery::new(
                            Term::from_field_text(field, &t),
                            IndexRecordOption::WithFreqs,
                        ));
                        (Occur::Should, query)
                    })
                    .collect();
                match queries.len() {
                    0 => Box::new(EmptyQuery),
                    1 => queries.remove(0).1,
                    _ => Box::new(BooleanQuery::new(queries)),
                }
            }
            _ => {
                let terms: Vec<Term> = tokens
                    .iter()
                    .map(|t| Term::from_field_text(field, t))
                    .collect();
                match terms.len() {
                    0 => Box::new(EmptyQuery),
                    1 => Box::new(TermQuery::new(
                        terms[0].clone(),
                        IndexRecordOption::WithFreqs,
                    )),
                    _ => Box::new(PhraseQuery::new(terms)),
                }
            }
        }
    }

    fn range_query(
        &self,
        field: Field,
        index: &str,
        relation: &Relation,
        term: &str,
    ) -> Result<Box<dyn Query>> {
        if self.registry.is_drilldown_field(index) {
            return Err(ComposeError::unsupported(
                relation.to_string(),
                index,
                "drilldown fields have no order",
            ));
        }
        let bound = self.encode_term(field, index, relation, term)?;
        let (lower, upper) = match relation {
            Relation::Lt => (Bound::Unbounded, Bound::Excluded(bound)),
            Relation::Le => (Bound::Unbounded, Bound::Included(bound)),
            Relation::Gt => (Bound::Excluded(bound), Bound::Unbounded),
            Relation::Ge => (Bound::Included(bound), Bound::Unbounded),
            _ => return Err(ComposeError::unsupported(relation.to_string(), index, "")),
        };
        Ok(Box::new(RangeQuery::new(lower, upper)))
    }

    /// Term for `value`, typed by the field's value type.
    fn encode_term(
        &self,
        field: Field,
        index: &str,
        relation: &Relation,
        value: &str,
    ) -> Result<Term> {
        let not_a_number = |what: &str| {
            ComposeError::unsupported(
                relation.to_string(),
                index,
                format!("'{value}' is not {what}"),
            )
        };
        Ok(match self.registry.value_type(index) {
            ValueType::Integer => {
                let n: i32 = value.trim().parse().map_err(|_| not_a_number("an integer"))?;
                Term::from_field_i64(field, i64::from(n))
            }
            ValueType::Long if self.registry.is_key_field(index) => {
                let n: u64 = value.trim().parse().map_err(|_| not_a_number("a key"))?;
                Term::from_field_u64(field, n)
            }
            ValueType::Long => {
                let n: i64 = value.trim().parse().map_err(|_| not_a_number("a long"))?;
                Term::from_field_i64(field, n)
            }
            ValueType::String => Term::from_field_text(field, value),
        })
    }

    fn tokens(&self, analyzer: &TextAnalyzer, text: &str) -> Vec<String> {
        let mut analyzer = analyzer.clone();
        let mut stream = analyzer.token_stream(text);
        let mut tokens = Vec::new();
        while stream.advance() {
            tokens.push(stream.token().text.clone());
        }
        tokens
    }
}
