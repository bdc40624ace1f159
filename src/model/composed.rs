//! The composed-query request: per-core queries, filters, joins and post-processing.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{ComposeError, Result};
use crate::model::expr::QueryExpr;
use crate::search::fields::SortValue;

/// One side of a match: a core and the field holding its join key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSide {
    pub core: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
}

impl JoinSide {
    /// Side whose key identifies documents uniquely (required for the result core).
    pub fn unique(core: impl Into<String>, unique_key: impl Into<String>) -> Self {
        Self {
            core: core.into(),
            key: None,
            unique_key: Some(unique_key.into()),
        }
    }

    pub fn key(core: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            core: core.into(),
            key: Some(key.into()),
            unique_key: None,
        }
    }

    fn key_name(&self) -> Option<&str> {
        self.unique_key.as_deref().or(self.key.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSpec {
    pub left: JoinSide,
    pub right: JoinSide,
}

/// One side of a unite: documents of `core` matching `query`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniteSide {
    pub core: String,
    pub query: QueryExpr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniteSpec {
    pub left: UniteSide,
    pub right: UniteSide,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetRequest {
    pub fieldname: String,
    /// Maximum number of terms per level; 0 means unlimited.
    #[serde(default)]
    pub max_terms: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
}

impl FacetRequest {
    pub fn new(fieldname: impl Into<String>, max_terms: usize) -> Self {
        Self {
            fieldname: fieldname.into(),
            max_terms,
            path: Vec::new(),
            sort_by: None,
        }
    }

    pub fn at_path(mut self, path: &[&str]) -> Self {
        self.path = path.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn sorted_by(mut self, sort_by: impl Into<String>) -> Self {
        self.sort_by = Some(sort_by.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrilldownQuery {
    pub fieldname: String,
    pub path: Vec<String>,
}

/// Missing value given by a caller for a sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MissingValue {
    Int(i64),
    Str(String),
}

impl From<&MissingValue> for SortValue {
    fn from(value: &MissingValue) -> Self {
        match value {
            MissingValue::Int(n) => SortValue::Int(*n),
            MissingValue::Str(s) => SortValue::Str(s.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortKey {
    /// Field name, or `score` for relevance.
    pub sort_by: String,
    #[serde(default)]
    pub sort_descending: bool,
    /// Core holding the sort field; the result core when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_value: Option<MissingValue>,
}

impl SortKey {
    pub fn new(sort_by: impl Into<String>, sort_descending: bool) -> Self {
        Self {
            sort_by: sort_by.into(),
            sort_descending,
            core: None,
            missing_value: None,
        }
    }

    pub fn on_core(mut self, core: impl Into<String>) -> Self {
        self.core = Some(core.into());
        self
    }

    pub fn missing(mut self, value: MissingValue) -> Self {
        self.missing_value = Some(value);
        self
    }

    pub fn is_score(&self) -> bool {
        self.sort_by == "score"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestionRequest {
    pub suggests: Vec<String>,
    pub count: usize,
    pub field: String,
}

/// A single logical request spanning one or more cores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposedQuery {
    pub results_from: String,
    #[serde(default)]
    queries: BTreeMap<String, Option<QueryExpr>>,
    #[serde(default)]
    filter_queries: BTreeMap<String, Vec<QueryExpr>>,
    #[serde(default)]
    rank_queries: BTreeMap<String, QueryExpr>,
    /// `(core, facet)` in the order they were added.
    #[serde(default)]
    facets: Vec<(String, FacetRequest)>,
    #[serde(default)]
    drilldown_queries: BTreeMap<String, Vec<DrilldownQuery>>,
    #[serde(default)]
    matches: Vec<MatchSpec>,
    #[serde(default)]
    unites: Vec<UniteSpec>,
    #[serde(default)]
    other_core_facet_filters: BTreeMap<String, Vec<QueryExpr>>,
    #[serde(default)]
    sort_keys: Vec<SortKey>,
    #[serde(default)]
    pub start: usize,
    #[serde(default = "default_stop")]
    pub stop: usize,
    #[serde(default)]
    pub dedup_field: Option<String>,
    #[serde(default)]
    pub dedup_sort_field: Option<String>,
    #[serde(default)]
    pub grouping_field: Option<String>,
    /// Clustering directives; carried for front ends, not computed.
    #[serde(default)]
    pub cluster_fields: Vec<(String, f32)>,
    #[serde(default)]
    pub suggestion_request: Option<SuggestionRequest>,
    /// Result-core key field whose values are returned as `keys`.
    #[serde(default)]
    pub export_key: Option<String>,
}

fn default_stop() -> usize {
    10
}

impl ComposedQuery {
    pub fn new(results_from: impl Into<String>) -> Self {
        Self {
            results_from: results_from.into(),
            queries: BTreeMap::new(),
            filter_queries: BTreeMap::new(),
            rank_queries: BTreeMap::new(),
            facets: Vec::new(),
            drilldown_queries: BTreeMap::new(),
            matches: Vec::new(),
            unites: Vec::new(),
            other_core_facet_filters: BTreeMap::new(),
            sort_keys: Vec::new(),
            start: 0,
            stop: default_stop(),
            dedup_field: None,
            dedup_sort_field: None,
            grouping_field: None,
            cluster_fields: Vec::new(),
            suggestion_request: None,
            export_key: None,
        }
    }

    /// Set a core's base query; `None` registers the core without constraining it.
    pub fn set_core_query(&mut self, core: &str, query: Option<QueryExpr>) -> &mut Self {
        self.queries.insert(core.to_string(), query);
        self
    }

    pub fn add_filter_query(&mut self, core: &str, query: QueryExpr) -> &mut Self {
        self.filter_queries
            .entry(core.to_string())
            .or_default()
            .push(query);
        self
    }

    pub fn set_rank_query(&mut self, core: &str, query: QueryExpr) -> &mut Self {
        self.rank_queries.insert(core.to_string(), query);
        self
    }

    pub fn add_facet(&mut self, core: &str, facet: FacetRequest) -> &mut Self {
        self.facets.push((core.to_string(), facet));
        self
    }

    pub fn add_drilldown_query(&mut self, core: &str, fieldname: &str, path: &[&str]) -> &mut Self {
        self.drilldown_queries
            .entry(core.to_string())
            .or_default()
            .push(DrilldownQuery {
                fieldname: fieldname.to_string(),
                path: path.iter().map(|s| s.to_string()).collect(),
            });
        self
    }

    pub fn add_match(&mut self, left: JoinSide, right: JoinSide) -> &mut Self {
        self.matches.push(MatchSpec { left, right });
        self
    }

    pub fn add_unite(
        &mut self,
        left_core: &str,
        left_query: QueryExpr,
        right_core: &str,
        right_query: QueryExpr,
    ) -> &mut Self {
        self.unites.push(UniteSpec {
            left: UniteSide {
                core: left_core.to_string(),
                query: left_query,
            },
            right: UniteSide {
                core: right_core.to_string(),
                query: right_query,
            },
        });
        self
    }

    pub fn add_other_core_facet_filter(&mut self, core: &str, query: QueryExpr) -> &mut Self {
        self.other_core_facet_filters
            .entry(core.to_string())
            .or_default()
            .push(query);
        self
    }

    pub fn add_sort_key(&mut self, key: SortKey) -> &mut Self {
        self.sort_keys.push(key);
        self
    }

    pub fn set_suggestion_request(&mut self, request: SuggestionRequest) -> &mut Self {
        self.suggestion_request = Some(request);
        self
    }

    pub fn query_for(&self, core: &str) -> Option<&QueryExpr> {
        self.queries.get(core).and_then(Option::as_ref)
    }

    pub fn filter_queries_for(&self, core: &str) -> &[QueryExpr] {
        self.filter_queries.get(core).map_or(&[], Vec::as_slice)
    }

    pub fn rank_queries(&self) -> impl Iterator<Item = (&str, &QueryExpr)> {
        self.rank_queries.iter().map(|(c, q)| (c.as_str(), q))
    }

    pub fn facets(&self) -> &[(String, FacetRequest)] {
        &self.facets
    }

    pub fn facets_for<'a>(&'a self, core: &'a str) -> impl Iterator<Item = &'a FacetRequest> + 'a {
        self.facets
            .iter()
            .filter(move |(c, _)| c == core)
            .map(|(_, f)| f)
    }

    pub fn drilldown_queries_for(&self, core: &str) -> &[DrilldownQuery] {
        self.drilldown_queries.get(core).map_or(&[], Vec::as_slice)
    }

    pub fn other_core_facet_filters_for(&self, core: &str) -> &[QueryExpr] {
        self.other_core_facet_filters
            .get(core)
            .map_or(&[], Vec::as_slice)
    }

    pub fn matches(&self) -> &[MatchSpec] {
        &self.matches
    }

    pub fn unites(&self) -> &[UniteSpec] {
        &self.unites
    }

    pub fn sort_keys(&self) -> &[SortKey] {
        &self.sort_keys
    }

    /// Every core the request mentions, the result core included.
    pub fn cores(&self) -> BTreeSet<&str> {
        let mut cores = BTreeSet::from([self.results_from.as_str()]);
        cores.extend(self.queries.keys().map(String::as_str));
        cores.extend(self.filter_queries.keys().map(String::as_str));
        cores.extend(self.rank_queries.keys().map(String::as_str));
        cores.extend(self.facets.iter().map(|(c, _)| c.as_str()));
        cores.extend(self.drilldown_queries.keys().map(String::as_str));
        cores.extend(self.other_core_facet_filters.keys().map(String::as_str));
        for m in &self.matches {
            cores.insert(m.left.core.as_str());
            cores.insert(m.right.core.as_str());
        }
        for u in &self.unites {
            cores.insert(u.left.core.as_str());
            cores.insert(u.right.core.as_str());
        }
        cores.extend(self.sort_keys.iter().filter_map(|k| k.core.as_deref()));
        cores
    }

    /// Key field of `core` in its match with `other`.
    pub fn key_name(&self, core: &str, other: &str) -> Option<&str> {
        self.matches.iter().find_map(|m| {
            if m.left.core == core && m.right.core == other {
                m.left.key_name()
            } else if m.right.core == core && m.left.core == other {
                m.right.key_name()
            } else {
                None
            }
        })
    }

    /// Non-result cores whose documents restrict the result set.
    pub fn filtering_cores(&self) -> Vec<&str> {
        self.cores()
            .into_iter()
            .filter(|core| *core != self.results_from)
            .filter(|core| {
                self.query_for(core).is_some()
                    || !self.filter_queries_for(core).is_empty()
                    || !self.drilldown_queries_for(core).is_empty()
            })
            .collect()
    }

    /// Structural checks that need no index: match and unite shape, facet sort order.
    pub fn validate(&self) -> Result<()> {
        for m in &self.matches {
            for side in [&m.left, &m.right] {
                if side.key_name().is_none() {
                    return Err(ComposeError::InvalidMatchSpecification(format!(
                        "Match side for core '{}' must have a key or uniqueKey specification.",
                        side.core
                    )));
                }
                if side.core == self.results_from && side.unique_key.is_none() {
                    return Err(ComposeError::InvalidMatchSpecification(format!(
                        "Match for result core '{}' must have a uniqueKey specification.",
                        self.results_from
                    )));
                }
            }
            if m.left.core == m.right.core {
                return Err(ComposeError::InvalidMatchSpecification(format!(
                    "Match joins core '{}' with itself.",
                    m.left.core
                )));
            }
        }

        let unmatched: Vec<&str> = self
            .cores()
            .into_iter()
            .filter(|core| *core != self.results_from)
            .filter(|core| self.key_name(self.results_from.as_str(), core).is_none())
            .collect();
        if !unmatched.is_empty() {
            return Err(ComposeError::InvalidMatchSpecification(format!(
                "No match set for cores {unmatched:?} with result core '{}'",
                self.results_from
            )));
        }

        for u in &self.unites {
            self.unite_key_name(u)?;
        }

        for (_, facet) in &self.facets {
            if let Some(sort_by) = &facet.sort_by
                && sort_by != "count"
            {
                return Err(ComposeError::InvalidFacetSort {
                    fieldname: facet.fieldname.clone(),
                    sort_by: sort_by.clone(),
                });
            }
        }
        Ok(())
    }

    /// Result-core key field a unite constrains.
    pub fn unite_key_name(&self, unite: &UniteSpec) -> Result<&str> {
        let results = self.results_from.as_str();
        let other_core = |side: &UniteSide, peer: &UniteSide| -> Option<String> {
            if side.core != results {
                Some(side.core.clone())
            } else if peer.core != results {
                Some(peer.core.clone())
            } else {
                None
            }
        };
        let left = other_core(&unite.left, &unite.right);
        let right = other_core(&unite.right, &unite.left);
        let (Some(left), Some(right)) = (left, right) else {
            return Err(ComposeError::InvalidMatchSpecification(format!(
                "Unite must involve a core other than result core '{results}'"
            )));
        };
        let left_key = self.key_name(results, &left);
        let right_key = self.key_name(results, &right);
        match (left_key, right_key) {
            (Some(l), Some(r)) if l == r => Ok(l),
            _ => Err(ComposeError::InvalidMatchSpecification(format!(
                "Unite of cores '{}' and '{}' does not map onto one key of result core '{results}'",
                unite.left.core, unite.right.core
            ))),
        }
    }

    /// JSON summary for diagnostics.
    pub fn info(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "ComposedQuery",
            "resultsFrom": self.results_from,
            "cores": self.cores(),
            "query": serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
        })
    }
}
