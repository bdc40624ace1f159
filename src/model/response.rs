use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One ranked result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hit {
    pub identifier: String,
    pub score: f32,
    /// Documents collapsed onto this hit, per dedup field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_count: Option<BTreeMap<String, u64>>,
    /// Identifiers grouped under this hit, per grouping field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicates: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetTerm {
    pub term: String,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subterms: Vec<FacetTerm>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetResult {
    pub fieldname: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    pub terms: Vec<FacetTerm>,
}

impl FacetResult {
    /// `(term, count)` pairs of the top level, handy for assertions and logging.
    pub fn counts(&self) -> Vec<(&str, u64)> {
        self.terms.iter().map(|t| (t.term.as_str(), t.count)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposedResponse {
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_with_duplicates: Option<u64>,
    pub hits: Vec<Hit>,
    pub drilldown_data: Vec<FacetResult>,
    /// Milliseconds, never below 1.
    pub query_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<BTreeMap<String, Vec<String>>>,
    /// Exported result-core key values, ascending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<u64>>,
}

impl ComposedResponse {
    pub fn identifiers(&self) -> Vec<&str> {
        self.hits.iter().map(|h| h.identifier.as_str()).collect()
    }

    pub fn facet(&self, fieldname: &str) -> Option<&FacetResult> {
        self.drilldown_data.iter().find(|f| f.fieldname == fieldname)
    }
}

/// A term and the number of documents containing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermCount {
    pub term: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreInfo {
    pub name: String,
    pub num_docs: u64,
    pub fieldnames: Vec<String>,
    pub drilldown_fieldnames: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_serializes_camel_case_and_skips_absent_parts() -> anyhow::Result<()> {
        let response = ComposedResponse {
            total: 1,
            hits: vec![Hit {
                identifier: "A-M".into(),
                score: 1.0,
                duplicate_count: None,
                duplicates: None,
            }],
            drilldown_data: vec![FacetResult {
                fieldname: "cat".into(),
                path: vec![],
                terms: vec![FacetTerm {
                    term: "x".into(),
                    count: 1,
                    subterms: vec![],
                }],
            }],
            query_time: 1,
            ..Default::default()
        };
        let json = serde_json::to_value(&response)?;
        assert_eq!(json["queryTime"], 1);
        assert!(json.get("totalWithDuplicates").is_none());
        assert!(json["hits"][0].get("duplicateCount").is_none());
        assert!(json["drilldownData"][0]["terms"][0].get("subterms").is_none());
        assert_eq!(response.identifiers(), vec!["A-M"]);
        assert_eq!(response.facet("cat").unwrap().counts(), vec![("x", 1)]);
        Ok(())
    }
}
