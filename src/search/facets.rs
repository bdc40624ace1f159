//! Drilldown counting and facet tree assembly.
//!
//! Counts are kept per facet node: a document tagged `fiction>fantasy` counts once for
//! `fiction` and once for `fiction>fantasy`, however many of its values share a node.

use std::collections::BTreeMap;

use fxhash::FxHashMap;
use smallvec::SmallVec;
use tantivy::collector::{Collector, SegmentCollector};
use tantivy::fastfield::FacetReader;
use tantivy::schema::Facet;
use tantivy::{DocId, Score, SegmentOrdinal, SegmentReader};

use crate::model::{FacetRequest, FacetTerm};

/// Deepest level a hierarchical facet tree descends to.
pub const MAX_FACET_DEPTH: usize = 10;

type NodeCounts = BTreeMap<Vec<String>, u64>;

/// Counts facet nodes of the listed drilldown fields.
pub struct DrilldownCollector {
    fields: Vec<String>,
}

impl DrilldownCollector {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }
}

struct FieldCounter {
    reader: FacetReader,
    /// Node ids of every ancestor of each facet ordinal, itself included.
    ord_nodes: Vec<SmallVec<[u32; 4]>>,
    nodes: Vec<Vec<String>>,
    counts: Vec<u64>,
}

impl FieldCounter {
    fn open(segment: &SegmentReader, field: &str) -> tantivy::Result<Self> {
        let facet_reader = segment.facet_reader(field)?;
        let mut node_ids: FxHashMap<Vec<String>, u32> = FxHashMap::default();
        let mut nodes: Vec<Vec<String>> = Vec::new();
        let mut ord_nodes = Vec::with_capacity(facet_reader.num_facets());
        let mut facet = Facet::root();
        for ord in 0..facet_reader.num_facets() as u64 {
            facet_reader.facet_from_ord(ord, &mut facet)?;
            let path: Vec<String> = facet.to_path().into_iter().map(str::to_string).collect();
            let mut ids = SmallVec::new();
            for depth in 1..=path.len() {
                let prefix = path[..depth].to_vec();
                let id = *node_ids.entry(prefix.clone()).or_insert_with(|| {
                    nodes.push(prefix);
                    (nodes.len() - 1) as u32
                });
                ids.push(id);
            }
            ord_nodes.push(ids);
        }
        let counts = vec![0; nodes.len()];
        Ok(Self {
            reader: facet_reader,
            ord_nodes,
            nodes,
            counts,
        })
    }
}

pub struct DrilldownSegmentCollector {
    fields: Vec<FieldCounter>,
    scratch: SmallVec<[u32; 16]>,
}

/// Node counts per requested field, in request order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FacetCounts {
    fields: Vec<(String, NodeCounts)>,
}

impl FacetCounts {
    pub fn for_field(&self, field: &str) -> Option<&NodeCounts> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, counts)| counts)
    }

    /// Terms under `request.path`, count descending then term ascending.
    pub fn terms(&self, request: &FacetRequest, hierarchical: bool) -> Vec<FacetTerm> {
        match self.for_field(&request.fieldname) {
            Some(counts) => children(counts, &request.path, request.max_terms, hierarchical, 0),
            None => Vec::new(),
        }
    }
}

fn children(
    counts: &NodeCounts,
    base: &[String],
    max_terms: usize,
    hierarchical: bool,
    depth: usize,
) -> Vec<FacetTerm> {
    let mut level: Vec<(&Vec<String>, u64)> = counts
        .range(base.to_vec()..)
        .take_while(|(path, _)| path.starts_with(base))
        .filter(|(path, count)| path.len() == base.len() + 1 && **count > 0)
        .map(|(path, count)| (path, *count))
        .collect();
    level.sort_by(|(a, ca), (b, cb)| cb.cmp(ca).then_with(|| a.cmp(b)));
    if max_terms > 0 {
        level.truncate(max_terms);
    }
    level
        .into_iter()
        .map(|(path, count)| {
            let subterms = if hierarchical && depth + 1 < MAX_FACET_DEPTH {
                children(counts, path, max_terms, hierarchical, depth + 1)
            } else {
                Vec::new()
            };
            FacetTerm {
                term: path[base.len()].clone(),
                count,
                subterms,
            }
        })
        .collect()
}

impl Collector for DrilldownCollector {
    type Fruit = FacetCounts;
    type Child = DrilldownSegmentCollector;

    fn for_segment(
        &self,
        _segment_ord: SegmentOrdinal,
        segment: &SegmentReader,
    ) -> tantivy::Result<Self::Child> {
        let fields = self
            .fields
            .iter()
            .map(|field| FieldCounter::open(segment, field))
            .collect::<tantivy::Result<Vec<_>>>()?;
        Ok(DrilldownSegmentCollector {
            fields,
            scratch: SmallVec::new(),
        })
    }

    fn requires_scoring(&self) -> bool {
        false
    }

    fn merge_fruits(&self, fruits: Vec<Vec<NodeCounts>>) -> tantivy::Result<FacetCounts> {
        let mut merged: Vec<NodeCounts> = vec![NodeCounts::new(); self.fields.len()];
        for fruit in fruits {
            for (total, segment) in merged.iter_mut().zip(fruit) {
                for (path, count) in segment {
                    *total.entry(path).or_insert(0) += count;
                }
            }
        }
        Ok(FacetCounts {
            fields: self.fields.iter().cloned().zip(merged).collect(),
        })
    }
}

impl SegmentCollector for DrilldownSegmentCollector {
    type Fruit = Vec<NodeCounts>;

    fn collect(&mut self, doc: DocId, _score: Score) {
        for field in &mut self.fields {
            self.scratch.clear();
            for ord in field.reader.facet_ords(doc) {
                if let Some(ids) = field.ord_nodes.get(ord as usize) {
                    self.scratch.extend_from_slice(ids);
                }
            }
            self.scratch.sort_unstable();
            self.scratch.dedup();
            for id in &self.scratch {
                field.counts[*id as usize] += 1;
            }
        }
    }

    fn harvest(self) -> Vec<NodeCounts> {
        self.fields
            .into_iter()
            .map(|field| {
                field
                    .nodes
                    .into_iter()
                    .zip(field.counts)
                    .filter(|(_, count)| *count > 0)
                    .collect()
            })
            .collect()
    }
}
