//! Collector chain for composed queries.
//!
//! Stages wrap each other outer-to-inner and delegate the documents they accept:
//!
//! - [`FilteredCollector`]: cached filter bitsets of the searched core.
//! - [`KeyFilterCollector`]: join/unite key sets on the result core's key fields.
//! - [`ScoreJoinCollector`]: folds rank-core scores into each document's score.
//! - [`DedupCollector`]: keeps the best document per dedup key, then feeds its inner collector.
//! - [`TopHitsCollector`]: ranked candidates with sort values and optional grouping.
//!
//! Leaf collectors that build join inputs: [`BitsCollector`], [`KeyCollector`],
//! [`ScoreCollector`] and [`SortValueCollector`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use fxhash::{FxHashMap, FxHashSet};
use tantivy::collector::{Collector, SegmentCollector};
use tantivy::columnar::{Column, StrColumn};
use tantivy::{DocAddress, DocId, Score, SegmentOrdinal, SegmentReader};

use crate::search::fields::{SortFieldType, SortValue};
use crate::search::keys::{KeySet, ScoreCombiner, ScoreMap};

fn u64_column(segment: &SegmentReader, field: &str) -> tantivy::Result<Option<Column<u64>>> {
    segment.fast_fields().column_opt::<u64>(field)
}

fn first_key(column: &Option<Column<u64>>, doc: DocId) -> Option<u64> {
    column.as_ref().and_then(|c| c.first(doc))
}

/// Reads one sortable fast field of a segment.
enum FieldReader {
    Long(Option<Column<i64>>),
    Key(Option<Column<u64>>),
    Str(Option<StrColumn>),
}

impl FieldReader {
    fn open(segment: &SegmentReader, field: &str, kind: SortFieldType) -> tantivy::Result<Self> {
        let fast = segment.fast_fields();
        Ok(match kind {
            SortFieldType::Long => Self::Long(fast.column_opt::<i64>(field)?),
            SortFieldType::Key => Self::Key(fast.column_opt::<u64>(field)?),
            SortFieldType::String => Self::Str(fast.str(field)?),
        })
    }

    fn value(&self, doc: DocId) -> Option<SortValue> {
        match self {
            Self::Long(col) => col.as_ref()?.first(doc).map(SortValue::Int),
            Self::Key(col) => col
                .as_ref()?
                .first(doc)
                .map(|k| SortValue::Int(i64::try_from(k).unwrap_or(i64::MAX))),
            Self::Str(col) => {
                let col = col.as_ref()?;
                let ord = col.ords().first(doc)?;
                let mut text = String::new();
                match col.ord_to_str(ord, &mut text) {
                    Ok(true) => Some(SortValue::Str(text)),
                    _ => None,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Filter bitsets
// ---------------------------------------------------------------------------

/// Matching documents of one segment.
#[derive(Debug, Clone, Default)]
pub struct DocBits {
    words: Vec<u64>,
}

impl DocBits {
    fn with_max_doc(max_doc: DocId) -> Self {
        Self {
            words: vec![0; (max_doc as usize).div_ceil(64)],
        }
    }

    fn insert(&mut self, doc: DocId) {
        if let Some(word) = self.words.get_mut(doc as usize / 64) {
            *word |= 1u64 << (doc % 64);
        }
    }

    pub fn contains(&self, doc: DocId) -> bool {
        self.words
            .get(doc as usize / 64)
            .is_some_and(|w| w & (1u64 << (doc % 64)) != 0)
    }

    pub fn len(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Documents matching a filter query, per segment ordinal of one searcher generation.
#[derive(Debug, Default)]
pub struct FilterBits {
    segments: Vec<Arc<DocBits>>,
}

impl FilterBits {
    pub fn segment(&self, segment_ord: SegmentOrdinal) -> Arc<DocBits> {
        self.segments
            .get(segment_ord as usize)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> u64 {
        self.segments.iter().map(|bits| bits.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds [`FilterBits`] from a query.
pub struct BitsCollector;

pub struct BitsSegmentCollector {
    segment_ord: SegmentOrdinal,
    bits: DocBits,
}

impl Collector for BitsCollector {
    type Fruit = FilterBits;
    type Child = BitsSegmentCollector;

    fn for_segment(
        &self,
        segment_ord: SegmentOrdinal,
        segment: &SegmentReader,
    ) -> tantivy::Result<Self::Child> {
        Ok(BitsSegmentCollector {
            segment_ord,
            bits: DocBits::with_max_doc(segment.max_doc()),
        })
    }

    fn requires_scoring(&self) -> bool {
        false
    }

    fn merge_fruits(
        &self,
        mut fruits: Vec<(SegmentOrdinal, DocBits)>,
    ) -> tantivy::Result<FilterBits> {
        fruits.sort_by_key(|(ord, _)| *ord);
        Ok(FilterBits {
            segments: fruits.into_iter().map(|(_, bits)| Arc::new(bits)).collect(),
        })
    }
}

impl SegmentCollector for BitsSegmentCollector {
    type Fruit = (SegmentOrdinal, DocBits);

    fn collect(&mut self, doc: DocId, _score: Score) {
        self.bits.insert(doc);
    }

    fn harvest(self) -> Self::Fruit {
        (self.segment_ord, self.bits)
    }
}

/// Passes only documents present in every filter.
pub struct FilteredCollector<C> {
    filters: Vec<Arc<FilterBits>>,
    inner: C,
}

impl<C> FilteredCollector<C> {
    pub fn new(filters: Vec<Arc<FilterBits>>, inner: C) -> Self {
        Self { filters, inner }
    }
}

pub struct FilteredSegmentCollector<S> {
    filters: Vec<Arc<DocBits>>,
    inner: S,
}

impl<C: Collector> Collector for FilteredCollector<C> {
    type Fruit = C::Fruit;
    type Child = FilteredSegmentCollector<C::Child>;

    fn for_segment(
        &self,
        segment_ord: SegmentOrdinal,
        segment: &SegmentReader,
    ) -> tantivy::Result<Self::Child> {
        Ok(FilteredSegmentCollector {
            filters: self.filters.iter().map(|f| f.segment(segment_ord)).collect(),
            inner: self.inner.for_segment(segment_ord, segment)?,
        })
    }

    fn requires_scoring(&self) -> bool {
        self.inner.requires_scoring()
    }

    fn merge_fruits(
        &self,
        fruits: Vec<<C::Child as SegmentCollector>::Fruit>,
    ) -> tantivy::Result<C::Fruit> {
        self.inner.merge_fruits(fruits)
    }
}

impl<S: SegmentCollector> SegmentCollector for FilteredSegmentCollector<S> {
    type Fruit = S::Fruit;

    fn collect(&mut self, doc: DocId, score: Score) {
        if self.filters.iter().all(|bits| bits.contains(doc)) {
            self.inner.collect(doc, score);
        }
    }

    fn harvest(self) -> S::Fruit {
        self.inner.harvest()
    }
}

// ---------------------------------------------------------------------------
// Join keys
// ---------------------------------------------------------------------------

/// Documents pass when their `field` value is in `keys`.
#[derive(Debug, Clone)]
pub struct KeyConstraint {
    pub field: String,
    pub keys: Arc<KeySet>,
}

pub struct KeyFilterCollector<C> {
    constraints: Vec<KeyConstraint>,
    inner: C,
}

impl<C> KeyFilterCollector<C> {
    pub fn new(constraints: Vec<KeyConstraint>, inner: C) -> Self {
        Self { constraints, inner }
    }
}

pub struct KeyFilterSegmentCollector<S> {
    constraints: Vec<(Option<Column<u64>>, Arc<KeySet>)>,
    inner: S,
}

impl<C: Collector> Collector for KeyFilterCollector<C> {
    type Fruit = C::Fruit;
    type Child = KeyFilterSegmentCollector<C::Child>;

    fn for_segment(
        &self,
        segment_ord: SegmentOrdinal,
        segment: &SegmentReader,
    ) -> tantivy::Result<Self::Child> {
        let constraints = self
            .constraints
            .iter()
            .map(|c| Ok((u64_column(segment, &c.field)?, c.keys.clone())))
            .collect::<tantivy::Result<Vec<_>>>()?;
        Ok(KeyFilterSegmentCollector {
            constraints,
            inner: self.inner.for_segment(segment_ord, segment)?,
        })
    }

    fn requires_scoring(&self) -> bool {
        self.inner.requires_scoring()
    }

    fn merge_fruits(
        &self,
        fruits: Vec<<C::Child as SegmentCollector>::Fruit>,
    ) -> tantivy::Result<C::Fruit> {
        self.inner.merge_fruits(fruits)
    }
}

impl<S: SegmentCollector> SegmentCollector for KeyFilterSegmentCollector<S> {
    type Fruit = S::Fruit;

    fn collect(&mut self, doc: DocId, score: Score) {
        let reachable = self
            .constraints
            .iter()
            .all(|(column, keys)| first_key(column, doc).is_some_and(|k| keys.contains(k)));
        if reachable {
            self.inner.collect(doc, score);
        }
    }

    fn harvest(self) -> S::Fruit {
        self.inner.harvest()
    }
}

/// Collects the values of a key field into a [`KeySet`].
pub struct KeyCollector {
    field: String,
    max_key: u64,
}

impl KeyCollector {
    pub fn new(field: impl Into<String>, max_key: u64) -> Self {
        Self {
            field: field.into(),
            max_key,
        }
    }
}

pub struct KeySegmentCollector {
    column: Option<Column<u64>>,
    keys: KeySet,
}

impl Collector for KeyCollector {
    type Fruit = KeySet;
    type Child = KeySegmentCollector;

    fn for_segment(
        &self,
        _segment_ord: SegmentOrdinal,
        segment: &SegmentReader,
    ) -> tantivy::Result<Self::Child> {
        Ok(KeySegmentCollector {
            column: u64_column(segment, &self.field)?,
            keys: KeySet::new(self.max_key),
        })
    }

    fn requires_scoring(&self) -> bool {
        false
    }

    fn merge_fruits(&self, fruits: Vec<KeySet>) -> tantivy::Result<KeySet> {
        let mut keys = KeySet::new(self.max_key);
        for fruit in &fruits {
            keys.union_with(fruit);
        }
        Ok(keys)
    }
}

impl SegmentCollector for KeySegmentCollector {
    type Fruit = KeySet;

    fn collect(&mut self, doc: DocId, _score: Score) {
        if let Some(column) = &self.column {
            for key in column.values_for_doc(doc) {
                self.keys.insert(key);
            }
        }
    }

    fn harvest(self) -> KeySet {
        self.keys
    }
}

/// Maps key values of matching documents to their best score.
pub struct ScoreCollector {
    field: String,
}

impl ScoreCollector {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

pub struct ScoreSegmentCollector {
    column: Option<Column<u64>>,
    scores: ScoreMap,
}

impl Collector for ScoreCollector {
    type Fruit = ScoreMap;
    type Child = ScoreSegmentCollector;

    fn for_segment(
        &self,
        _segment_ord: SegmentOrdinal,
        segment: &SegmentReader,
    ) -> tantivy::Result<Self::Child> {
        Ok(ScoreSegmentCollector {
            column: u64_column(segment, &self.field)?,
            scores: ScoreMap::default(),
        })
    }

    fn requires_scoring(&self) -> bool {
        true
    }

    fn merge_fruits(&self, fruits: Vec<ScoreMap>) -> tantivy::Result<ScoreMap> {
        let mut scores = ScoreMap::default();
        for fruit in fruits {
            scores.merge(fruit);
        }
        Ok(scores)
    }
}

impl SegmentCollector for ScoreSegmentCollector {
    type Fruit = ScoreMap;

    fn collect(&mut self, doc: DocId, score: Score) {
        if let Some(column) = &self.column {
            for key in column.values_for_doc(doc) {
                self.scores.record(key, score);
            }
        }
    }

    fn harvest(self) -> ScoreMap {
        self.scores
    }
}

/// Rank scores reachable through a result-core key field.
#[derive(Debug, Clone)]
pub struct ScoreSource {
    pub field: String,
    pub scores: Arc<ScoreMap>,
}

pub struct ScoreJoinCollector<C> {
    sources: Vec<ScoreSource>,
    combiner: Arc<dyn ScoreCombiner>,
    inner: C,
}

impl<C> ScoreJoinCollector<C> {
    pub fn new(sources: Vec<ScoreSource>, combiner: Arc<dyn ScoreCombiner>, inner: C) -> Self {
        Self {
            sources,
            combiner,
            inner,
        }
    }
}

pub struct ScoreJoinSegmentCollector<S> {
    sources: Vec<(Option<Column<u64>>, Arc<ScoreMap>)>,
    combiner: Arc<dyn ScoreCombiner>,
    inner: S,
}

impl<C: Collector> Collector for ScoreJoinCollector<C> {
    type Fruit = C::Fruit;
    type Child = ScoreJoinSegmentCollector<C::Child>;

    fn for_segment(
        &self,
        segment_ord: SegmentOrdinal,
        segment: &SegmentReader,
    ) -> tantivy::Result<Self::Child> {
        let sources = self
            .sources
            .iter()
            .map(|s| Ok((u64_column(segment, &s.field)?, s.scores.clone())))
            .collect::<tantivy::Result<Vec<_>>>()?;
        Ok(ScoreJoinSegmentCollector {
            sources,
            combiner: self.combiner.clone(),
            inner: self.inner.for_segment(segment_ord, segment)?,
        })
    }

    fn requires_scoring(&self) -> bool {
        !self.sources.is_empty() || self.inner.requires_scoring()
    }

    fn merge_fruits(
        &self,
        fruits: Vec<<C::Child as SegmentCollector>::Fruit>,
    ) -> tantivy::Result<C::Fruit> {
        self.inner.merge_fruits(fruits)
    }
}

impl<S: SegmentCollector> SegmentCollector for ScoreJoinSegmentCollector<S> {
    type Fruit = S::Fruit;

    fn collect(&mut self, doc: DocId, score: Score) {
        let mut combined = score;
        for (column, scores) in &self.sources {
            if let Some(rank) = first_key(column, doc).and_then(|k| scores.get(k)) {
                combined = self.combiner.combine(combined, rank);
            }
        }
        self.inner.collect(doc, combined);
    }

    fn harvest(self) -> S::Fruit {
        self.inner.harvest()
    }
}

/// Runs a list of collectors of one type side by side.
pub struct Each<C>(pub Vec<C>);

pub struct EachSegmentCollector<S>(Vec<S>);

impl<C: Collector> Collector for Each<C> {
    type Fruit = Vec<C::Fruit>;
    type Child = EachSegmentCollector<C::Child>;

    fn for_segment(
        &self,
        segment_ord: SegmentOrdinal,
        segment: &SegmentReader,
    ) -> tantivy::Result<Self::Child> {
        let children = self
            .0
            .iter()
            .map(|c| c.for_segment(segment_ord, segment))
            .collect::<tantivy::Result<Vec<_>>>()?;
        Ok(EachSegmentCollector(children))
    }

    fn requires_scoring(&self) -> bool {
        self.0.iter().any(Collector::requires_scoring)
    }

    fn merge_fruits(
        &self,
        fruits: Vec<Vec<<C::Child as SegmentCollector>::Fruit>>,
    ) -> tantivy::Result<Vec<C::Fruit>> {
        let mut per_collector: Vec<Vec<_>> = self.0.iter().map(|_| Vec::new()).collect();
        for segment in fruits {
            for (slot, fruit) in per_collector.iter_mut().zip(segment) {
                slot.push(fruit);
            }
        }
        self.0
            .iter()
            .zip(per_collector)
            .map(|(c, fruits)| c.merge_fruits(fruits))
            .collect()
    }
}

impl<S: SegmentCollector> SegmentCollector for EachSegmentCollector<S> {
    type Fruit = Vec<S::Fruit>;

    fn collect(&mut self, doc: DocId, score: Score) {
        for child in &mut self.0 {
            child.collect(doc, score);
        }
    }

    fn harvest(self) -> Vec<S::Fruit> {
        self.0.into_iter().map(SegmentCollector::harvest).collect()
    }
}

/// Join-sort table: key to sort value, last document per key wins.
pub type SortValues = FxHashMap<u64, SortValue>;

pub struct SortValueCollector {
    key_field: String,
    sort_field: String,
    kind: SortFieldType,
}

impl SortValueCollector {
    pub fn new(key_field: impl Into<String>, sort_field: impl Into<String>, kind: SortFieldType) -> Self {
        Self {
            key_field: key_field.into(),
            sort_field: sort_field.into(),
            kind,
        }
    }
}

pub struct SortValueSegmentCollector {
    keys: Option<Column<u64>>,
    reader: FieldReader,
    values: SortValues,
}

impl Collector for SortValueCollector {
    type Fruit = SortValues;
    type Child = SortValueSegmentCollector;

    fn for_segment(
        &self,
        _segment_ord: SegmentOrdinal,
        segment: &SegmentReader,
    ) -> tantivy::Result<Self::Child> {
        Ok(SortValueSegmentCollector {
            keys: u64_column(segment, &self.key_field)?,
            reader: FieldReader::open(segment, &self.sort_field, self.kind)?,
            values: SortValues::default(),
        })
    }

    fn requires_scoring(&self) -> bool {
        false
    }

    fn merge_fruits(&self, fruits: Vec<SortValues>) -> tantivy::Result<SortValues> {
        let mut values = SortValues::default();
        for fruit in fruits {
            values.extend(fruit);
        }
        Ok(values)
    }
}

impl SegmentCollector for SortValueSegmentCollector {
    type Fruit = SortValues;

    fn collect(&mut self, doc: DocId, _score: Score) {
        if let Some(key) = first_key(&self.keys, doc)
            && let Some(value) = self.reader.value(doc)
        {
            self.values.insert(key, value);
        }
    }

    fn harvest(self) -> SortValues {
        self.values
    }
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

/// One sort criterion, resolved against registries and join tables.
#[derive(Debug, Clone)]
pub enum SortSpec {
    Score {
        descending: bool,
    },
    Field {
        field: String,
        kind: SortFieldType,
        descending: bool,
        missing: SortValue,
    },
    /// Value looked up in another core through the result core's `key_field`.
    Joined {
        key_field: String,
        values: Arc<SortValues>,
        descending: bool,
        missing: SortValue,
    },
}

enum SortSource {
    Score,
    Field(FieldReader, SortValue),
    Joined(Option<Column<u64>>, Arc<SortValues>, SortValue),
}

impl SortSource {
    fn open(segment: &SegmentReader, spec: &SortSpec) -> tantivy::Result<Self> {
        Ok(match spec {
            SortSpec::Score { .. } => Self::Score,
            SortSpec::Field {
                field,
                kind,
                missing,
                ..
            } => Self::Field(FieldReader::open(segment, field, *kind)?, missing.clone()),
            SortSpec::Joined {
                key_field,
                values,
                missing,
                ..
            } => Self::Joined(u64_column(segment, key_field)?, values.clone(), missing.clone()),
        })
    }

    fn value(&self, doc: DocId) -> SortValue {
        match self {
            Self::Score => SortValue::Min,
            Self::Field(reader, missing) => reader.value(doc).unwrap_or_else(|| missing.clone()),
            Self::Joined(keys, values, missing) => first_key(keys, doc)
                .and_then(|k| values.get(&k).cloned())
                .unwrap_or_else(|| missing.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub address: DocAddress,
    pub score: Score,
    pub sort_values: Vec<SortValue>,
    pub group: Option<u64>,
}

/// Ranking order: sort specs in turn (score descending when there are none), then index order.
pub fn compare(sort: &[SortSpec], a: &Candidate, b: &Candidate) -> Ordering {
    let directed = |ord: Ordering, descending: bool| if descending { ord.reverse() } else { ord };
    if sort.is_empty() {
        let ord = b.score.total_cmp(&a.score);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    for (i, spec) in sort.iter().enumerate() {
        let ord = match spec {
            SortSpec::Score { descending } => directed(a.score.total_cmp(&b.score), *descending),
            SortSpec::Field { descending, .. } | SortSpec::Joined { descending, .. } => {
                directed(a.sort_values[i].cmp(&b.sort_values[i]), *descending)
            }
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    (a.address.segment_ord, a.address.doc_id).cmp(&(b.address.segment_ord, b.address.doc_id))
}

/// Candidate ordered by rank, so a max-heap keeps the worst retained candidate on top.
struct Ranked {
    candidate: Candidate,
    sort: Arc<Vec<SortSpec>>,
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(&self.sort, &self.candidate, &other.candidate)
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

/// Lets an outer stage withdraw documents from an already harvested segment result.
pub trait RemoveDocs {
    fn remove_docs(&mut self, docs: &FxHashSet<DocId>);
}

pub struct TopHitsCollector {
    limit: usize,
    sort: Arc<Vec<SortSpec>>,
    group_field: Option<String>,
    keep_all: bool,
}

impl TopHitsCollector {
    pub fn new(limit: usize, sort: Vec<SortSpec>) -> Self {
        Self {
            limit,
            sort: Arc::new(sort),
            group_field: None,
            keep_all: false,
        }
    }

    /// Collapse hits sharing a non-zero value of `field` once the total exceeds the limit.
    pub fn grouped_by(mut self, field: Option<String>) -> Self {
        self.keep_all |= field.is_some();
        self.group_field = field;
        self
    }

    /// Keep every candidate per segment, for outer stages that withdraw documents later.
    pub fn keeping_all(mut self, keep_all: bool) -> Self {
        self.keep_all |= keep_all;
        self
    }
}

pub struct TopHitsSegmentCollector {
    segment_ord: SegmentOrdinal,
    limit: usize,
    keep_all: bool,
    sort: Arc<Vec<SortSpec>>,
    sources: Vec<SortSource>,
    group: Option<Column<u64>>,
    /// The best `limit` candidates when not keeping all of them.
    best: BinaryHeap<Ranked>,
    hits: SegmentHits,
}

pub struct SegmentHits {
    total: u64,
    candidates: Vec<Candidate>,
}

impl RemoveDocs for SegmentHits {
    fn remove_docs(&mut self, docs: &FxHashSet<DocId>) {
        self.candidates
            .retain(|c| !docs.contains(&c.address.doc_id));
        self.total = self.total.saturating_sub(docs.len() as u64);
    }
}

#[derive(Debug, Clone)]
pub struct RankedHit {
    pub candidate: Candidate,
    /// Present when grouping: the group's members in rank order, this hit first.
    pub group_members: Option<Vec<DocAddress>>,
}

#[derive(Debug, Clone, Default)]
pub struct TopHits {
    pub total: u64,
    pub hits: Vec<RankedHit>,
}

impl Collector for TopHitsCollector {
    type Fruit = TopHits;
    type Child = TopHitsSegmentCollector;

    fn for_segment(
        &self,
        segment_ord: SegmentOrdinal,
        segment: &SegmentReader,
    ) -> tantivy::Result<Self::Child> {
        let sources = self
            .sort
            .iter()
            .map(|spec| SortSource::open(segment, spec))
            .collect::<tantivy::Result<Vec<_>>>()?;
        let group = match &self.group_field {
            Some(field) => u64_column(segment, field)?,
            None => None,
        };
        Ok(TopHitsSegmentCollector {
            segment_ord,
            limit: self.limit,
            keep_all: self.keep_all,
            sort: self.sort.clone(),
            sources,
            group,
            best: BinaryHeap::new(),
            hits: SegmentHits {
                total: 0,
                candidates: Vec::new(),
            },
        })
    }

    fn requires_scoring(&self) -> bool {
        true
    }

    fn merge_fruits(&self, fruits: Vec<SegmentHits>) -> tantivy::Result<TopHits> {
        let total: u64 = fruits.iter().map(|f| f.total).sum();
        let mut candidates: Vec<Candidate> =
            fruits.into_iter().flat_map(|f| f.candidates).collect();
        candidates.sort_by(|a, b| compare(&self.sort, a, b));

        let hits = if self.group_field.is_some() {
            group_candidates(candidates, self.limit, total > self.limit as u64)
        } else {
            candidates
                .into_iter()
                .take(self.limit)
                .map(|candidate| RankedHit {
                    candidate,
                    group_members: None,
                })
                .collect()
        };
        Ok(TopHits { total, hits })
    }
}

fn group_candidates(candidates: Vec<Candidate>, limit: usize, collapse: bool) -> Vec<RankedHit> {
    let mut hits: Vec<RankedHit> = Vec::new();
    let mut by_group: FxHashMap<u64, usize> = FxHashMap::default();
    for candidate in candidates {
        let group = candidate.group.filter(|g| collapse && *g != 0);
        if let Some(g) = group
            && let Some(&idx) = by_group.get(&g)
        {
            if let Some(members) = hits[idx].group_members.as_mut() {
                members.push(candidate.address);
            }
            continue;
        }
        if hits.len() >= limit {
            continue;
        }
        if let Some(g) = group {
            by_group.insert(g, hits.len());
        }
        hits.push(RankedHit {
            group_members: Some(vec![candidate.address]),
            candidate,
        });
    }
    hits
}

impl SegmentCollector for TopHitsSegmentCollector {
    type Fruit = SegmentHits;

    fn collect(&mut self, doc: DocId, score: Score) {
        self.hits.total += 1;
        if self.limit == 0 {
            return;
        }
        let candidate = Candidate {
            address: DocAddress::new(self.segment_ord, doc),
            score,
            sort_values: self.sources.iter().map(|s| s.value(doc)).collect(),
            group: first_key(&self.group, doc),
        };
        if self.keep_all {
            self.hits.candidates.push(candidate);
            return;
        }
        if self.best.len() >= self.limit
            && let Some(worst) = self.best.peek()
            && compare(&self.sort, &candidate, &worst.candidate) != Ordering::Less
        {
            return;
        }
        self.best.push(Ranked {
            candidate,
            sort: self.sort.clone(),
        });
        if self.best.len() > self.limit {
            self.best.pop();
        }
    }

    fn harvest(mut self) -> SegmentHits {
        if !self.keep_all {
            self.hits.candidates = self
                .best
                .into_sorted_vec()
                .into_iter()
                .map(|ranked| ranked.candidate)
                .collect();
        }
        self.hits
    }
}

// ---------------------------------------------------------------------------
// Dedup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct DedupEntry {
    doc: DocId,
    score: Score,
    rank: SortValue,
    count: u64,
}

impl DedupEntry {
    /// Whether this entry, met later in index order, replaces `other`: higher dedup sort
    /// value, then higher score. A full tie goes to this later document.
    fn beats(&self, other: &DedupEntry) -> bool {
        match self.rank.cmp(&other.rank) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.score >= other.score,
        }
    }
}

/// Keeps one representative per non-zero dedup key; unkeyed documents pass unchanged.
pub struct DedupCollector<C> {
    key_field: Option<String>,
    sort_field: Option<(String, SortFieldType)>,
    inner: C,
}

impl<C> DedupCollector<C> {
    pub fn new(key_field: Option<String>, sort_field: Option<(String, SortFieldType)>, inner: C) -> Self {
        Self {
            key_field,
            sort_field,
            inner,
        }
    }
}

pub struct DedupSegmentCollector<S> {
    segment_ord: SegmentOrdinal,
    keys: Option<Column<u64>>,
    sort: Option<FieldReader>,
    best: FxHashMap<u64, DedupEntry>,
    seen: u64,
    inner: S,
}

pub struct DedupSegmentFruit<F> {
    segment_ord: SegmentOrdinal,
    winners: Vec<(u64, DedupEntry)>,
    seen: u64,
    inner: F,
}

/// Inner result plus duplicate accounting.
#[derive(Debug)]
pub struct Deduped<F> {
    pub inner: F,
    /// Whether a dedup field was configured.
    pub enabled: bool,
    pub total_with_duplicates: u64,
    /// Group sizes of representatives; absent documents were unkeyed (count 1).
    pub counts: FxHashMap<DocAddress, u64>,
}

impl<F> Deduped<F> {
    pub fn duplicate_count(&self, address: DocAddress) -> u64 {
        self.counts.get(&address).copied().unwrap_or(1)
    }
}

impl<C> Collector for DedupCollector<C>
where
    C: Collector,
    <C::Child as SegmentCollector>::Fruit: RemoveDocs,
{
    type Fruit = Deduped<C::Fruit>;
    type Child = DedupSegmentCollector<C::Child>;

    fn for_segment(
        &self,
        segment_ord: SegmentOrdinal,
        segment: &SegmentReader,
    ) -> tantivy::Result<Self::Child> {
        let keys = match &self.key_field {
            Some(field) => u64_column(segment, field)?,
            None => None,
        };
        let sort = match &self.sort_field {
            Some((field, kind)) => Some(FieldReader::open(segment, field, *kind)?),
            None => None,
        };
        Ok(DedupSegmentCollector {
            segment_ord,
            keys,
            sort,
            best: FxHashMap::default(),
            seen: 0,
            inner: self.inner.for_segment(segment_ord, segment)?,
        })
    }

    fn requires_scoring(&self) -> bool {
        self.inner.requires_scoring()
    }

    fn merge_fruits(
        &self,
        fruits: Vec<DedupSegmentFruit<<C::Child as SegmentCollector>::Fruit>>,
    ) -> tantivy::Result<Self::Fruit> {
        let total_with_duplicates = fruits.iter().map(|f| f.seen).sum();

        let mut global: FxHashMap<u64, (SegmentOrdinal, DedupEntry)> = FxHashMap::default();
        for fruit in &fruits {
            for (key, entry) in &fruit.winners {
                match global.get_mut(key) {
                    Some((ord, current)) => {
                        let count = current.count + entry.count;
                        if entry.beats(current) {
                            *ord = fruit.segment_ord;
                            *current = entry.clone();
                        }
                        current.count = count;
                    }
                    None => {
                        global.insert(*key, (fruit.segment_ord, entry.clone()));
                    }
                }
            }
        }

        let mut inner_fruits = Vec::with_capacity(fruits.len());
        for fruit in fruits {
            let losers: FxHashSet<DocId> = fruit
                .winners
                .iter()
                .filter(|(key, entry)| {
                    global
                        .get(key)
                        .is_some_and(|(ord, best)| *ord != fruit.segment_ord || best.doc != entry.doc)
                })
                .map(|(_, entry)| entry.doc)
                .collect();
            let mut inner = fruit.inner;
            if !losers.is_empty() {
                inner.remove_docs(&losers);
            }
            inner_fruits.push(inner);
        }

        let counts = global
            .into_values()
            .map(|(ord, entry)| (DocAddress::new(ord, entry.doc), entry.count))
            .collect();

        Ok(Deduped {
            inner: self.inner.merge_fruits(inner_fruits)?,
            enabled: self.key_field.is_some(),
            total_with_duplicates,
            counts,
        })
    }
}

impl<S> SegmentCollector for DedupSegmentCollector<S>
where
    S: SegmentCollector,
    S::Fruit: RemoveDocs,
{
    type Fruit = DedupSegmentFruit<S::Fruit>;

    fn collect(&mut self, doc: DocId, score: Score) {
        self.seen += 1;
        let Some(key) = first_key(&self.keys, doc).filter(|k| *k != 0) else {
            self.inner.collect(doc, score);
            return;
        };
        let rank = self
            .sort
            .as_ref()
            .and_then(|reader| reader.value(doc))
            .unwrap_or(SortValue::Min);
        let entry = DedupEntry {
            doc,
            score,
            rank,
            count: 1,
        };
        match self.best.get_mut(&key) {
            Some(current) => {
                let count = current.count + 1;
                if entry.beats(current) {
                    *current = entry;
                }
                current.count = count;
            }
            None => {
                self.best.insert(key, entry);
            }
        }
    }

    fn harvest(mut self) -> Self::Fruit {
        let mut winners: Vec<(u64, DedupEntry)> = self.best.into_iter().collect();
        winners.sort_by_key(|(_, entry)| entry.doc);
        for (_, entry) in &winners {
            self.inner.collect(entry.doc, entry.score);
        }
        DedupSegmentFruit {
            segment_ord: self.segment_ord,
            winners,
            seen: self.seen,
            inner: self.inner.harvest(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(seg: u32, doc: u32, score: f32, values: Vec<SortValue>, group: Option<u64>) -> Candidate {
        Candidate {
            address: DocAddress::new(seg, doc),
            score,
            sort_values: values,
            group,
        }
    }

    #[test]
    fn default_order_is_score_then_index_order() {
        let a = candidate(0, 5, 1.0, vec![], None);
        let b = candidate(0, 2, 1.0, vec![], None);
        let c = candidate(1, 0, 3.0, vec![], None);
        let mut all = vec![a, b, c];
        all.sort_by(|x, y| compare(&[], x, y));
        let order: Vec<_> = all.iter().map(|c| (c.address.segment_ord, c.address.doc_id)).collect();
        assert_eq!(order, vec![(1, 0), (0, 2), (0, 5)]);
    }

    #[test]
    fn missing_values_follow_their_sentinels() {
        let spec = vec![SortSpec::Field {
            field: "S".into(),
            kind: SortFieldType::String,
            descending: false,
            missing: SortValue::Max,
        }];
        let with = candidate(0, 1, 1.0, vec![SortValue::Str("b".into())], None);
        let without = candidate(0, 0, 1.0, vec![SortValue::Max], None);
        assert_eq!(compare(&spec, &with, &without), Ordering::Less);

        let desc = vec![SortSpec::Field {
            field: "S".into(),
            kind: SortFieldType::String,
            descending: true,
            missing: SortValue::Min,
        }];
        let without = candidate(0, 0, 1.0, vec![SortValue::Min], None);
        assert_eq!(compare(&desc, &with, &without), Ordering::Less);
    }

    #[test]
    fn grouping_collapses_only_when_collapsing() {
        let candidates = vec![
            candidate(0, 0, 3.0, vec![], Some(42)),
            candidate(0, 1, 2.0, vec![], Some(42)),
            candidate(0, 2, 1.5, vec![], None),
            candidate(0, 3, 1.0, vec![], Some(0)),
        ];
        let collapsed = group_candidates(candidates.clone(), 3, true);
        assert_eq!(collapsed.len(), 3);
        assert_eq!(collapsed[0].group_members.as_ref().map(Vec::len), Some(2));
        assert_eq!(collapsed[1].group_members.as_ref().map(Vec::len), Some(1));

        let flat = group_candidates(candidates, 10, false);
        assert_eq!(flat.len(), 4);
        assert!(flat.iter().all(|h| h.group_members.as_ref().map(Vec::len) == Some(1)));
    }

    #[test]
    fn dedup_entries_prefer_sort_value_then_score() {
        let low = DedupEntry { doc: 0, score: 9.0, rank: SortValue::Int(1), count: 1 };
        let high = DedupEntry { doc: 1, score: 1.0, rank: SortValue::Int(2), count: 1 };
        assert!(high.beats(&low));
        assert!(!low.beats(&high));
        let tie = DedupEntry { doc: 2, score: 1.0, rank: SortValue::Int(2), count: 1 };
        assert!(tie.beats(&high));
        let weaker = DedupEntry { doc: 3, score: 0.5, rank: SortValue::Int(2), count: 1 };
        assert!(!weaker.beats(&tie));
    }

    #[test]
    fn top_hits_keep_only_the_page_per_segment() {
        let mut collector = TopHitsSegmentCollector {
            segment_ord: 0,
            limit: 3,
            keep_all: false,
            sort: Arc::new(Vec::new()),
            sources: Vec::new(),
            group: None,
            best: BinaryHeap::new(),
            hits: SegmentHits {
                total: 0,
                candidates: Vec::new(),
            },
        };
        for doc in 0..10_000u32 {
            collector.collect(doc, (doc % 97) as f32);
            assert!(collector.best.len() <= 3);
        }
        let hits = collector.harvest();
        assert_eq!(hits.total, 10_000);
        let docs: Vec<_> = hits.candidates.iter().map(|c| c.address.doc_id).collect();
        assert_eq!(docs, vec![96, 193, 290]);
    }

    #[test]
    fn removing_docs_adjusts_totals() {
        let mut hits = SegmentHits {
            total: 3,
            candidates: vec![
                candidate(0, 0, 1.0, vec![], None),
                candidate(0, 1, 1.0, vec![], None),
                candidate(0, 2, 1.0, vec![], None),
            ],
        };
        let gone: FxHashSet<DocId> = [1].into_iter().collect();
        hits.remove_docs(&gone);
        assert_eq!(hits.total, 2);
        assert_eq!(hits.candidates.len(), 2);
    }
}
