//! Multi-core composed-query execution.
//!
//! A request runs as a fixed pipeline against one snapshot per core:
//!
//! 1. validate cores, match/unite shape and fields, then compose every expression;
//! 2. collect join keys of filtering cores and unite sides, intersected per result key field;
//! 3. collect rank scores of auxiliary cores (cached per core);
//! 4. search the result core through the collector chain;
//! 5. count facets of other cores over the documents reachable from the result set.
//!
//! Filter bitsets and rank score maps are cached per core and dropped on every mutation
//! of that core.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tantivy::query::{AllQuery, BooleanQuery, ConstScoreQuery, Occur, Query, TermQuery};
use tantivy::schema::{Facet, IndexRecordOption, Term};

use crate::config::{EngineConfig, Settings};
use crate::error::{ComposeError, Result};
use crate::model::composed::UniteSide;
use crate::model::{
    ComposedQuery, ComposedResponse, CoreInfo, FacetResult, Hit, QueryExpr, TermCount,
};
use crate::search::cache::{CacheStats, CollectorCache};
use crate::search::collectors::{
    BitsCollector, DedupCollector, Each, FilterBits, KeyCollector, KeyConstraint,
    KeyFilterCollector, ScoreCollector, ScoreJoinCollector, ScoreSource, SortSpec,
    SortValueCollector, TopHitsCollector,
};
use crate::search::facets::{DrilldownCollector, FacetCounts};
use crate::search::fields::{CoreDocument, FieldRegistry, SortValue, schema_field};
use crate::search::keys::{AdditiveCombiner, KeySet, ScoreCombiner, ScoreMap};
use crate::search::tantivy::{CoreIndex, CoreSnapshot, Similarity};

type FilterCache = CollectorCache<(u64, QueryExpr), Arc<FilterBits>>;
type ScoreCache = CollectorCache<(u64, String, QueryExpr), Arc<ScoreMap>>;

/// A registered core and the caches scoped to it.
struct CoreEntry {
    index: Arc<CoreIndex>,
    filters: FilterCache,
    scores: ScoreCache,
}

impl CoreEntry {
    fn invalidate(&self) {
        self.filters.clear();
        self.scores.clear();
    }
}

/// Cache statistics of one core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreCacheStats {
    pub filters: CacheStats,
    pub scores: CacheStats,
}

/// Runs composed queries over a set of named cores.
pub struct MultiCoreExecutor {
    cores: RwLock<BTreeMap<String, Arc<CoreEntry>>>,
    combiner: Arc<dyn ScoreCombiner>,
    settings: Settings,
}

impl std::fmt::Debug for MultiCoreExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiCoreExecutor")
            .field("cores", &self.cores.read().keys().collect::<Vec<_>>())
            .field("combiner", &self.combiner)
            .finish()
    }
}

impl MultiCoreExecutor {
    pub fn new(settings: Settings) -> Self {
        Self {
            cores: RwLock::new(BTreeMap::new()),
            combiner: Arc::new(AdditiveCombiner),
            settings,
        }
    }

    /// Open every core of an engine config.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.settings.validate()?;
        let executor = Self::new(config.settings.clone());
        for core in &config.cores {
            executor.register(CoreIndex::open(core, &config.settings)?);
        }
        Ok(executor)
    }

    /// Replace the policy folding rank-core scores into result scores.
    pub fn with_score_combiner(mut self, combiner: Arc<dyn ScoreCombiner>) -> Self {
        self.combiner = combiner;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Register a core under its name, replacing any core of that name.
    pub fn register(&self, index: CoreIndex) -> Arc<CoreIndex> {
        let index = Arc::new(index);
        let entry = CoreEntry {
            index: index.clone(),
            filters: CollectorCache::new("filters", self.settings.filter_cache_size),
            scores: CollectorCache::new("scores", self.settings.score_cache_size),
        };
        self.cores
            .write()
            .insert(index.name().to_string(), Arc::new(entry));
        index
    }

    pub fn core(&self, name: &str) -> Result<Arc<CoreIndex>> {
        Ok(self.entry(name)?.index.clone())
    }

    pub fn core_names(&self) -> Vec<String> {
        self.cores.read().keys().cloned().collect()
    }

    fn entry(&self, name: &str) -> Result<Arc<CoreEntry>> {
        self.cores
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ComposeError::UnknownCore(name.to_string()))
    }

    pub fn add_document(
        &self,
        core: &str,
        identifier: &str,
        document: &CoreDocument,
    ) -> Result<()> {
        let entry = self.entry(core)?;
        entry.index.add_document(identifier, document)?;
        entry.invalidate();
        Ok(())
    }

    pub fn delete(&self, core: &str, identifier: &str) -> Result<()> {
        let entry = self.entry(core)?;
        entry.index.delete(identifier)?;
        entry.invalidate();
        Ok(())
    }

    /// Commit a core; caches are dropped when a new generation became visible.
    pub fn commit(&self, core: &str) -> Result<bool> {
        let entry = self.entry(core)?;
        let changed = entry.index.commit()?;
        if changed {
            entry.invalidate();
        }
        Ok(changed)
    }

    pub fn commit_all(&self) -> Result<()> {
        for name in self.core_names() {
            self.commit(&name)?;
        }
        Ok(())
    }

    pub fn reopen(&self, core: &str) -> Result<bool> {
        let entry = self.entry(core)?;
        let changed = entry.index.reopen()?;
        if changed {
            entry.invalidate();
        }
        Ok(changed)
    }

    /// Drop every cached artifact of a core.
    pub fn invalidate(&self, core: &str) -> Result<()> {
        self.entry(core)?.invalidate();
        tracing::debug!(core, "caches_invalidated");
        Ok(())
    }

    pub fn cache_stats(&self, core: &str) -> Result<CoreCacheStats> {
        let entry = self.entry(core)?;
        Ok(CoreCacheStats {
            filters: entry.filters.stats(),
            scores: entry.scores.stats(),
        })
    }

    /// Change a core's scoring function. Cached rank scores are dropped with it.
    pub fn set_similarity(&self, core: &str, similarity: Similarity) -> Result<()> {
        let entry = self.entry(core)?;
        entry.index.set_similarity(similarity);
        entry.scores.clear();
        Ok(())
    }

    pub fn prefix_search(
        &self,
        core: &str,
        field: &str,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<TermCount>> {
        self.core(core)?.terms_for_field(field, prefix, limit)
    }

    pub fn fieldnames(&self, core: &str) -> Result<Vec<String>> {
        Ok(self.core(core)?.fieldnames())
    }

    pub fn drilldown_fieldnames(&self, core: &str) -> Result<Vec<String>> {
        Ok(self.core(core)?.drilldown_fieldnames())
    }

    pub fn core_info(&self) -> Vec<CoreInfo> {
        self.cores
            .read()
            .values()
            .map(|entry| CoreInfo {
                name: entry.index.name().to_string(),
                num_docs: entry.index.num_docs(),
                fieldnames: entry.index.fieldnames(),
                drilldown_fieldnames: entry.index.drilldown_fieldnames(),
            })
            .collect()
    }

    /// Commit pending mutations of every core.
    pub fn shutdown(&self) -> Result<()> {
        for entry in self.cores.read().values() {
            entry.index.close()?;
        }
        Ok(())
    }

    pub fn execute(&self, query: &ComposedQuery) -> Result<ComposedResponse> {
        let started = Instant::now();
        let mut entries = BTreeMap::new();
        for core in query.cores() {
            entries.insert(core.to_string(), self.entry(core)?);
        }
        query.validate()?;
        validate_fields(query, &entries)?;
        let plans = compose_plans(query, &entries)?;

        let request = Request {
            query,
            plans,
            max_join_key: self.settings.max_join_key,
            combiner: self.combiner.clone(),
        };
        let mut response = request.run()?;
        response.query_time = u64::try_from(started.elapsed().as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        tracing::debug!(
            results_from = %query.results_from,
            total = response.total,
            query_time = response.query_time,
            "composed_query_executed"
        );
        Ok(response)
    }
}

fn require_key_field(entries: &BTreeMap<String, Arc<CoreEntry>>, core: &str, field: &str, what: &str) -> Result<()> {
    let registry = registry_of(entries, core)?;
    if !registry.contains(field) {
        return Err(ComposeError::unknown_field(core, field));
    }
    if !registry.is_key_field(field) {
        return Err(ComposeError::unsupported(what, field, "not a key field"));
    }
    Ok(())
}

fn registry_of<'e>(
    entries: &'e BTreeMap<String, Arc<CoreEntry>>,
    core: &str,
) -> Result<&'e FieldRegistry> {
    entries
        .get(core)
        .map(|entry| entry.index.registry())
        .ok_or_else(|| ComposeError::UnknownCore(core.to_string()))
}

/// Every field the request names must exist in its core with a usable kind.
fn validate_fields(query: &ComposedQuery, entries: &BTreeMap<String, Arc<CoreEntry>>) -> Result<()> {
    let results = query.results_from.as_str();
    for m in query.matches() {
        for side in [&m.left, &m.right] {
            if let Some(field) = side.unique_key.as_deref().or(side.key.as_deref()) {
                require_key_field(entries, &side.core, field, "match")?;
            }
        }
    }
    for (core, facet) in query.facets() {
        let registry = registry_of(entries, core)?;
        if !registry.is_drilldown_field(&facet.fieldname) {
            return Err(ComposeError::unknown_field(core, &facet.fieldname));
        }
    }
    for core in query.cores() {
        let registry = registry_of(entries, core)?;
        for dq in query.drilldown_queries_for(core) {
            if !registry.is_drilldown_field(&dq.fieldname) {
                return Err(ComposeError::unknown_field(core, &dq.fieldname));
            }
            if dq.path.is_empty() {
                return Err(ComposeError::unsupported("drilldown", &dq.fieldname, "empty path"));
            }
        }
    }
    for key in query.sort_keys() {
        if key.is_score() {
            continue;
        }
        let core = key.core.as_deref().unwrap_or(results);
        let registry = registry_of(entries, core)?;
        if !registry.contains(&key.sort_by) {
            return Err(ComposeError::unknown_field(core, &key.sort_by));
        }
        if registry.sort_field_type(&key.sort_by).is_none() {
            return Err(ComposeError::unsupported("sortBy", &key.sort_by, "field is not sortable"));
        }
    }
    for (field, what) in [
        (&query.dedup_field, "dedupField"),
        (&query.grouping_field, "groupingField"),
        (&query.export_key, "exportKey"),
    ] {
        if let Some(field) = field {
            require_key_field(entries, results, field, what)?;
        }
    }
    if let Some(field) = &query.dedup_sort_field {
        let registry = registry_of(entries, results)?;
        if !registry.contains(field) {
            return Err(ComposeError::unknown_field(results, field));
        }
        if registry.sort_field_type(field).is_none() {
            return Err(ComposeError::unsupported("dedupSortField", field, "field is not sortable"));
        }
    }
    if let Some(request) = &query.suggestion_request {
        let registry = registry_of(entries, results)?;
        if !registry.contains(&request.field) {
            return Err(ComposeError::unknown_field(results, &request.field));
        }
    }
    Ok(())
}

/// Composed queries of one core, bound to the snapshot the request runs against.
struct CorePlan {
    entry: Arc<CoreEntry>,
    snapshot: Arc<CoreSnapshot>,
    query: Option<Box<dyn Query>>,
    drilldowns: Vec<Box<dyn Query>>,
    filters: Vec<(QueryExpr, Box<dyn Query>)>,
    facet_filters: Vec<(QueryExpr, Box<dyn Query>)>,
    rank: Option<Box<dyn Query>>,
    rank_expr: Option<QueryExpr>,
}

impl CorePlan {
    fn index(&self) -> &CoreIndex {
        &self.entry.index
    }

    /// Base query (or everything) constrained by the core's drilldowns.
    fn constrained(&self, with_base: bool) -> Box<dyn Query> {
        let base: Box<dyn Query> = match (&self.query, with_base) {
            (Some(query), true) => query.box_clone(),
            _ => Box::new(AllQuery),
        };
        if self.drilldowns.is_empty() {
            return base;
        }
        let mut clauses = vec![(Occur::Must, base)];
        for drilldown in &self.drilldowns {
            let unscored: Box<dyn Query> = Box::new(ConstScoreQuery::new(drilldown.box_clone(), 0.0));
            clauses.push((Occur::Must, unscored));
        }
        Box::new(BooleanQuery::new(clauses))
    }

    /// Bitsets of the given filters, from the core's cache when present.
    fn filter_bits(&self, filters: &[(QueryExpr, Box<dyn Query>)]) -> Result<Vec<Arc<FilterBits>>> {
        filters
            .iter()
            .map(|(expr, query)| {
                self.entry.filters.get_or_try_insert_with(
                    (self.snapshot.generation, expr.clone()),
                    || -> Result<Arc<FilterBits>> {
                        let bits =
                            self.index()
                                .search(&self.snapshot, query.as_ref(), Vec::new(), BitsCollector)?;
                        tracing::debug!(core = self.index().name(), docs = bits.len(), "filter_bits_built");
                        Ok(Arc::new(bits))
                    },
                )
            })
            .collect()
    }
}

fn compose_plans(
    query: &ComposedQuery,
    entries: &BTreeMap<String, Arc<CoreEntry>>,
) -> Result<BTreeMap<String, CorePlan>> {
    let compose_all = |index: &CoreIndex, exprs: &[QueryExpr]| -> Result<Vec<(QueryExpr, Box<dyn Query>)>> {
        exprs
            .iter()
            .map(|expr| Ok((expr.clone(), index.compose(expr)?)))
            .collect()
    };
    let rank_queries: BTreeMap<&str, &QueryExpr> = query.rank_queries().collect();

    let mut plans = BTreeMap::new();
    for (name, entry) in entries {
        let index: &CoreIndex = &entry.index;
        let base = query.query_for(name).map(|e| index.compose(e)).transpose()?;
        let mut drilldowns: Vec<Box<dyn Query>> = Vec::new();
        for dq in query.drilldown_queries_for(name) {
            let field = schema_field(name, index.schema(), &dq.fieldname)?;
            let term = Term::from_facet(field, &Facet::from_path(&dq.path));
            drilldowns.push(Box::new(TermQuery::new(term, IndexRecordOption::Basic)));
        }
        let rank_expr = rank_queries.get(name.as_str()).map(|e| (*e).clone());
        let rank = rank_expr.as_ref().map(|e| index.compose(e)).transpose()?;
        plans.insert(
            name.clone(),
            CorePlan {
                entry: entry.clone(),
                snapshot: index.snapshot(),
                query: base,
                drilldowns,
                filters: compose_all(index, query.filter_queries_for(name))?,
                facet_filters: compose_all(index, query.other_core_facet_filters_for(name))?,
                rank,
                rank_expr,
            },
        );
    }
    // Unite side queries compose here too, so a bad one fails before any search.
    for unite in query.unites() {
        for side in [&unite.left, &unite.right] {
            let index = &registry_entry(entries, &side.core)?.index;
            index.compose(&side.query)?;
        }
    }
    Ok(plans)
}

fn registry_entry<'e>(entries: &'e BTreeMap<String, Arc<CoreEntry>>, core: &str) -> Result<&'e Arc<CoreEntry>> {
    entries
        .get(core)
        .ok_or_else(|| ComposeError::UnknownCore(core.to_string()))
}

/// Key fields of a match between the result core and `core`: (result side, other side).
fn join_fields<'q>(query: &'q ComposedQuery, core: &str) -> Result<(&'q str, &'q str)> {
    let results = query.results_from.as_str();
    match (query.key_name(results, core), query.key_name(core, results)) {
        (Some(ours), Some(theirs)) => Ok((ours, theirs)),
        _ => Err(ComposeError::InvalidMatchSpecification(format!(
            "No match set for cores [\"{core}\"] with result core '{results}'"
        ))),
    }
}

struct Request<'q> {
    query: &'q ComposedQuery,
    plans: BTreeMap<String, CorePlan>,
    max_join_key: u64,
    combiner: Arc<dyn ScoreCombiner>,
}

impl Request<'_> {
    fn plan(&self, core: &str) -> Result<&CorePlan> {
        self.plans
            .get(core)
            .ok_or_else(|| ComposeError::UnknownCore(core.to_string()))
    }

    fn run(&self) -> Result<ComposedResponse> {
        let query = self.query;
        let results = query.results_from.as_str();
        let plan = self.plan(results)?;
        let registry = plan.index().registry();

        let constraints = self.key_constraints()?;
        let sources = self.rank_sources()?;
        let sort = self.sort_specs()?;

        let main = match &plan.rank {
            Some(rank) => Box::new(BooleanQuery::new(vec![
                (Occur::Must, plan.constrained(true)),
                (Occur::Should, rank.box_clone()),
            ])) as Box<dyn Query>,
            None => plan.constrained(true),
        };
        let filters = plan.filter_bits(&plan.filters)?;

        let dedup_sort = query.dedup_sort_field.as_ref().and_then(|field| {
            registry
                .sort_field_type(field)
                .map(|kind| (field.clone(), kind))
        });
        let top = TopHitsCollector::new(query.stop, sort)
            .grouped_by(query.grouping_field.clone())
            .keeping_all(query.dedup_field.is_some());
        let dedup = DedupCollector::new(query.dedup_field.clone(), dedup_sort, top);

        let key_fields = self.result_key_fields()?;
        let keys = Each(
            key_fields
                .iter()
                .map(|field| KeyCollector::new(field.clone(), self.max_join_key))
                .collect(),
        );
        let mut facet_fields: Vec<String> = Vec::new();
        for facet in query.facets_for(results) {
            if !facet_fields.contains(&facet.fieldname) {
                facet_fields.push(facet.fieldname.clone());
            }
        }
        let chain = KeyFilterCollector::new(
            constraints,
            ScoreJoinCollector::new(
                sources,
                self.combiner.clone(),
                (dedup, keys, DrilldownCollector::new(facet_fields)),
            ),
        );
        let (deduped, key_sets, result_facets) =
            plan.index().search(&plan.snapshot, main.as_ref(), filters, chain)?;
        let reached: BTreeMap<String, Arc<KeySet>> = key_fields
            .into_iter()
            .zip(key_sets.into_iter().map(Arc::new))
            .collect();

        let top = &deduped.inner;
        let window = query.stop.saturating_sub(query.start);
        let mut hits = Vec::with_capacity(window.min(top.hits.len()));
        for ranked in top.hits.iter().skip(query.start).take(window) {
            let address = ranked.candidate.address;
            let duplicate_count = query
                .dedup_field
                .as_ref()
                .map(|field| BTreeMap::from([(field.clone(), deduped.duplicate_count(address))]));
            let duplicates = match (&query.grouping_field, &ranked.group_members) {
                (Some(field), Some(members)) => {
                    let identifiers = members
                        .iter()
                        .map(|member| plan.index().identifier(&plan.snapshot, *member))
                        .collect::<Result<Vec<_>>>()?;
                    Some(BTreeMap::from([(field.clone(), identifiers)]))
                }
                _ => None,
            };
            hits.push(Hit {
                identifier: plan.index().identifier(&plan.snapshot, address)?,
                score: ranked.candidate.score,
                duplicate_count,
                duplicates,
            });
        }

        let other_facets = self.other_core_facets(&reached)?;
        let mut drilldown_data = Vec::new();
        for (core, facet) in query.facets() {
            let counts = if core == results {
                Some(&result_facets)
            } else {
                other_facets.get(core.as_str())
            };
            let hierarchical = self
                .plan(core)?
                .index()
                .registry()
                .is_hierarchical_drilldown(&facet.fieldname);
            drilldown_data.push(FacetResult {
                fieldname: facet.fieldname.clone(),
                path: facet.path.clone(),
                terms: counts
                    .map(|c| c.terms(facet, hierarchical))
                    .unwrap_or_default(),
            });
        }

        let suggestions = match &query.suggestion_request {
            Some(request) => {
                let mut suggestions = BTreeMap::new();
                for word in &request.suggests {
                    let words =
                        plan.index()
                            .suggest(&plan.snapshot, word, request.count, &request.field)?;
                    suggestions.insert(word.clone(), words);
                }
                Some(suggestions)
            }
            None => None,
        };

        let keys = match &query.export_key {
            Some(field) => {
                let values: Vec<u64> = reached
                    .get(field)
                    .map(|keys| keys.iter().collect())
                    .unwrap_or_default();
                if values.is_empty() && top.total > 0 {
                    tracing::warn!(field = %field, "export_key_without_values");
                }
                Some(values)
            }
            None => None,
        };

        Ok(ComposedResponse {
            total: top.total,
            total_with_duplicates: deduped.enabled.then_some(deduped.total_with_duplicates),
            hits,
            drilldown_data,
            query_time: 0,
            suggestions,
            keys,
        })
    }

    /// Result-core key fields whose reached values later stages need.
    fn result_key_fields(&self) -> Result<Vec<String>> {
        let query = self.query;
        let results = query.results_from.as_str();
        let mut fields: Vec<String> = Vec::new();
        let mut add = |field: &str| {
            if !fields.iter().any(|f| f == field) {
                fields.push(field.to_string());
            }
        };
        if let Some(field) = &query.export_key {
            add(field);
        }
        for (core, _) in query.facets() {
            if core != results {
                add(join_fields(query, core)?.0);
            }
        }
        Ok(fields)
    }

    /// One key-set constraint per result key field: filtering cores intersect, unite
    /// sides union and then intersect with the rest.
    fn key_constraints(&self) -> Result<Vec<KeyConstraint>> {
        let query = self.query;
        let mut by_field: BTreeMap<String, KeySet> = BTreeMap::new();
        let mut restrict = |field: &str, keys: KeySet| match by_field.entry(field.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(keys);
            }
            Entry::Occupied(mut slot) => slot.get_mut().intersect_with(&keys),
        };

        for core in query.filtering_cores() {
            let (ours, theirs) = join_fields(query, core)?;
            let plan = self.plan(core)?;
            let filters = plan.filter_bits(&plan.filters)?;
            let keys = plan.index().search(
                &plan.snapshot,
                plan.constrained(true).as_ref(),
                filters,
                KeyCollector::new(theirs, self.max_join_key),
            )?;
            tracing::debug!(
                core,
                field = theirs,
                keys = keys.len(),
                ignored = keys.ignored(),
                "join_keys_collected"
            );
            restrict(ours, keys);
        }

        for unite in query.unites() {
            let field = query.unite_key_name(unite)?;
            let mut keys = self.unite_side_keys(&unite.left, field)?;
            keys.union_with(&self.unite_side_keys(&unite.right, field)?);
            tracing::debug!(field, keys = keys.len(), "unite_keys_collected");
            restrict(field, keys);
        }

        Ok(by_field
            .into_iter()
            .map(|(field, keys)| KeyConstraint {
                field,
                keys: Arc::new(keys),
            })
            .collect())
    }

    fn unite_side_keys(&self, side: &UniteSide, result_field: &str) -> Result<KeySet> {
        let key_field = if side.core == self.query.results_from {
            result_field
        } else {
            join_fields(self.query, &side.core)?.1
        };
        let plan = self.plan(&side.core)?;
        let side_query = plan.index().compose(&side.query)?;
        plan.index().search(
            &plan.snapshot,
            side_query.as_ref(),
            Vec::new(),
            KeyCollector::new(key_field, self.max_join_key),
        )
    }

    /// Rank scores of auxiliary cores, keyed through each core's join key.
    fn rank_sources(&self) -> Result<Vec<ScoreSource>> {
        let results = self.query.results_from.as_str();
        let mut sources = Vec::new();
        for (core, plan) in &self.plans {
            if core == results {
                continue;
            }
            let (Some(rank), Some(expr)) = (&plan.rank, &plan.rank_expr) else {
                continue;
            };
            let (ours, theirs) = join_fields(self.query, core)?;
            let scores = plan.entry.scores.get_or_try_insert_with(
                (plan.snapshot.generation, theirs.to_string(), expr.clone()),
                || -> Result<Arc<ScoreMap>> {
                    let scores = plan.index().search(
                        &plan.snapshot,
                        rank.as_ref(),
                        Vec::new(),
                        ScoreCollector::new(theirs),
                    )?;
                    tracing::debug!(core = %core, keys = scores.len(), "rank_scores_collected");
                    Ok(Arc::new(scores))
                },
            )?;
            sources.push(ScoreSource {
                field: ours.to_string(),
                scores,
            });
        }
        Ok(sources)
    }

    fn sort_specs(&self) -> Result<Vec<SortSpec>> {
        let results = self.query.results_from.as_str();
        let mut specs = Vec::new();
        for key in self.query.sort_keys() {
            if key.is_score() {
                specs.push(SortSpec::Score {
                    descending: key.sort_descending,
                });
                continue;
            }
            let core = key.core.as_deref().unwrap_or(results);
            let plan = self.plan(core)?;
            let registry = plan.index().registry();
            let Some(kind) = registry.sort_field_type(&key.sort_by) else {
                return Err(ComposeError::unsupported("sortBy", &key.sort_by, "field is not sortable"));
            };
            let missing = key.missing_value.as_ref().map_or_else(
                || registry.default_missing_value_for_sort(&key.sort_by, key.sort_descending),
                SortValue::from,
            );
            if core == results {
                specs.push(SortSpec::Field {
                    field: key.sort_by.clone(),
                    kind,
                    descending: key.sort_descending,
                    missing,
                });
            } else {
                let (ours, theirs) = join_fields(self.query, core)?;
                let values = plan.index().search(
                    &plan.snapshot,
                    &AllQuery,
                    Vec::new(),
                    SortValueCollector::new(theirs, key.sort_by.clone(), kind),
                )?;
                tracing::debug!(core, field = %key.sort_by, keys = values.len(), "join_sort_values_collected");
                specs.push(SortSpec::Joined {
                    key_field: ours.to_string(),
                    values: Arc::new(values),
                    descending: key.sort_descending,
                    missing,
                });
            }
        }
        Ok(specs)
    }

    /// Facet counts of non-result cores over documents whose join key the result set reached.
    fn other_core_facets(
        &self,
        reached: &BTreeMap<String, Arc<KeySet>>,
    ) -> Result<BTreeMap<&str, FacetCounts>> {
        let results = self.query.results_from.as_str();
        let mut fields_by_core: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for (core, facet) in self.query.facets() {
            if core == results {
                continue;
            }
            let fields = fields_by_core.entry(core.as_str()).or_default();
            if !fields.contains(&facet.fieldname) {
                fields.push(facet.fieldname.clone());
            }
        }

        let mut counts = BTreeMap::new();
        for (core, fields) in fields_by_core {
            let (ours, theirs) = join_fields(self.query, core)?;
            let plan = self.plan(core)?;
            let keys = reached
                .get(ours)
                .cloned()
                .unwrap_or_else(|| Arc::new(KeySet::new(self.max_join_key)));
            let mut filters = plan.filter_bits(&plan.filters)?;
            filters.extend(plan.filter_bits(&plan.facet_filters)?);
            let collector = KeyFilterCollector::new(
                vec![KeyConstraint {
                    field: theirs.to_string(),
                    keys,
                }],
                DrilldownCollector::new(fields),
            );
            let facet_counts =
                plan.index()
                    .search(&plan.snapshot, plan.constrained(false).as_ref(), filters, collector)?;
            tracing::debug!(core, "other_core_facets_counted");
            counts.insert(core, facet_counts);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FacetRequest, JoinSide};
    use crate::search::fields::FieldKind;

    fn executor() -> anyhow::Result<MultiCoreExecutor> {
        let settings = Settings::default();
        let executor = MultiCoreExecutor::new(settings.clone());
        let books = FieldRegistry::default()
            .with("title", FieldKind::Text { stemmed: false })
            .with("work_id", FieldKind::Key)
            .with("genre", FieldKind::Drilldown { hierarchical: true });
        let reviews = FieldRegistry::default()
            .with("stars", FieldKind::Integer)
            .with("work_id", FieldKind::Key);
        executor.register(CoreIndex::in_memory("books", books, Vec::new(), &settings)?);
        executor.register(CoreIndex::in_memory("reviews", reviews, Vec::new(), &settings)?);
        for (id, title, key, genre) in [
            ("b1", "dune", 1, "fiction>scifi"),
            ("b2", "emma", 2, "fiction>romance"),
        ] {
            executor.add_document(
                "books",
                id,
                &CoreDocument::new()
                    .with("title", title)
                    .with("work_id", key)
                    .with("genre", genre),
            )?;
        }
        executor.add_document("reviews", "r1", &CoreDocument::new().with("stars", 5).with("work_id", 2))?;
        executor.commit_all()?;
        Ok(executor)
    }

    fn joined() -> ComposedQuery {
        let mut q = ComposedQuery::new("books");
        q.add_match(
            JoinSide::unique("books", "work_id"),
            JoinSide::key("reviews", "work_id"),
        );
        q
    }

    #[test]
    fn unknown_core_fails_before_search() -> anyhow::Result<()> {
        let exec = executor()?;
        let mut q = joined();
        q.set_core_query("shelves", None);
        let err = exec.execute(&q).unwrap_err();
        assert_eq!(err.to_string(), "Unknown core 'shelves'");
        Ok(())
    }

    #[test]
    fn filtering_core_restricts_results() -> anyhow::Result<()> {
        let exec = executor()?;
        let mut q = joined();
        q.add_filter_query("reviews", QueryExpr::clause("stars", crate::model::Relation::Ge, "4"));
        let response = exec.execute(&q)?;
        assert_eq!(response.identifiers(), vec!["b2"]);
        assert_eq!(response.total, 1);
        assert!(response.query_time >= 1);
        Ok(())
    }

    #[test]
    fn result_facets_count_ancestors() -> anyhow::Result<()> {
        let exec = executor()?;
        let mut q = ComposedQuery::new("books");
        q.add_facet("books", FacetRequest::new("genre", 0));
        let response = exec.execute(&q)?;
        let genre = response.facet("genre").unwrap();
        assert_eq!(genre.counts(), vec![("fiction", 2)]);
        assert_eq!(genre.terms[0].subterms.len(), 2);
        Ok(())
    }

    #[test]
    fn undeclared_and_unsuitable_fields_are_rejected() -> anyhow::Result<()> {
        let exec = executor()?;
        let mut q = ComposedQuery::new("books");
        q.add_facet("books", FacetRequest::new("colour", 0));
        assert!(matches!(exec.execute(&q), Err(ComposeError::UnknownField { .. })));

        let mut q = ComposedQuery::new("books");
        q.dedup_field = Some("title".into());
        assert!(matches!(exec.execute(&q), Err(ComposeError::UnsupportedQuery { .. })));

        let mut q = ComposedQuery::new("books");
        q.add_sort_key(crate::model::SortKey::new("title", false));
        assert!(matches!(exec.execute(&q), Err(ComposeError::UnsupportedQuery { .. })));
        Ok(())
    }

    #[test]
    fn similarity_change_drops_cached_scores() -> anyhow::Result<()> {
        let exec = executor()?;
        let mut q = joined();
        q.set_rank_query("reviews", QueryExpr::all());
        exec.execute(&q)?;
        assert_eq!(exec.cache_stats("reviews")?.scores.len, 1);
        exec.set_similarity("reviews", Similarity::Constant)?;
        assert_eq!(exec.cache_stats("reviews")?.scores.len, 0);
        Ok(())
    }

    #[test]
    fn repeated_requests_reuse_cached_filters_and_scores() -> anyhow::Result<()> {
        let exec = executor()?;
        let mut q = joined();
        q.add_filter_query("books", QueryExpr::eq("title", "emma"));
        q.set_rank_query("reviews", QueryExpr::all());
        let first = exec.execute(&q)?;
        let second = exec.execute(&q)?;
        assert_eq!(first.identifiers(), second.identifiers());
        assert_eq!(first.identifiers(), vec!["b2"]);

        let books = exec.cache_stats("books")?;
        assert_eq!((books.filters.misses, books.filters.hits, books.filters.len), (1, 1, 1));
        let reviews = exec.cache_stats("reviews")?;
        assert_eq!((reviews.scores.misses, reviews.scores.hits, reviews.scores.len), (1, 1, 1));
        Ok(())
    }
}
