use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tantivy::collector::Collector;
use tantivy::query::{ConstScoreQuery, Query};
use tantivy::schema::{Field, Schema, Term, Value};
use tantivy::{
    DocAddress, Index, IndexReader, IndexWriter, ReloadPolicy, Searcher, TantivyDocument,
};

use crate::config::{CoreConfig, Settings};
use crate::error::{ComposeError, OnCore, Result};
use crate::model::{QueryExpr, TermCount};
use crate::search::collectors::{FilterBits, FilteredCollector};
use crate::search::composer::{ProtectedStemmer, QueryComposer, UnqualifiedField};
use crate::search::fields::{
    CoreDocument, FieldRegistry, IDFIELD, ValueType, schema_field,
};

/// Scoring function of a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Similarity {
    /// tantivy's BM25.
    #[default]
    Bm25,
    /// Every match scores 1.0.
    Constant,
}

impl FromStr for Similarity {
    type Err = ComposeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bm25" => Ok(Self::Bm25),
            "constant" => Ok(Self::Constant),
            other => Err(ComposeError::InvalidConfig(format!(
                "unknown similarity '{other}'"
            ))),
        }
    }
}

/// A reader generation of one core. Searches hold it for their whole duration, so a
/// reopen never changes the documents a running request sees.
#[derive(Clone)]
pub struct CoreSnapshot {
    pub searcher: Searcher,
    /// Bumped on every reopen that exposes new documents.
    pub generation: u64,
}

impl CoreSnapshot {
    /// Whether `searcher` reads exactly the segments and deletes this snapshot reads.
    fn sees_same_segments(&self, searcher: &Searcher) -> bool {
        self.searcher.generation().segments() == searcher.generation().segments()
    }
}

/// One core: a tantivy index with its writer, reader and query composer.
pub struct CoreIndex {
    name: String,
    index: Index,
    schema: Schema,
    registry: Arc<FieldRegistry>,
    composer: QueryComposer,
    id_field: Field,
    writer: Mutex<IndexWriter>,
    reader: IndexReader,
    snapshot: RwLock<Arc<CoreSnapshot>>,
    /// Serializes reader reloads so a slower reopen never installs an older searcher.
    reopening: Mutex<()>,
    pending: AtomicU64,
    last_commit: Mutex<Instant>,
    similarity: RwLock<Similarity>,
    settings: Settings,
}

impl std::fmt::Debug for CoreIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreIndex")
            .field("name", &self.name)
            .field("generation", &self.snapshot.read().generation)
            .finish_non_exhaustive()
    }
}

impl CoreIndex {
    /// Open the core described by `config`, on disk when it names a path.
    pub fn open(config: &CoreConfig, settings: &Settings) -> Result<Self> {
        let registry = FieldRegistry::new(config.fields.iter().cloned())?;
        let schema = registry.build_schema();
        let index = match &config.path {
            Some(path) => open_or_create(&config.name, path, schema)?,
            None => Index::create_in_ram(schema),
        };
        if !config.ignore_stemming_for_words.is_empty() {
            ProtectedStemmer::new(&config.ignore_stemming_for_words).register(index.tokenizers());
        }
        Self::with_index(
            &config.name,
            index,
            registry,
            config.unqualified_fields.clone(),
            settings,
        )
    }

    /// An in-memory core; used by tests and embedded callers.
    pub fn in_memory(
        name: &str,
        registry: FieldRegistry,
        unqualified: Vec<UnqualifiedField>,
        settings: &Settings,
    ) -> Result<Self> {
        let index = Index::create_in_ram(registry.build_schema());
        Self::with_index(name, index, registry, unqualified, settings)
    }

    fn with_index(
        name: &str,
        mut index: Index,
        registry: FieldRegistry,
        unqualified: Vec<UnqualifiedField>,
        settings: &Settings,
    ) -> Result<Self> {
        index
            .set_multithread_executor(settings.search_threads.max(1))
            .on_core(name)?;
        let schema = index.schema();
        let registry = Arc::new(registry);
        for uf in &unqualified {
            if !registry.contains(&uf.field) {
                return Err(ComposeError::unknown_field(name, &uf.field));
            }
        }
        let composer = QueryComposer::new(
            registry.clone(),
            schema.clone(),
            unqualified,
            index.tokenizers(),
        )?;
        let id_field = schema_field(name, &schema, IDFIELD)?;
        // One indexing thread keeps documents in insertion order.
        let writer = index
            .writer_with_num_threads(1, settings.writer_heap_bytes)
            .on_core(name)?;
        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .on_core(name)?;
        let snapshot = CoreSnapshot {
            searcher: reader.searcher(),
            generation: 0,
        };
        tracing::info!(
            core = %name,
            num_docs = snapshot.searcher.num_docs(),
            "core_opened"
        );
        Ok(Self {
            name: name.to_string(),
            index,
            schema,
            registry,
            composer,
            id_field,
            writer: Mutex::new(writer),
            reader,
            snapshot: RwLock::new(Arc::new(snapshot)),
            reopening: Mutex::new(()),
            pending: AtomicU64::new(0),
            last_commit: Mutex::new(Instant::now()),
            similarity: RwLock::new(settings.similarity),
            settings: settings.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &FieldRegistry {
        &self.registry
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Current reader generation.
    pub fn snapshot(&self) -> Arc<CoreSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn compose(&self, expr: &QueryExpr) -> Result<Box<dyn Query>> {
        self.composer.compose(expr)
    }

    /// Add or replace the document with this identifier.
    pub fn add_document(&self, identifier: &str, document: &CoreDocument) -> Result<()> {
        let doc = self
            .registry
            .encode(&self.name, &self.schema, identifier, document)?;
        {
            let writer = self.writer.lock();
            writer.delete_term(Term::from_field_text(self.id_field, identifier));
            writer.add_document(doc).on_core(&self.name)?;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.maybe_commit()?;
        Ok(())
    }

    pub fn delete(&self, identifier: &str) -> Result<()> {
        self.writer
            .lock()
            .delete_term(Term::from_field_text(self.id_field, identifier));
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.maybe_commit()?;
        Ok(())
    }

    /// Commit when enough mutations are pending or the oldest one is too old.
    pub fn maybe_commit(&self) -> Result<bool> {
        let pending = self.pending.load(Ordering::SeqCst);
        let due = pending >= self.settings.commit_count
            || (pending > 0 && self.last_commit.lock().elapsed() >= self.settings.commit_timeout());
        if due { self.commit() } else { Ok(false) }
    }

    /// Commit pending mutations and reopen. Returns whether a new generation became visible;
    /// without pending mutations nothing happens.
    pub fn commit(&self) -> Result<bool> {
        let pending = self.pending.swap(0, Ordering::SeqCst);
        if pending == 0 {
            return Ok(false);
        }
        let opstamp = self.writer.lock().commit().on_core(&self.name)?;
        *self.last_commit.lock() = Instant::now();
        tracing::info!(core = %self.name, pending, opstamp, "core_committed");
        self.reopen()
    }

    /// Swap in the latest committed generation. A no-op when nothing new was committed.
    ///
    /// The new snapshot is versioned by the segments its own searcher reads, so the stored
    /// generation always describes the documents that searcher sees.
    pub fn reopen(&self) -> Result<bool> {
        let _reopening = self.reopening.lock();
        self.reader.reload().on_core(&self.name)?;
        let searcher = self.reader.searcher();
        let mut current = self.snapshot.write();
        if current.sees_same_segments(&searcher) {
            return Ok(false);
        }
        let next = CoreSnapshot {
            searcher,
            generation: current.generation + 1,
        };
        tracing::info!(
            core = %self.name,
            generation = next.generation,
            num_docs = next.searcher.num_docs(),
            "core_reopened"
        );
        *current = Arc::new(next);
        Ok(true)
    }

    pub fn similarity(&self) -> Similarity {
        *self.similarity.read()
    }

    /// Takes effect for searches started afterwards; running searches keep theirs.
    pub fn set_similarity(&self, similarity: Similarity) {
        *self.similarity.write() = similarity;
    }

    /// Run `collector` over documents matching `query` and every filter.
    pub fn search<C: Collector>(
        &self,
        snapshot: &CoreSnapshot,
        query: &dyn Query,
        filters: Vec<Arc<FilterBits>>,
        collector: C,
    ) -> Result<C::Fruit> {
        let collector = FilteredCollector::new(filters, collector);
        let fruit = match self.similarity() {
            Similarity::Bm25 => snapshot.searcher.search(query, &collector),
            Similarity::Constant => {
                let constant = ConstScoreQuery::new(query.box_clone(), 1.0);
                snapshot.searcher.search(&constant, &collector)
            }
        };
        fruit.on_core(&self.name)
    }

    /// Stored identifier of a document.
    pub fn identifier(&self, snapshot: &CoreSnapshot, address: DocAddress) -> Result<String> {
        let doc: TantivyDocument = snapshot.searcher.doc(address).on_core(&self.name)?;
        Ok(doc
            .get_first(self.id_field)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    pub fn num_docs(&self) -> u64 {
        self.snapshot().searcher.num_docs()
    }

    pub fn fieldnames(&self) -> Vec<String> {
        self.registry.fieldnames()
    }

    pub fn drilldown_fieldnames(&self) -> Vec<String> {
        self.registry.drilldown_fieldnames()
    }

    /// Indexed terms of a string field starting with `prefix`, with their document counts,
    /// most frequent first. A `limit` of 0 means unlimited.
    pub fn terms_for_field(&self, field: &str, prefix: &str, limit: usize) -> Result<Vec<TermCount>> {
        let counts = self.term_counts(&self.snapshot(), field, prefix)?;
        let mut terms: Vec<TermCount> = counts
            .into_iter()
            .map(|(term, count)| TermCount { term, count })
            .collect();
        terms.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.term.cmp(&b.term)));
        if limit > 0 {
            terms.truncate(limit);
        }
        Ok(terms)
    }

    /// Terms of `field` that look like `word`, closest first.
    pub fn suggest(
        &self,
        snapshot: &CoreSnapshot,
        word: &str,
        count: usize,
        field: &str,
    ) -> Result<Vec<String>> {
        let word = word.to_lowercase();
        let mut candidates: Vec<(f64, u64, String)> = self
            .term_counts(snapshot, field, "")?
            .into_iter()
            .filter(|(term, _)| *term != word)
            .filter_map(|(term, freq)| {
                let similarity = strsim::normalized_damerau_levenshtein(&word, &term);
                (similarity >= 0.5).then_some((similarity, freq, term))
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| b.1.cmp(&a.1))
                .then_with(|| a.2.cmp(&b.2))
        });
        Ok(candidates
            .into_iter()
            .take(count)
            .map(|(_, _, term)| term)
            .collect())
    }

    fn term_counts(
        &self,
        snapshot: &CoreSnapshot,
        field: &str,
        prefix: &str,
    ) -> Result<BTreeMap<String, u64>> {
        if !self.registry.contains(field) {
            return Err(ComposeError::unknown_field(&self.name, field));
        }
        if self.registry.value_type(field) != ValueType::String
            || self.registry.is_drilldown_field(field)
        {
            return Err(ComposeError::unsupported(
                "prefix",
                field,
                "terms are only listed for string fields",
            ));
        }
        let field = schema_field(&self.name, &self.schema, field)?;
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for segment in snapshot.searcher.segment_readers() {
            let inverted = segment.inverted_index(field).on_core(&self.name)?;
            let mut stream = inverted.terms().range().ge(prefix.as_bytes()).into_stream()?;
            while stream.advance() {
                let key = stream.key();
                if !key.starts_with(prefix.as_bytes()) {
                    break;
                }
                if let Ok(term) = std::str::from_utf8(key) {
                    *counts.entry(term.to_string()).or_insert(0) +=
                        u64::from(stream.value().doc_freq);
                }
            }
        }
        Ok(counts)
    }

    /// Commit whatever is pending.
    pub fn close(&self) -> Result<()> {
        self.commit()?;
        tracing::info!(core = %self.name, "core_closed");
        Ok(())
    }
}

fn open_or_create(core: &str, path: &Path, schema: Schema) -> Result<Index> {
    std::fs::create_dir_all(path)?;
    let index = if path.join("meta.json").exists() {
        Index::open_in_dir(path).on_core(core)?
    } else {
        Index::create_in_dir(path, schema.clone()).on_core(core)?
    };
    if index.schema() != schema {
        return Err(ComposeError::InvalidConfig(format!(
            "index at {} was built with different fields than core '{core}' declares",
            path.display()
        )));
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::collectors::BitsCollector;
    use crate::search::fields::FieldKind;
    use tantivy::query::AllQuery;
    use tempfile::TempDir;

    fn registry() -> FieldRegistry {
        FieldRegistry::default()
            .with("title", FieldKind::Text { stemmed: false })
            .with("work_id", FieldKind::Key)
    }

    fn core() -> CoreIndex {
        CoreIndex::in_memory(
            "books",
            registry(),
            vec![UnqualifiedField::new("title", 1.0)],
            &Settings::default(),
        )
        .unwrap()
    }

    #[test]
    fn commit_without_changes_keeps_generation() -> anyhow::Result<()> {
        let core = core();
        assert!(!core.commit()?);
        assert_eq!(core.snapshot().generation, 0);
        core.add_document("b1", &CoreDocument::new().with("title", "dune"))?;
        assert!(core.commit()?);
        assert_eq!(core.snapshot().generation, 1);
        assert!(!core.commit()?);
        assert!(!core.reopen()?);
        assert_eq!(core.snapshot().generation, 1);
        assert_eq!(core.num_docs(), 1);
        Ok(())
    }

    #[test]
    fn concurrent_commits_leave_the_latest_snapshot_installed() -> anyhow::Result<()> {
        let core = core();
        std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|worker| {
                    let core = &core;
                    scope.spawn(move || -> Result<()> {
                        for n in 0..25 {
                            let doc = CoreDocument::new().with("title", "dune");
                            core.add_document(&format!("w{worker}-{n}"), &doc)?;
                            core.commit()?;
                        }
                        Ok(())
                    })
                })
                .collect();
            workers
                .into_iter()
                .try_for_each(|w| w.join().expect("worker panicked"))
        })?;
        let snapshot = core.snapshot();
        assert_eq!(snapshot.searcher.num_docs(), 100);
        assert!(snapshot.generation >= 1);
        assert!(!core.reopen()?);
        assert_eq!(core.snapshot().generation, snapshot.generation);
        Ok(())
    }

    #[test]
    fn adding_an_identifier_twice_replaces_the_document() -> anyhow::Result<()> {
        let core = core();
        core.add_document("b1", &CoreDocument::new().with("title", "dune"))?;
        core.add_document("b1", &CoreDocument::new().with("title", "emma"))?;
        core.commit()?;
        assert_eq!(core.num_docs(), 1);
        core.delete("b1")?;
        core.commit()?;
        assert_eq!(core.num_docs(), 0);
        Ok(())
    }

    #[test]
    fn old_snapshots_survive_reopen() -> anyhow::Result<()> {
        let core = core();
        core.add_document("b1", &CoreDocument::new().with("title", "dune"))?;
        core.commit()?;
        let before = core.snapshot();
        core.add_document("b2", &CoreDocument::new().with("title", "emma"))?;
        core.commit()?;
        let bits = core.search(&before, &AllQuery, Vec::new(), BitsCollector)?;
        assert_eq!(bits.len(), 1);
        assert_eq!(core.snapshot().searcher.num_docs(), 2);
        Ok(())
    }

    #[test]
    fn commit_count_triggers_automatic_commit() -> anyhow::Result<()> {
        let settings = Settings {
            commit_count: 2,
            ..Settings::default()
        };
        let core = CoreIndex::in_memory("books", registry(), Vec::new(), &settings)?;
        core.add_document("b1", &CoreDocument::new().with("title", "dune"))?;
        assert_eq!(core.num_docs(), 0);
        core.add_document("b2", &CoreDocument::new().with("title", "emma"))?;
        assert_eq!(core.num_docs(), 2);
        Ok(())
    }

    #[test]
    fn prefix_terms_and_suggestions() -> anyhow::Result<()> {
        let core = core();
        for (id, title) in [("1", "dune"), ("2", "dune messiah"), ("3", "dunes"), ("4", "emma")] {
            core.add_document(id, &CoreDocument::new().with("title", title))?;
        }
        core.commit()?;
        let terms = core.terms_for_field("title", "dun", 0)?;
        let flat: Vec<_> = terms.iter().map(|t| (t.term.as_str(), t.count)).collect();
        assert_eq!(flat, vec![("dune", 2), ("dunes", 1)]);
        assert_eq!(core.terms_for_field("title", "dun", 1)?.len(), 1);

        let suggestions = core.suggest(&core.snapshot(), "dune", 5, "title")?;
        assert_eq!(suggestions, vec!["dunes"]);

        assert!(matches!(
            core.terms_for_field("work_id", "", 0),
            Err(ComposeError::UnsupportedQuery { .. })
        ));
        Ok(())
    }

    #[test]
    fn similarity_parses_and_switches() -> anyhow::Result<()> {
        assert_eq!("BM25".parse::<Similarity>()?, Similarity::Bm25);
        assert!("tfidf".parse::<Similarity>().is_err());
        let core = core();
        core.set_similarity(Similarity::Constant);
        assert_eq!(core.similarity(), Similarity::Constant);
        Ok(())
    }

    #[test]
    fn on_disk_cores_reopen_with_their_documents() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let config = CoreConfig {
            name: "books".into(),
            path: Some(dir.path().join("books")),
            unqualified_fields: Vec::new(),
            ignore_stemming_for_words: Vec::new(),
            fields: vec![crate::search::fields::FieldDefinition::new(
                "title",
                FieldKind::Text { stemmed: false },
            )],
        };
        {
            let core = CoreIndex::open(&config, &Settings::default())?;
            core.add_document("b1", &CoreDocument::new().with("title", "dune"))?;
            core.close()?;
        }
        let core = CoreIndex::open(&config, &Settings::default())?;
        assert_eq!(core.num_docs(), 1);
        Ok(())
    }
}
