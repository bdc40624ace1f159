#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use corejoin::config::Settings;
use corejoin::model::{ComposedQuery, ComposedResponse, JoinSide};
use corejoin::search::composer::UnqualifiedField;
use corejoin::search::fields::{CoreDocument, FieldKind, FieldRegistry};
use corejoin::search::tantivy::CoreIndex;
use corejoin::MultiCoreExecutor;

/// Captures tracing output for tests.
pub struct TestTracing {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Settings for test cores: auto-commit off, small caches, two search threads.
pub fn test_settings() -> Settings {
    Settings {
        commit_count: u64::MAX,
        commit_timeout_secs: 3600,
        writer_heap_bytes: 15_000_000,
        search_threads: 2,
        filter_cache_size: 8,
        score_cache_size: 8,
        ..Settings::default()
    }
}

pub fn core_a_fields() -> FieldRegistry {
    FieldRegistry::default()
        .with("A", FieldKind::Key)
        .with("M", FieldKind::Untokenized)
        .with("U", FieldKind::Untokenized)
        .with("Q", FieldKind::Untokenized)
        .with("S", FieldKind::Sorted)
        .with("title", FieldKind::Text { stemmed: true })
        .with("cat", FieldKind::Drilldown { hierarchical: true })
}

pub fn core_b_fields() -> FieldRegistry {
    FieldRegistry::default()
        .with("B", FieldKind::Key)
        .with("N", FieldKind::Untokenized)
        .with("O", FieldKind::Untokenized)
        .with("T", FieldKind::Integer)
        .with("cat_N", FieldKind::Drilldown { hierarchical: false })
}

pub fn core_c_fields() -> FieldRegistry {
    FieldRegistry::default()
        .with("C", FieldKind::Key)
        .with("R", FieldKind::Untokenized)
        .with("cat_R", FieldKind::Drilldown { hierarchical: false })
}

/// Executor with empty `coreA`, `coreB` and `coreC`.
pub fn empty_world(settings: Settings) -> anyhow::Result<MultiCoreExecutor> {
    let executor = MultiCoreExecutor::new(settings.clone());
    executor.register(CoreIndex::in_memory(
        "coreA",
        core_a_fields(),
        vec![UnqualifiedField::new("title", 1.0)],
        &settings,
    )?);
    executor.register(CoreIndex::in_memory("coreB", core_b_fields(), Vec::new(), &settings)?);
    executor.register(CoreIndex::in_memory("coreC", core_c_fields(), Vec::new(), &settings)?);
    Ok(executor)
}

/// Adds the join world documents without committing.
///
/// | coreA  | A | fields         | coreB | B | fields        | coreC | C | fields |
/// |--------|---|----------------|-------|---|---------------|-------|---|--------|
/// | A      | 1 | cat x>1        | B-N   | 3 | N, T=10, nerd | C-R   | 2 | R      |
/// | A-U    | 2 | U, cat x>2     | B-O   | 4 | O, T=30       | C-S   | 5 |        |
/// | A-M    | 3 | M, cat y       | B-N-O | 5 | N, O, T=20    |       |   |        |
/// | A-MU   | 4 | M, U, cat x>1  |       |   |               |       |   |        |
/// | A-MQ   | 5 | M, Q, cat y    |       |   |               |       |   |        |
pub fn populate(executor: &MultiCoreExecutor) -> anyhow::Result<()> {
    let a = |key: i64, cat: &str| CoreDocument::new().with("A", key).with("cat", cat);
    executor.add_document("coreA", "A", &a(1, "x>1").with("S", "e").with("title", "first running"))?;
    executor.add_document("coreA", "A-U", &a(2, "x>2").with("U", "true").with("S", "d"))?;
    executor.add_document("coreA", "A-M", &a(3, "y").with("M", "true").with("S", "c"))?;
    executor.add_document(
        "coreA",
        "A-MU",
        &a(4, "x>1").with("M", "true").with("U", "true").with("S", "b"),
    )?;
    executor.add_document(
        "coreA",
        "A-MQ",
        &a(5, "y").with("M", "true").with("Q", "true").with("S", "a"),
    )?;

    executor.add_document(
        "coreB",
        "B-N",
        &CoreDocument::new()
            .with("B", 3)
            .with("N", "true")
            .with("T", 10)
            .with("cat_N", "nerd"),
    )?;
    executor.add_document(
        "coreB",
        "B-O",
        &CoreDocument::new()
            .with("B", 4)
            .with("O", "true")
            .with("T", 30)
            .with("cat_N", "other"),
    )?;
    executor.add_document(
        "coreB",
        "B-N-O",
        &CoreDocument::new()
            .with("B", 5)
            .with("N", "true")
            .with("O", "true")
            .with("T", 20)
            .with("cat_N", "nerd")
            .with("cat_N", "other"),
    )?;

    executor.add_document(
        "coreC",
        "C-R",
        &CoreDocument::new().with("C", 2).with("R", "true").with("cat_R", "r"),
    )?;
    executor.add_document("coreC", "C-S", &CoreDocument::new().with("C", 5).with("cat_R", "s"))?;
    Ok(())
}

/// The committed join world.
pub fn join_world() -> anyhow::Result<MultiCoreExecutor> {
    let executor = empty_world(test_settings())?;
    populate(&executor)?;
    executor.commit_all()?;
    Ok(executor)
}

/// `coreA` results, matched to `coreB` and `coreC` on key `A`.
pub fn joined_query() -> ComposedQuery {
    let mut q = ComposedQuery::new("coreA");
    q.add_match(JoinSide::unique("coreA", "A"), JoinSide::key("coreB", "B"));
    q.add_match(JoinSide::unique("coreA", "A"), JoinSide::key("coreC", "C"));
    q
}

/// Hit identifiers sorted, for set comparisons.
pub fn id_set(response: &ComposedResponse) -> Vec<String> {
    let mut ids: Vec<String> = response.hits.iter().map(|h| h.identifier.clone()).collect();
    ids.sort();
    ids
}
