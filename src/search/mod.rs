//! Search layer.
//!
//! - **[`fields`]**: field kinds, tantivy schema and document encoding per core.
//! - **[`composer`]**: query expression trees to tantivy queries.
//! - **[`tantivy`]**: one core's index, writer, reader generations and term listing.
//! - **[`keys`]**: join key sets, rank score maps and score combination.
//! - **[`cache`]**: bounded LRU caches for filter bitsets and rank scores.
//! - **[`collectors`]**: the collector chain (filter, key filter, score join, dedup, top hits).
//! - **[`facets`]**: drilldown counting and facet trees.
//! - **[`executor`]**: composed-query execution across cores.

pub mod cache;
pub mod collectors;
pub mod composer;
pub mod executor;
pub mod facets;
pub mod fields;
pub mod keys;
pub mod tantivy;
