//! Request and response data model.
//!
//! - **[`expr`]**: parsed query expression trees.
//! - **[`composed`]**: the composed-query request spanning several cores.
//! - **[`response`]**: hits, facet trees and index-level answers.

pub mod composed;
pub mod expr;
pub mod response;

pub use composed::{
    ComposedQuery, FacetRequest, JoinSide, MissingValue, SortKey, SuggestionRequest,
};
pub use expr::{BoolOp, Boost, QueryExpr, Relation};
pub use response::{ComposedResponse, CoreInfo, FacetResult, FacetTerm, Hit, TermCount};
