//! Parsed query expression trees, as handed over by a query-language front end.
//!
//! Expressions compare by value and hash by value, so they can key caches even though
//! callers rebuild them for every request.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Relation between a field and a term.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Relation {
    /// `=`: analyzed match on tokenized fields, exact match otherwise.
    Eq,
    /// `==` or `exact`.
    Exact,
    Lt,
    Le,
    Ge,
    Gt,
    /// Anything else the front end produced; composing it fails.
    Other(String),
}

impl FromStr for Relation {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "=" => Self::Eq,
            "==" | "exact" => Self::Exact,
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">=" => Self::Ge,
            ">" => Self::Gt,
            other => Self::Other(other.to_string()),
        })
    }
}

impl From<String> for Relation {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(rel) => rel,
            Err(never) => match never {},
        }
    }
}

impl From<Relation> for String {
    fn from(value: Relation) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq => write!(f, "="),
            Self::Exact => write!(f, "exact"),
            Self::Lt => write!(f, "<"),
            Self::Le => write!(f, "<="),
            Self::Ge => write!(f, ">="),
            Self::Gt => write!(f, ">"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BoolOp {
    And,
    Or,
    Not,
}

/// Relation boost; compared bitwise so expressions stay `Eq + Hash`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Boost(pub f32);

impl Default for Boost {
    fn default() -> Self {
        Self(1.0)
    }
}

impl PartialEq for Boost {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for Boost {}

impl Hash for Boost {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl Boost {
    pub fn is_neutral(self) -> bool {
        self.0 == 1.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryExpr {
    /// Unqualified search term; `*` matches everything.
    Term { term: String },
    /// `index relation term`, optionally boosted.
    Clause {
        index: String,
        relation: Relation,
        term: String,
        #[serde(default, skip_serializing_if = "is_default_boost")]
        boost: Boost,
    },
    Boolean {
        operator: BoolOp,
        lhs: Box<QueryExpr>,
        rhs: Box<QueryExpr>,
    },
}

fn is_default_boost(boost: &Boost) -> bool {
    boost.is_neutral()
}

impl QueryExpr {
    pub fn all() -> Self {
        Self::term("*")
    }

    pub fn term(term: impl Into<String>) -> Self {
        Self::Term { term: term.into() }
    }

    pub fn clause(index: impl Into<String>, relation: Relation, term: impl Into<String>) -> Self {
        Self::Clause {
            index: index.into(),
            relation,
            term: term.into(),
            boost: Boost::default(),
        }
    }

    /// `index = term`
    pub fn eq(index: impl Into<String>, term: impl Into<String>) -> Self {
        Self::clause(index, Relation::Eq, term)
    }

    pub fn exact(index: impl Into<String>, term: impl Into<String>) -> Self {
        Self::clause(index, Relation::Exact, term)
    }

    /// Set the boost of a clause; other expressions are returned unchanged.
    pub fn boosted(mut self, value: f32) -> Self {
        if let Self::Clause { boost, .. } = &mut self {
            *boost = Boost(value);
        }
        self
    }

    pub fn and(self, rhs: QueryExpr) -> Self {
        self.combine(BoolOp::And, rhs)
    }

    pub fn or(self, rhs: QueryExpr) -> Self {
        self.combine(BoolOp::Or, rhs)
    }

    pub fn and_not(self, rhs: QueryExpr) -> Self {
        self.combine(BoolOp::Not, rhs)
    }

    fn combine(self, operator: BoolOp, rhs: QueryExpr) -> Self {
        Self::Boolean {
            operator,
            lhs: Box::new(self),
            rhs: Box::new(rhs),
        }
    }
}

impl fmt::Display for QueryExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Term { term } => write!(f, "{term}"),
            Self::Clause {
                index,
                relation,
                term,
                boost,
            } => {
                write!(f, "{index} {relation} {term}")?;
                if !boost.is_neutral() {
                    write!(f, "^{}", boost.0)?;
                }
                Ok(())
            }
            Self::Boolean { operator, lhs, rhs } => {
                let op = match operator {
                    BoolOp::And => "AND",
                    BoolOp::Or => "OR",
                    BoolOp::Not => "NOT",
                };
                write!(f, "({lhs} {op} {rhs})")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn relations_parse_from_query_language_tokens() {
        assert_eq!("==".parse::<Relation>().unwrap(), Relation::Exact);
        assert_eq!("exact".parse::<Relation>().unwrap(), Relation::Exact);
        assert_eq!(">=".parse::<Relation>().unwrap(), Relation::Ge);
        assert_eq!(
            "within".parse::<Relation>().unwrap(),
            Relation::Other("within".into())
        );
    }

    #[test]
    fn rebuilt_expressions_are_equal_and_hash_alike() {
        let a = QueryExpr::eq("N", "true").and(QueryExpr::term("x").or(QueryExpr::all()));
        let b = QueryExpr::eq("N", "true").and(QueryExpr::term("x").or(QueryExpr::all()));
        assert_eq!(a, b);
        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_ne!(
            QueryExpr::eq("N", "true").boosted(2.0),
            QueryExpr::eq("N", "true")
        );
    }

    #[test]
    fn json_form_is_tagged() -> anyhow::Result<()> {
        let expr: QueryExpr = serde_json::from_str(
            r#"{"type":"boolean","operator":"NOT",
                "lhs":{"type":"term","term":"*"},
                "rhs":{"type":"clause","index":"M","relation":"==","term":"true","boost":2.0}}"#,
        )?;
        assert_eq!(
            expr,
            QueryExpr::all().and_not(QueryExpr::exact("M", "true").boosted(2.0))
        );
        assert_eq!(expr.to_string(), "(* NOT M exact true^2)");
        Ok(())
    }
}
