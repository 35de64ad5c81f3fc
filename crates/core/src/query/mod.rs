// Polycore is an open source multi-core search federation layer.
// Copyright (C) 2024 Polycore
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Query models.
//!
//! [`expr::Expression`] is the parser-facing boolean tree; [`CoreQuery`] is
//! the native single-core query representation sent to a backend. The
//! translator in [`translate`] converts the former into the latter for one
//! core at a time.

pub mod cql;
pub mod expr;
pub mod filter_extract;
pub mod translate;

use std::collections::BTreeSet;

pub use expr::{BoolOp, Expression, Leaf, Node, Relation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Occur {
    Must,
    Should,
    MustNot,
}

/// A bound of a range query. Untagged so that numeric bounds serialize as
/// plain JSON numbers on the wire.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum RangeValue {
    Long(i64),
    Double(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BooleanClause {
    pub occur: Occur,
    pub query: CoreQuery,
}

/// The native query representation understood by a single search core.
///
/// Serializes to tagged clause dictionaries (term, boolean, range, prefix,
/// phrase, drilldown) on the wire. `Relational` marks
/// a clause that belongs to a different core and must be resolved by the
/// federation dispatcher via the named join key; `KeyFilter` is the resolved
/// form the dispatcher substitutes before dispatch.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CoreQuery {
    MatchAll,
    Term {
        field: String,
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        boost: Option<f32>,
    },
    DrillDown {
        field: String,
        path: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        boost: Option<f32>,
    },
    Range {
        field: String,
        lower: Option<RangeValue>,
        upper: Option<RangeValue>,
        include_lower: bool,
        include_upper: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        boost: Option<f32>,
    },
    Prefix {
        field: String,
        prefix: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        boost: Option<f32>,
    },
    Wildcard {
        field: String,
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        boost: Option<f32>,
    },
    Phrase {
        field: String,
        terms: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        boost: Option<f32>,
    },
    Boolean {
        clauses: Vec<BooleanClause>,
    },
    Relational {
        core: String,
        key: String,
        query: Box<CoreQuery>,
    },
    KeyFilter {
        field: String,
        keys: BTreeSet<String>,
    },
}

impl CoreQuery {
    pub fn term(field: &str, value: &str) -> Self {
        CoreQuery::Term {
            field: field.to_string(),
            value: value.to_string(),
            boost: None,
        }
    }

    pub fn boolean(clauses: Vec<(Occur, CoreQuery)>) -> Self {
        CoreQuery::Boolean {
            clauses: clauses
                .into_iter()
                .map(|(occur, query)| BooleanClause { occur, query })
                .collect(),
        }
    }

    /// A query that cannot match anything because it has no surviving
    /// clauses. Parents elide such children instead of dispatching them.
    pub fn is_degenerate(&self) -> bool {
        match self {
            CoreQuery::Boolean { clauses } => clauses.is_empty(),
            CoreQuery::Phrase { terms, .. } => terms.is_empty(),
            _ => false,
        }
    }

    /// A boolean that consists of exactly one MUST_NOT clause. Extracted
    /// foreign-core filters keep their negation in this shape so the
    /// dispatcher can apply them as key excludes rather than joining the
    /// complement.
    pub fn as_exclude(&self) -> Option<&CoreQuery> {
        match self {
            CoreQuery::Boolean { clauses } => match clauses.as_slice() {
                [BooleanClause {
                    occur: Occur::MustNot,
                    query,
                }] => Some(query),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn exclude(query: CoreQuery) -> Self {
        CoreQuery::boolean(vec![(Occur::MustNot, query)])
    }
}
