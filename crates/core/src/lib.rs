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

//! Main library for Polycore.
//!
//! Polycore federates independent full-text search cores behind a single
//! logical query. A caller-facing query is split into per-core sub-queries,
//! joined on shared key fields, dispatched to the per-core backends and the
//! sub-responses are merged back into one response with the caller's facet
//! ordering restored.

#![warn(clippy::too_many_lines)]

use thiserror::Error;

pub mod clustering;
pub mod composed;
pub mod config;
pub mod query;
pub mod schema;
pub mod searcher;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to parse query: {0}")]
    QueryParse(String),

    #[error("Unsupported query relation '{relation}' for field '{field}'")]
    UnsupportedQueryRelation { relation: String, field: String },

    #[error("Query expression too complex to separate across cores")]
    TooComplexQueryExpression,

    #[error("No match set for cores ({0}, {1})")]
    NoMatch(String, String),

    #[error("Invalid composed query: {0}")]
    Validation(String),

    #[error("Match spec for result core '{0}' must declare a uniqueKey")]
    MissingUniqueKey(String),

    #[error("Match must connect to the result core '{0}'")]
    MatchOutsideResultCore(String),

    #[error("A composed query can hold at most one unite")]
    UniteAlreadySet,

    #[error("Query for core '{0}' has already been translated")]
    AlreadyTranslated(String),

    #[error("Unknown core '{0}'")]
    UnknownCore(String),

    #[error("Backend for core '{core}' failed: {source}")]
    Backend {
        core: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
