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

//! Search contracts and result models.
//!
//! [`SearchCore`] is the per-core backend seam: one independently indexed
//! collection that answers native [`CoreQuery`] sub-requests. The federation
//! dispatcher in [`federated`] fans a composed query out over these backends
//! and merges the sub-responses into a [`Response`].

pub mod federated;
pub mod memory;

pub use federated::{Federation, FederatedSearcher};

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::query::CoreQuery;
use crate::Result;

/// A facet request. Wire shape: `{fieldname, path, maxTerms}`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Facet {
    pub fieldname: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    pub max_terms: usize,
}

impl Facet {
    pub fn new(fieldname: &str, max_terms: usize) -> Self {
        Facet {
            fieldname: fieldname.to_string(),
            path: Vec::new(),
            max_terms,
        }
    }
}

/// Wire shape: `{sortBy, sortDescending, core?, type?, missingValue?}`.
/// `core` defaults to the composed query's result core; `type` and
/// `missingValue` are filled from the registry before dispatch.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortKey {
    pub sort_by: String,
    #[serde(default)]
    pub sort_descending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_value: Option<serde_json::Value>,
}

impl SortKey {
    pub fn new(sort_by: &str, sort_descending: bool) -> Self {
        SortKey {
            sort_by: sort_by.to_string(),
            sort_descending,
            core: None,
            type_: None,
            missing_value: None,
        }
    }

    pub fn for_core(mut self, core: &str) -> Self {
        self.core = Some(core.to_string());
        self
    }
}

/// A sortable value joined in from another core.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum SortValue {
    Long(i64),
    Double(f64),
    Str(String),
}

impl SortValue {
    pub fn compare(&self, other: &SortValue) -> std::cmp::Ordering {
        use SortValue::*;
        match (self, other) {
            (Str(a), Str(b)) => a.cmp(b),
            (a, b) => {
                let a = a.as_f64();
                let b = b.as_f64();
                a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
            }
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            SortValue::Long(v) => *v as f64,
            SortValue::Double(v) => *v,
            // strings compared against numbers sort last
            SortValue::Str(_) => f64::INFINITY,
        }
    }
}

/// Sort-key propagation across a core boundary: the remote core computed a
/// key-value to sort-value mapping; the home core orders its hits by looking
/// up its own key field in `values`. Keys absent from the mapping sort last.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSort {
    pub key_field: String,
    #[serde(default)]
    pub sort_descending: bool,
    pub values: HashMap<String, SortValue>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortDirective {
    Field(SortKey),
    Joined(JoinSort),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionRequest {
    pub field: String,
    pub term: String,
    pub count: usize,
}

/// One sub-request to a single core's backend.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreRequest {
    pub query: CoreQuery,
    #[serde(default)]
    pub filter_queries: Vec<CoreQuery>,
    #[serde(default)]
    pub exclude_filter_queries: Vec<CoreQuery>,
    #[serde(default)]
    pub facets: Vec<Facet>,
    #[serde(default)]
    pub drilldown_queries: Vec<(String, Vec<String>)>,
    #[serde(default)]
    pub rank_query: Option<CoreQuery>,
    #[serde(default)]
    pub rank_query_score_ratio: Option<f32>,
    #[serde(default)]
    pub sort: Vec<SortDirective>,
    #[serde(default)]
    pub start: usize,
    #[serde(default)]
    pub stop: Option<usize>,
    #[serde(default)]
    pub dedup_field: Option<String>,
    #[serde(default)]
    pub dedup_sort_field: Option<String>,
    #[serde(default)]
    pub stored_fields: Vec<String>,
    #[serde(default)]
    pub clustering: bool,
    #[serde(default)]
    pub suggestion_request: Option<SuggestionRequest>,
}

impl CoreRequest {
    pub fn new(query: CoreQuery) -> Self {
        CoreRequest {
            query,
            filter_queries: Vec::new(),
            exclude_filter_queries: Vec::new(),
            facets: Vec::new(),
            drilldown_queries: Vec::new(),
            rank_query: None,
            rank_query_score_ratio: None,
            sort: Vec::new(),
            start: 0,
            stop: None,
            dedup_field: None,
            dedup_sort_field: None,
            stored_fields: Vec::new(),
            clustering: false,
            suggestion_request: None,
        }
    }
}

/// A single hit: an identifier plus an open set of extra attributes
/// (duplicate counts, stored fields, join-propagated sort values).
/// Equality is structural over all attributes.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Hit {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_json::Value>,
}

impl Hit {
    pub fn new(id: &str) -> Self {
        Hit {
            id: id.to_string(),
            score: None,
            extras: BTreeMap::new(),
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn set_extra(&mut self, key: &str, value: serde_json::Value) {
        self.extras.insert(key.to_string(), value);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DrilldownTerm {
    pub term: String,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subterms: Option<Vec<DrilldownTerm>>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DrilldownData {
    pub fieldname: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    pub terms: Vec<DrilldownTerm>,
}

/// What one core returns for one sub-request.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreResponse {
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_with_duplicates: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_time: Option<u64>,
    #[serde(default)]
    pub hits: Vec<Hit>,
    #[serde(default)]
    pub drilldown_data: Vec<DrilldownData>,
    #[serde(default)]
    pub times: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clusters: Option<Vec<Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<BTreeMap<String, Vec<String>>>,
}

/// The merged response for one composed query.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_with_duplicates: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_time: Option<u64>,
    #[serde(default)]
    pub times: BTreeMap<String, f64>,
    #[serde(default)]
    pub hits: Vec<Hit>,
    #[serde(default)]
    pub drilldown_data: Vec<DrilldownData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clusters: Option<Vec<Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreInfo {
    pub name: String,
    pub num_docs: u64,
}

/// The contract one independently indexed core must satisfy. Implementations
/// are registered by core name with the federation dispatcher.
#[async_trait::async_trait]
pub trait SearchCore: Send + Sync {
    fn name(&self) -> &str;

    fn core_info(&self) -> CoreInfo;

    async fn execute_query(&self, request: CoreRequest) -> Result<CoreResponse>;

    /// Evaluates `query` and returns the distinct values of `key_field`
    /// among the matching documents. Used for join-key propagation.
    async fn collect_keys(&self, query: &CoreQuery, key_field: &str) -> Result<BTreeSet<String>>;

    /// Returns a key-value to sort-value mapping so a sort key defined on
    /// this core can order another core's hits.
    async fn collect_sort_values(
        &self,
        key_field: &str,
        sort_by: &str,
    ) -> Result<HashMap<String, SortValue>>;
}
