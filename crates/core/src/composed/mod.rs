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

//! The cross-core query descriptor.
//!
//! A [`ComposedQuery`] names the core whose documents become the result set
//! (`results_from`), carries one optional core query plus filter, facet,
//! rank and drilldown clauses per core, declares the join keys between cores
//! (`matches`) and at most one OR-combination of two cores (`unite`). It is
//! built once per logical request, validated, translated in place and
//! dispatched once.

pub mod assemble;

pub use assemble::{Assembler, DrilldownRestore, ExtraArguments, SearchRequest};

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use fnv::FnvHashMap;

use crate::query::{CoreQuery, Expression};
use crate::searcher::{Facet, SortKey, SuggestionRequest};
use crate::{Error, Result};

/// Whether a stored query is still the parser-facing expression tree or has
/// already been translated into a core's native representation. Conversion
/// state is explicit so an accidental second translation fails instead of
/// silently double-converting.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryState {
    Parsed(Expression),
    Translated(CoreQuery),
}

impl QueryState {
    pub fn as_parsed(&self) -> Option<&Expression> {
        match self {
            QueryState::Parsed(expr) => Some(expr),
            QueryState::Translated(_) => None,
        }
    }

    pub fn as_translated(&self) -> Option<&CoreQuery> {
        match self {
            QueryState::Parsed(_) => None,
            QueryState::Translated(query) => Some(query),
        }
    }

    pub fn expect_translated(&self, core: &str) -> Result<&CoreQuery, Error> {
        self.as_translated()
            .ok_or_else(|| Error::Validation(format!("query for core '{core}' is untranslated")))
    }
}

/// One side of a match declaration. The side whose core is the result core
/// must name its `uniqueKey`; the other side may use a non-unique `key`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MatchSpec {
    pub core: String,
    #[serde(
        rename = "uniqueKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub unique_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl MatchSpec {
    pub fn unique_key(core: &str, unique_key: &str) -> Self {
        MatchSpec {
            core: core.to_string(),
            unique_key: Some(unique_key.to_string()),
            key: None,
        }
    }

    pub fn key(core: &str, key: &str) -> Self {
        MatchSpec {
            core: core.to_string(),
            unique_key: None,
            key: Some(key.to_string()),
        }
    }

    pub fn key_name(&self) -> Option<&str> {
        self.unique_key.as_deref().or(self.key.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UniteSpec {
    pub core: String,
    pub query: QueryState,
}

impl UniteSpec {
    pub fn new(core: &str, query: Expression) -> Self {
        UniteSpec {
            core: core.to_string(),
            query: QueryState::Parsed(query),
        }
    }
}

/// "The result set is anything matching A's query OR, joined over the
/// shared key, anything matching B's query." Capped at one per composed
/// query.
#[derive(Debug, Clone, PartialEq)]
pub struct Unite {
    pub a: UniteSpec,
    pub b: UniteSpec,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UnqualifiedField {
    pub field: String,
    pub boost: f32,
}

impl UnqualifiedField {
    pub fn new(field: &str, boost: f32) -> Self {
        UnqualifiedField {
            field: field.to_string(),
            boost,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ComposedQuery {
    results_from: String,
    cores: BTreeSet<String>,
    queries: FnvHashMap<String, QueryState>,
    filter_queries: FnvHashMap<String, Vec<QueryState>>,
    exclude_filter_queries: FnvHashMap<String, Vec<QueryState>>,
    facets: FnvHashMap<String, Vec<Facet>>,
    drilldown_queries: FnvHashMap<String, Vec<(String, Vec<String>)>>,
    other_core_facet_filters: FnvHashMap<String, Vec<QueryState>>,
    rank_queries: FnvHashMap<String, QueryState>,
    matches: HashMap<(String, String), (MatchSpec, MatchSpec)>,
    unite: Option<Unite>,
    sort_keys: Vec<SortKey>,
    pub start: Option<usize>,
    pub stop: Option<usize>,
    pub dedup_field: Option<String>,
    pub dedup_sort_field: Option<String>,
    pub stored_fields: Vec<String>,
    pub clustering: bool,
    pub clustering_config: Option<serde_json::Value>,
    pub unqualified_term_fields: Option<Vec<UnqualifiedField>>,
    pub rank_query_score_ratio: Option<f32>,
    pub suggestion_request: Option<SuggestionRequest>,
}

impl ComposedQuery {
    pub fn new(results_from: &str) -> Self {
        let mut cores = BTreeSet::new();
        cores.insert(results_from.to_string());
        ComposedQuery {
            results_from: results_from.to_string(),
            cores,
            ..Default::default()
        }
    }

    pub fn results_from(&self) -> &str {
        &self.results_from
    }

    pub fn cores(&self) -> &BTreeSet<String> {
        &self.cores
    }

    fn touch_core(&mut self, core: &str) {
        if !self.cores.contains(core) {
            self.cores.insert(core.to_string());
        }
    }

    pub fn set_core_query(&mut self, core: &str, query: Expression) {
        self.touch_core(core);
        self.queries
            .insert(core.to_string(), QueryState::Parsed(query));
    }

    pub fn query_for(&self, core: &str) -> Option<&QueryState> {
        self.queries.get(core)
    }

    pub fn add_filter_query(&mut self, core: &str, query: Expression) {
        self.touch_core(core);
        self.filter_queries
            .entry(core.to_string())
            .or_default()
            .push(QueryState::Parsed(query));
    }

    pub fn filter_queries_for(&self, core: &str) -> &[QueryState] {
        self.filter_queries.get(core).map_or(&[], |v| v.as_slice())
    }

    pub fn add_exclude_filter_query(&mut self, core: &str, query: Expression) {
        self.touch_core(core);
        self.exclude_filter_queries
            .entry(core.to_string())
            .or_default()
            .push(QueryState::Parsed(query));
    }

    pub fn exclude_filter_queries_for(&self, core: &str) -> &[QueryState] {
        self.exclude_filter_queries
            .get(core)
            .map_or(&[], |v| v.as_slice())
    }

    pub fn add_facet(&mut self, core: &str, facet: Facet) {
        self.touch_core(core);
        self.facets.entry(core.to_string()).or_default().push(facet);
    }

    pub fn facets_for(&self, core: &str) -> &[Facet] {
        self.facets.get(core).map_or(&[], |v| v.as_slice())
    }

    pub fn add_drilldown_query(&mut self, core: &str, fieldname: &str, path: Vec<String>) {
        self.touch_core(core);
        self.drilldown_queries
            .entry(core.to_string())
            .or_default()
            .push((fieldname.to_string(), path));
    }

    pub fn drilldown_queries_for(&self, core: &str) -> &[(String, Vec<String>)] {
        self.drilldown_queries
            .get(core)
            .map_or(&[], |v| v.as_slice())
    }

    pub fn add_other_core_facet_filter(&mut self, core: &str, query: Expression) {
        self.touch_core(core);
        self.other_core_facet_filters
            .entry(core.to_string())
            .or_default()
            .push(QueryState::Parsed(query));
    }

    pub fn other_core_facet_filters_for(&self, core: &str) -> &[QueryState] {
        self.other_core_facet_filters
            .get(core)
            .map_or(&[], |v| v.as_slice())
    }

    pub fn set_rank_query(&mut self, core: &str, query: Expression) {
        self.touch_core(core);
        self.rank_queries
            .insert(core.to_string(), QueryState::Parsed(query));
    }

    pub fn rank_query_for(&self, core: &str) -> Option<&QueryState> {
        self.rank_queries.get(core)
    }

    pub fn rank_query_cores(&self) -> impl Iterator<Item = &str> {
        self.rank_queries.keys().map(|s| s.as_str())
    }

    /// Declares the join key between two cores. One side must be the result
    /// core and that side must name a `uniqueKey`. Re-declaring an existing
    /// pair overwrites the previous specs.
    pub fn add_match(&mut self, a: MatchSpec, b: MatchSpec) -> Result<(), Error> {
        let result_side = if a.core == self.results_from {
            &a
        } else if b.core == self.results_from {
            &b
        } else {
            return Err(Error::MatchOutsideResultCore(self.results_from.clone()));
        };
        if result_side.unique_key.is_none() {
            return Err(Error::MissingUniqueKey(self.results_from.clone()));
        }
        self.insert_match(a, b);
        Ok(())
    }

    /// A match that connects two non-result cores, used only to complete a
    /// join path for facet or unite purposes. Skips the result-core checks.
    pub fn add_optional_match(&mut self, a: MatchSpec, b: MatchSpec) {
        self.insert_match(a, b);
    }

    fn insert_match(&mut self, a: MatchSpec, b: MatchSpec) {
        self.touch_core(&a.core);
        self.touch_core(&b.core);
        self.matches.remove(&(b.core.clone(), a.core.clone()));
        self.matches
            .insert((a.core.clone(), b.core.clone()), (a, b));
    }

    /// The join key field of `core` in its match with `other_core`. For the
    /// self-join case (`core == other_core`) any spec declared for the core
    /// is accepted.
    pub fn key_name(&self, core: &str, other_core: &str) -> Result<&str, Error> {
        let no_match = || Error::NoMatch(core.to_string(), other_core.to_string());

        if core == other_core {
            return self
                .matches
                .values()
                .flat_map(|(a, b)| [a, b])
                .find(|spec| spec.core == core)
                .and_then(|spec| spec.key_name())
                .ok_or_else(no_match);
        }

        let (a, b) = self
            .matches
            .get(&(core.to_string(), other_core.to_string()))
            .or_else(|| self.matches.get(&(other_core.to_string(), core.to_string())))
            .ok_or_else(no_match)?;

        [a, b]
            .into_iter()
            .find(|spec| spec.core == core)
            .and_then(|spec| spec.key_name())
            .ok_or_else(no_match)
    }

    /// Adds the unite. A composed query holds at most one; a second call is
    /// an error.
    pub fn add_unite(&mut self, a: UniteSpec, b: UniteSpec) -> Result<(), Error> {
        if self.unite.is_some() {
            return Err(Error::UniteAlreadySet);
        }
        self.touch_core(&a.core);
        self.touch_core(&b.core);
        self.unite = Some(Unite { a, b });
        Ok(())
    }

    pub fn unite(&self) -> Option<&Unite> {
        self.unite.as_ref()
    }

    pub fn add_sort_key(&mut self, sort_key: SortKey) {
        if let Some(core) = &sort_key.core {
            let core = core.clone();
            self.touch_core(&core);
        }
        self.sort_keys.push(sort_key);
    }

    pub fn sort_keys(&self) -> &[SortKey] {
        &self.sort_keys
    }

    pub fn sort_keys_mut(&mut self) -> &mut [SortKey] {
        &mut self.sort_keys
    }

    /// Every core referenced by any clause must have a match path, directly
    /// or transitively, back to the result core.
    pub fn validate(&self) -> Result<(), Error> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for (a, b) in self.matches.keys() {
            adjacency.entry(a.as_str()).or_default().push(b.as_str());
            adjacency.entry(b.as_str()).or_default().push(a.as_str());
        }

        let mut reached: BTreeSet<&str> = BTreeSet::new();
        let mut queue = VecDeque::from([self.results_from.as_str()]);
        while let Some(core) = queue.pop_front() {
            if !reached.insert(core) {
                continue;
            }
            for next in adjacency.get(core).into_iter().flatten() {
                queue.push_back(next);
            }
        }

        for core in &self.cores {
            if !reached.contains(core.as_str()) {
                return Err(Error::Validation(format!(
                    "no match set for cores ({}, {})",
                    self.results_from, core
                )));
            }
        }
        Ok(())
    }

    /// True when every stored query has been translated to its core's
    /// native representation.
    pub fn fully_translated(&self) -> bool {
        self.all_states()
            .all(|state| matches!(state, QueryState::Translated(_)))
    }

    fn all_states(&self) -> impl Iterator<Item = &QueryState> {
        self.queries
            .values()
            .chain(self.filter_queries.values().flatten())
            .chain(self.exclude_filter_queries.values().flatten())
            .chain(self.other_core_facet_filters.values().flatten())
            .chain(self.rank_queries.values())
            .chain(
                self.unite
                    .iter()
                    .flat_map(|unite| [&unite.a.query, &unite.b.query]),
            )
    }

    /// Applies per-core translators in place: core queries, filters,
    /// exclude filters, rank queries, other-core facet filters and unite
    /// sub-queries. Filter-type entries with a negated root keep their
    /// negation as a single-MUST_NOT boolean so the dispatcher applies them
    /// as excludes. Translating an already translated entry is an error.
    pub fn convert_with<F>(&mut self, mut convert: F) -> Result<()>
    where
        F: FnMut(&str, &Expression, &ComposedQuery) -> Result<CoreQuery>,
    {
        let snapshot = self.clone();

        for (core, state) in &mut self.queries {
            *state = translate_state(core, state, &snapshot, &mut convert, false)?;
        }
        for (core, states) in &mut self.filter_queries {
            for state in states {
                *state = translate_state(core, state, &snapshot, &mut convert, true)?;
            }
        }
        for (core, states) in &mut self.exclude_filter_queries {
            for state in states {
                *state = translate_state(core, state, &snapshot, &mut convert, true)?;
            }
        }
        for (core, states) in &mut self.other_core_facet_filters {
            for state in states {
                *state = translate_state(core, state, &snapshot, &mut convert, true)?;
            }
        }
        for (core, state) in &mut self.rank_queries {
            *state = translate_state(core, state, &snapshot, &mut convert, false)?;
        }
        if let Some(unite) = &mut self.unite {
            unite.a.query =
                translate_state(&unite.a.core, &unite.a.query, &snapshot, &mut convert, false)?;
            unite.b.query =
                translate_state(&unite.b.core, &unite.b.query, &snapshot, &mut convert, false)?;
        }

        Ok(())
    }

    pub fn to_dict(&self) -> serde_json::Value {
        let dict = ComposedQueryDict::from(self);
        serde_json::to_value(dict).expect("composed query dict is always serializable")
    }

    pub fn from_dict(value: &serde_json::Value) -> Result<Self> {
        let dict: ComposedQueryDict = serde_json::from_value(value.clone())?;
        dict.try_into()
    }
}

fn translate_state<F>(
    core: &str,
    state: &QueryState,
    snapshot: &ComposedQuery,
    convert: &mut F,
    keep_root_negation: bool,
) -> Result<QueryState>
where
    F: FnMut(&str, &Expression, &ComposedQuery) -> Result<CoreQuery>,
{
    match state {
        QueryState::Parsed(expr) => {
            if keep_root_negation && expr.must_not {
                let mut inner = expr.clone();
                inner.must_not = false;
                Ok(QueryState::Translated(CoreQuery::exclude(convert(
                    core, &inner, snapshot,
                )?)))
            } else {
                Ok(QueryState::Translated(convert(core, expr, snapshot)?))
            }
        }
        QueryState::Translated(_) => Err(Error::AlreadyTranslated(core.to_string()).into()),
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct UniteDict {
    #[serde(rename = "A")]
    a: (String, QueryState),
    #[serde(rename = "B")]
    b: (String, QueryState),
}

/// The serialized (plain nested dict) form: per-core maps keyed by core
/// name, `_matches` re-keyed as `"coreA->coreB"` strings, unites as nested
/// A/B pairs and cores as a list.
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComposedQueryDict {
    results_from: String,
    #[serde(rename = "_cores")]
    cores: Vec<String>,
    #[serde(rename = "_queries")]
    queries: BTreeMap<String, QueryState>,
    #[serde(rename = "_filterQueries")]
    filter_queries: BTreeMap<String, Vec<QueryState>>,
    #[serde(rename = "_excludeFilterQueries")]
    exclude_filter_queries: BTreeMap<String, Vec<QueryState>>,
    #[serde(rename = "_facets")]
    facets: BTreeMap<String, Vec<Facet>>,
    #[serde(rename = "_drilldownQueries")]
    drilldown_queries: BTreeMap<String, Vec<(String, Vec<String>)>>,
    #[serde(rename = "_otherCoreFacetFilters")]
    other_core_facet_filters: BTreeMap<String, Vec<QueryState>>,
    #[serde(rename = "_rankQueries")]
    rank_queries: BTreeMap<String, QueryState>,
    #[serde(rename = "_matches")]
    matches: BTreeMap<String, (MatchSpec, MatchSpec)>,
    #[serde(rename = "_unites")]
    unites: Vec<UniteDict>,
    #[serde(rename = "_sortKeys")]
    sort_keys: Vec<SortKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dedup_field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dedup_sort_field: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    stored_fields: Vec<String>,
    #[serde(default)]
    clustering: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    clustering_config: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unqualified_term_fields: Option<Vec<UnqualifiedField>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rank_query_score_ratio: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion_request: Option<SuggestionRequest>,
}

impl From<&ComposedQuery> for ComposedQueryDict {
    fn from(cq: &ComposedQuery) -> Self {
        ComposedQueryDict {
            results_from: cq.results_from.clone(),
            cores: cq.cores.iter().cloned().collect(),
            queries: to_btree(&cq.queries),
            filter_queries: to_btree(&cq.filter_queries),
            exclude_filter_queries: to_btree(&cq.exclude_filter_queries),
            facets: to_btree(&cq.facets),
            drilldown_queries: to_btree(&cq.drilldown_queries),
            other_core_facet_filters: to_btree(&cq.other_core_facet_filters),
            rank_queries: to_btree(&cq.rank_queries),
            matches: cq
                .matches
                .iter()
                .map(|((a, b), specs)| (format!("{a}->{b}"), specs.clone()))
                .collect(),
            unites: cq
                .unite
                .iter()
                .map(|unite| UniteDict {
                    a: (unite.a.core.clone(), unite.a.query.clone()),
                    b: (unite.b.core.clone(), unite.b.query.clone()),
                })
                .collect(),
            sort_keys: cq.sort_keys.clone(),
            start: cq.start,
            stop: cq.stop,
            dedup_field: cq.dedup_field.clone(),
            dedup_sort_field: cq.dedup_sort_field.clone(),
            stored_fields: cq.stored_fields.clone(),
            clustering: cq.clustering,
            clustering_config: cq.clustering_config.clone(),
            unqualified_term_fields: cq.unqualified_term_fields.clone(),
            rank_query_score_ratio: cq.rank_query_score_ratio,
            suggestion_request: cq.suggestion_request.clone(),
        }
    }
}

impl TryFrom<ComposedQueryDict> for ComposedQuery {
    type Error = anyhow::Error;

    fn try_from(dict: ComposedQueryDict) -> Result<Self> {
        let mut matches = HashMap::new();
        for (pair, specs) in dict.matches {
            let (a, b) = pair
                .split_once("->")
                .ok_or_else(|| Error::Validation(format!("malformed match key '{pair}'")))?;
            matches.insert((a.to_string(), b.to_string()), specs);
        }

        let unite = match dict.unites.into_iter().next() {
            Some(unite_dict) => Some(Unite {
                a: UniteSpec {
                    core: unite_dict.a.0,
                    query: unite_dict.a.1,
                },
                b: UniteSpec {
                    core: unite_dict.b.0,
                    query: unite_dict.b.1,
                },
            }),
            None => None,
        };

        Ok(ComposedQuery {
            results_from: dict.results_from,
            cores: dict.cores.into_iter().collect(),
            queries: from_btree(dict.queries),
            filter_queries: from_btree(dict.filter_queries),
            exclude_filter_queries: from_btree(dict.exclude_filter_queries),
            facets: from_btree(dict.facets),
            drilldown_queries: from_btree(dict.drilldown_queries),
            other_core_facet_filters: from_btree(dict.other_core_facet_filters),
            rank_queries: from_btree(dict.rank_queries),
            matches,
            unite,
            sort_keys: dict.sort_keys,
            start: dict.start,
            stop: dict.stop,
            dedup_field: dict.dedup_field,
            dedup_sort_field: dict.dedup_sort_field,
            stored_fields: dict.stored_fields,
            clustering: dict.clustering,
            clustering_config: dict.clustering_config,
            unqualified_term_fields: dict.unqualified_term_fields,
            rank_query_score_ratio: dict.rank_query_score_ratio,
            suggestion_request: dict.suggestion_request,
        })
    }
}

fn to_btree<V: Clone>(map: &FnvHashMap<String, V>) -> BTreeMap<String, V> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn from_btree<V>(map: BTreeMap<String, V>) -> FnvHashMap<String, V> {
    map.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::cql;
    use pretty_assertions::assert_eq;

    fn expr(q: &str) -> Expression {
        cql::parse(q).unwrap()
    }

    #[test]
    fn results_from_is_always_a_core() {
        let cq = ComposedQuery::new("main");
        assert!(cq.cores().contains("main"));
    }

    #[test]
    fn add_match_requires_unique_key_on_result_side() {
        let mut cq = ComposedQuery::new("main");
        let err = cq
            .add_match(
                MatchSpec::key("main", "__key__.field"),
                MatchSpec::key("main2", "__key__.field"),
            )
            .unwrap_err();
        assert!(matches!(err, Error::MissingUniqueKey(_)));
    }

    #[test]
    fn add_match_must_touch_result_core() {
        let mut cq = ComposedQuery::new("main");
        let err = cq
            .add_match(
                MatchSpec::unique_key("main2", "__key__.field"),
                MatchSpec::key("main3", "__key__.field"),
            )
            .unwrap_err();
        assert!(matches!(err, Error::MatchOutsideResultCore(_)));

        // optional matches complete a chain without touching the result core
        cq.add_optional_match(
            MatchSpec::key("main2", "__key__.field"),
            MatchSpec::key("main3", "__key__.field"),
        );
        assert!(cq.cores().contains("main3"));
    }

    #[test]
    fn add_match_overwrites_existing_pair() {
        let mut cq = ComposedQuery::new("main");
        cq.add_match(
            MatchSpec::unique_key("main", "__key__.field"),
            MatchSpec::key("main2", "__key__.field"),
        )
        .unwrap();
        // re-declare in reversed order with a different key
        cq.add_match(
            MatchSpec::key("main2", "__key__.other"),
            MatchSpec::unique_key("main", "__key__.field"),
        )
        .unwrap();

        assert_eq!(cq.key_name("main2", "main").unwrap(), "__key__.other");
        assert_eq!(cq.matches.len(), 1);
    }

    #[test]
    fn key_name_looks_up_both_directions_and_self_join() {
        let mut cq = ComposedQuery::new("main");
        cq.add_match(
            MatchSpec::unique_key("main", "__key__.field"),
            MatchSpec::key("main2", "__key__.other"),
        )
        .unwrap();

        assert_eq!(cq.key_name("main", "main2").unwrap(), "__key__.field");
        assert_eq!(cq.key_name("main2", "main").unwrap(), "__key__.other");
        assert_eq!(cq.key_name("main", "main").unwrap(), "__key__.field");
        assert!(matches!(
            cq.key_name("main", "absent"),
            Err(Error::NoMatch(_, _))
        ));
    }

    #[test]
    fn second_unite_is_rejected() {
        let mut cq = ComposedQuery::new("main");
        cq.add_unite(
            UniteSpec::new("main", expr("f=a")),
            UniteSpec::new("main2", expr("g=b")),
        )
        .unwrap();
        let err = cq
            .add_unite(
                UniteSpec::new("main", expr("f=c")),
                UniteSpec::new("main2", expr("g=d")),
            )
            .unwrap_err();
        assert!(matches!(err, Error::UniteAlreadySet));
    }

    #[test]
    fn validate_requires_a_match_path() {
        let mut cq = ComposedQuery::new("main");
        cq.add_filter_query("main2", expr("a=b"));
        let err = cq.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid composed query: no match set for cores (main, main2)"
        );

        cq.add_match(
            MatchSpec::unique_key("main", "__key__.field"),
            MatchSpec::key("main2", "__key__.field"),
        )
        .unwrap();
        cq.validate().unwrap();
    }

    #[test]
    fn validate_accepts_transitive_chains() {
        let mut cq = ComposedQuery::new("main");
        cq.add_match(
            MatchSpec::unique_key("main", "__key__.field"),
            MatchSpec::key("main2", "__key__.field"),
        )
        .unwrap();
        cq.add_optional_match(
            MatchSpec::key("main2", "__key__.field"),
            MatchSpec::key("main3", "__key__.field"),
        );
        cq.add_facet("main3", Facet::new("untokenized.field", 10));
        cq.validate().unwrap();

        // breaking the middle link makes main3 unreachable
        let mut broken = cq.clone();
        broken
            .matches
            .retain(|(a, b), _| !(a == "main2" && b == "main3"));
        let err = broken.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid composed query: no match set for cores (main, main3)"
        );
    }

    #[test]
    fn dict_round_trip_is_lossless() {
        let mut cq = ComposedQuery::new("main");
        cq.set_core_query("main", expr("*"));
        cq.add_match(
            MatchSpec::unique_key("main", "__key__.field"),
            MatchSpec::key("main2", "__key__.field"),
        )
        .unwrap();
        cq.add_filter_query("main", expr("field2=value0 OR field2=value1"));
        cq.add_filter_query("main2", expr("a=b"));
        cq.add_exclude_filter_query("main2", expr("c=d"));
        cq.add_facet(
            "main2",
            Facet {
                fieldname: "untokenized.field2".to_string(),
                path: vec![],
                max_terms: 5,
            },
        );
        cq.add_drilldown_query("main", "cat", vec!["books".to_string()]);
        cq.add_other_core_facet_filter("main2", expr("e=f"));
        cq.set_rank_query("main2", expr("g=h"));
        cq.add_unite(
            UniteSpec::new("main", expr("f=a")),
            UniteSpec::new("main2", expr("g=b")),
        )
        .unwrap();
        cq.add_sort_key(SortKey::new("field1", true).for_core("main2"));
        cq.start = Some(0);
        cq.stop = Some(100);
        cq.dedup_field = Some("__key__.field".to_string());
        cq.stored_fields = vec!["field1".to_string()];
        cq.clustering = true;
        cq.unqualified_term_fields = Some(vec![UnqualifiedField::new("__all__", 1.0)]);
        cq.rank_query_score_ratio = Some(0.5);

        let dict = cq.to_dict();
        assert!(dict["_matches"]["main->main2"].is_array());
        assert_eq!(dict["_unites"][0]["A"][0], "main");
        assert_eq!(dict["_cores"], serde_json::json!(["main", "main2"]));

        let back = ComposedQuery::from_dict(&dict).unwrap();
        assert_eq!(back, cq);
    }

    #[test]
    fn convert_with_translates_everything_once() {
        let mut cq = ComposedQuery::new("main");
        cq.set_core_query("main", expr("f=v"));
        cq.add_filter_query("main", expr("a=b").negated());

        cq.convert_with(|_core, e, _cq| {
            let leaf = e.as_leaf().unwrap();
            Ok(CoreQuery::term(leaf.index.as_deref().unwrap(), &leaf.term))
        })
        .unwrap();
        assert!(cq.fully_translated());

        // the negated filter kept its negation as a single-MUST_NOT boolean
        let filter = cq.filter_queries_for("main")[0].as_translated().unwrap();
        assert_eq!(filter.as_exclude(), Some(&CoreQuery::term("a", "b")));

        // a second conversion is refused
        let err = cq
            .convert_with(|_, _, _| Ok(CoreQuery::MatchAll))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<Error>().unwrap().to_string(),
            Error::AlreadyTranslated("main".to_string()).to_string()
        );
    }
}
