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

//! In-memory [`SearchCore`] backend.
//!
//! Evaluates native queries by scanning documents. Used as the reference
//! backend in the integration tests and small enough deployments; the
//! production seam is the trait, not this implementation.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use itertools::Itertools;

use super::{
    CoreInfo, CoreRequest, CoreResponse, DrilldownData, DrilldownTerm, Facet, Hit, JoinSort,
    SearchCore, SortDirective, SortKey, SortValue,
};
use crate::clustering::{ClusterDoc, Clusterer};
use crate::config::ClusteringConfig;
use crate::query::{CoreQuery, Occur, RangeValue};
use crate::schema::FieldRegistry;
use crate::Result;

#[derive(Debug, Clone, Default)]
pub struct Document {
    pub id: String,
    fields: BTreeMap<String, Vec<serde_json::Value>>,
}

impl Document {
    pub fn new(id: &str) -> Self {
        Document {
            id: id.to_string(),
            fields: BTreeMap::new(),
        }
    }

    pub fn field(mut self, name: &str, value: serde_json::Value) -> Self {
        self.fields.entry(name.to_string()).or_default().push(value);
        self
    }

    fn string_values(&self, field: &str) -> impl Iterator<Item = &str> {
        self.fields
            .get(field)
            .into_iter()
            .flatten()
            .filter_map(|v| v.as_str())
    }

    fn numeric_value(&self, field: &str) -> Option<f64> {
        self.fields.get(field)?.iter().find_map(|v| v.as_f64())
    }

    /// Drilldown paths: an array value is a path, a string a single
    /// segment.
    fn path_values(&self, field: &str) -> Vec<Vec<String>> {
        self.fields
            .get(field)
            .into_iter()
            .flatten()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(vec![s.clone()]),
                serde_json::Value::Array(segments) => Some(
                    segments
                        .iter()
                        .filter_map(|s| s.as_str().map(str::to_string))
                        .collect(),
                ),
                _ => None,
            })
            .collect()
    }

    fn sort_value(&self, field: &str) -> Option<SortValue> {
        let values = self.fields.get(field)?;
        values.iter().find_map(|v| {
            if let Some(n) = v.as_i64() {
                Some(SortValue::Long(n))
            } else if let Some(n) = v.as_f64() {
                Some(SortValue::Double(n))
            } else {
                v.as_str().map(|s| SortValue::Str(s.to_string()))
            }
        })
    }
}

pub struct MemoryCore {
    name: String,
    registry: Arc<FieldRegistry>,
    docs: Vec<Document>,
    clustering: ClusteringConfig,
}

impl MemoryCore {
    pub fn new(name: &str, registry: Arc<FieldRegistry>) -> Self {
        MemoryCore {
            name: name.to_string(),
            registry,
            docs: Vec::new(),
            clustering: ClusteringConfig::default(),
        }
    }

    pub fn with_clustering(mut self, clustering: ClusteringConfig) -> Self {
        self.clustering = clustering;
        self
    }

    pub fn add(&mut self, doc: Document) -> &mut Self {
        self.docs.push(doc);
        self
    }

    fn matches(&self, doc: &Document, query: &CoreQuery) -> Result<bool> {
        Ok(match query {
            CoreQuery::MatchAll => true,
            CoreQuery::Term { field, value, .. } => {
                if self.registry.is_tokenized(field) {
                    doc.string_values(field)
                        .any(|v| self.registry.stem(v).iter().any(|t| t == value))
                } else {
                    doc.string_values(field).any(|v| v == value)
                }
            }
            CoreQuery::Phrase { field, terms, .. } => doc.string_values(field).any(|v| {
                let tokens = self.registry.tokenize(v);
                tokens.windows(terms.len()).any(|w| w == terms.as_slice())
            }),
            CoreQuery::Prefix { field, prefix, .. } => doc
                .string_values(field)
                .any(|v| self.registry.tokenize(v).iter().any(|t| t.starts_with(prefix))),
            CoreQuery::Wildcard { field, pattern, .. } => {
                let pattern = wildcard_pattern(pattern)?;
                doc.string_values(field)
                    .any(|v| self.registry.tokenize(v).iter().any(|t| pattern.is_match(t)))
            }
            CoreQuery::Range {
                field,
                lower,
                upper,
                include_lower,
                include_upper,
                ..
            } => {
                if self.registry.is_numeric(field) {
                    match doc.numeric_value(field) {
                        Some(value) => {
                            in_numeric_range(value, lower, upper, *include_lower, *include_upper)
                        }
                        None => false,
                    }
                } else {
                    doc.string_values(field)
                        .any(|v| in_string_range(v, lower, upper, *include_lower, *include_upper))
                }
            }
            CoreQuery::DrillDown { field, path, .. } => doc
                .path_values(field)
                .iter()
                .any(|stored| stored.starts_with(path)),
            CoreQuery::KeyFilter { field, keys } => {
                doc.string_values(field).any(|v| keys.contains(v))
            }
            CoreQuery::Boolean { clauses } => {
                let mut has_positive = false;
                let mut should_hit = false;
                let mut has_should = false;
                for clause in clauses {
                    let hit = self.matches(doc, &clause.query)?;
                    match clause.occur {
                        Occur::Must => {
                            has_positive = true;
                            if !hit {
                                return Ok(false);
                            }
                        }
                        Occur::MustNot => {
                            if hit {
                                return Ok(false);
                            }
                        }
                        Occur::Should => {
                            has_should = true;
                            should_hit |= hit;
                        }
                    }
                }
                // with no MUST clauses at least one SHOULD has to hit
                has_positive || !has_should || should_hit
            }
            CoreQuery::Relational { core, .. } => {
                return Err(anyhow!(
                    "relational query for core '{core}' reached a backend unresolved"
                ));
            }
        })
    }

    fn matching_docs(&self, request: &CoreRequest) -> Result<Vec<&Document>> {
        let mut matching = Vec::new();
        'docs: for doc in &self.docs {
            if !self.matches(doc, &request.query)? {
                continue;
            }
            for filter in &request.filter_queries {
                if !self.matches(doc, filter)? {
                    continue 'docs;
                }
            }
            for exclude in &request.exclude_filter_queries {
                if self.matches(doc, exclude)? {
                    continue 'docs;
                }
            }
            for (field, path) in &request.drilldown_queries {
                let query = CoreQuery::DrillDown {
                    field: field.clone(),
                    path: path.clone(),
                    boost: None,
                };
                if !self.matches(doc, &query)? {
                    continue 'docs;
                }
            }
            matching.push(doc);
        }
        Ok(matching)
    }

    /// Collapses docs sharing the dedup field value; the duplicate with the
    /// highest dedup-sort value survives and carries the group size.
    fn dedup<'a>(
        &self,
        docs: Vec<&'a Document>,
        field: &str,
        sort_field: Option<&str>,
    ) -> Vec<(&'a Document, Option<u64>)> {
        let mut groups: Vec<(Option<&str>, Vec<&Document>)> = Vec::new();
        for doc in docs {
            let value = doc.string_values(field).next();
            match value {
                Some(value) => {
                    match groups
                        .iter_mut()
                        .find(|(v, _)| *v == Some(value))
                    {
                        Some((_, members)) => members.push(doc),
                        None => groups.push((Some(value), vec![doc])),
                    }
                }
                // docs without the field never collapse
                None => groups.push((None, vec![doc])),
            }
        }

        groups
            .into_iter()
            .map(|(_, members)| {
                let count = members.len() as u64;
                let representative = match sort_field {
                    Some(sort_field) => members
                        .into_iter()
                        .max_by(|a, b| {
                            let a = a.sort_value(sort_field);
                            let b = b.sort_value(sort_field);
                            match (a, b) {
                                (Some(a), Some(b)) => a.compare(&b),
                                (Some(_), None) => std::cmp::Ordering::Greater,
                                (None, Some(_)) => std::cmp::Ordering::Less,
                                (None, None) => std::cmp::Ordering::Equal,
                            }
                        })
                        .unwrap_or_else(|| unreachable!("groups are never empty")),
                    None => members[0],
                };
                (representative, (count > 1).then_some(count))
            })
            .collect()
    }

    fn sort_docs(&self, docs: &mut [(&Document, Option<u64>)], sort: &[SortDirective]) {
        docs.sort_by(|(a, _), (b, _)| {
            for directive in sort {
                let ordering = match directive {
                    SortDirective::Field(key) => compare_by_field(a, b, key),
                    SortDirective::Joined(join) => compare_joined(a, b, join),
                };
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
            a.id.cmp(&b.id)
        });
    }

    fn facet_data(&self, docs: &[(&Document, Option<u64>)], facet: &Facet) -> DrilldownData {
        let mut counts: HashMap<String, u64> = HashMap::new();
        for (doc, _) in docs {
            // a doc counts once per distinct term
            let mut seen: HashSet<String> = HashSet::new();
            if self.registry.is_drilldown(&facet.fieldname) {
                for stored in doc.path_values(&facet.fieldname) {
                    if stored.len() > facet.path.len() && stored.starts_with(&facet.path) {
                        let term = stored[facet.path.len()].clone();
                        if seen.insert(term.clone()) {
                            *counts.entry(term).or_default() += 1;
                        }
                    }
                }
            } else {
                for value in doc.string_values(&facet.fieldname) {
                    if seen.insert(value.to_string()) {
                        *counts.entry(value.to_string()).or_default() += 1;
                    }
                }
            }
        }

        let terms = counts
            .into_iter()
            .sorted_by(|(at, ac), (bt, bc)| bc.cmp(ac).then_with(|| at.cmp(bt)))
            .take(facet.max_terms)
            .map(|(term, count)| DrilldownTerm {
                term,
                count,
                subterms: None,
            })
            .collect();

        DrilldownData {
            fieldname: facet.fieldname.clone(),
            path: facet.path.clone(),
            terms,
        }
    }

    fn score(&self, doc: &Document, request: &CoreRequest) -> Result<f64> {
        let mut score = 1.0;
        if let Some(rank_query) = &request.rank_query {
            if self.matches(doc, rank_query)? {
                score += f64::from(request.rank_query_score_ratio.unwrap_or(1.0));
            }
        }
        Ok(score)
    }

    fn suggestions(
        &self,
        request: &CoreRequest,
    ) -> Option<BTreeMap<String, Vec<String>>> {
        let suggestion = request.suggestion_request.as_ref()?;
        let first = suggestion.term.chars().next();
        let mut terms: BTreeSet<String> = BTreeSet::new();
        for doc in &self.docs {
            for value in doc.string_values(&suggestion.field) {
                for token in self.registry.tokenize(value) {
                    if token != suggestion.term && first.is_some_and(|c| token.starts_with(c)) {
                        terms.insert(token);
                    }
                }
            }
        }
        let mut result = BTreeMap::new();
        result.insert(
            suggestion.term.clone(),
            terms.into_iter().take(suggestion.count).collect(),
        );
        Some(result)
    }

    fn cluster(&self, docs: &[(&Document, Option<u64>)]) -> Vec<Vec<String>> {
        let clusterer = Clusterer::new(&self.clustering);
        let cluster_docs = docs.iter().map(|(doc, _)| {
            let fields = if self.clustering.fields.is_empty() {
                doc.fields.keys().cloned().collect::<Vec<_>>()
            } else {
                self.clustering.fields.clone()
            };
            let terms = fields
                .into_iter()
                .map(|field| {
                    let tokens: HashSet<String> = doc
                        .string_values(&field)
                        .flat_map(|v| self.registry.tokenize(v))
                        .collect();
                    (field, tokens)
                })
                .collect();
            ClusterDoc::new(&doc.id, terms)
        });
        clusterer.cluster(cluster_docs)
    }
}

#[async_trait::async_trait]
impl SearchCore for MemoryCore {
    fn name(&self) -> &str {
        &self.name
    }

    fn core_info(&self) -> CoreInfo {
        CoreInfo {
            name: self.name.clone(),
            num_docs: self.docs.len() as u64,
        }
    }

    async fn execute_query(&self, request: CoreRequest) -> Result<CoreResponse> {
        let start_time = std::time::Instant::now();
        let matching = self.matching_docs(&request)?;
        let total_before_dedup = matching.len() as u64;

        let mut docs: Vec<(&Document, Option<u64>)> = match &request.dedup_field {
            Some(field) => self.dedup(matching, field, request.dedup_sort_field.as_deref()),
            None => matching.into_iter().map(|doc| (doc, None)).collect(),
        };
        let total = docs.len() as u64;
        let total_with_duplicates =
            (total_before_dedup != total).then_some(total_before_dedup);

        if request.sort.is_empty() {
            // default order: score descending, id ascending
            let mut scored: Vec<(f64, (&Document, Option<u64>))> = Vec::with_capacity(docs.len());
            for entry in docs {
                scored.push((self.score(entry.0, &request)?, entry));
            }
            scored.sort_by(|(sa, (a, _)), (sb, (b, _))| {
                sb.partial_cmp(sa)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });
            docs = scored.into_iter().map(|(_, entry)| entry).collect();
        } else {
            self.sort_docs(&mut docs, &request.sort);
        }

        let drilldown_data = request
            .facets
            .iter()
            .map(|facet| self.facet_data(&docs, facet))
            .collect();

        let clusters = request.clustering.then(|| self.cluster(&docs));
        let suggestions = self.suggestions(&request);

        let start = request.start;
        let stop = request.stop.unwrap_or(docs.len()).min(docs.len());
        let page = if start < stop { &docs[start..stop] } else { &[] };

        let mut hits = Vec::with_capacity(page.len());
        for (doc, duplicate_count) in page {
            let mut hit = Hit::new(&doc.id).with_score(self.score(doc, &request)?);
            if let (Some(count), Some(field)) = (duplicate_count, &request.dedup_field) {
                hit.set_extra("duplicateCount", serde_json::json!({ field: count }));
            }
            for field in &request.stored_fields {
                if let Some(values) = doc.fields.get(field) {
                    hit.set_extra(field, serde_json::Value::Array(values.clone()));
                }
            }
            hits.push(hit);
        }

        Ok(CoreResponse {
            total,
            total_with_duplicates,
            query_time: Some(start_time.elapsed().as_millis() as u64),
            hits,
            drilldown_data,
            times: BTreeMap::new(),
            clusters,
            suggestions,
        })
    }

    async fn collect_keys(&self, query: &CoreQuery, key_field: &str) -> Result<BTreeSet<String>> {
        let mut keys = BTreeSet::new();
        for doc in &self.docs {
            if self.matches(doc, query)? {
                keys.extend(doc.string_values(key_field).map(str::to_string));
            }
        }
        Ok(keys)
    }

    async fn collect_sort_values(
        &self,
        key_field: &str,
        sort_by: &str,
    ) -> Result<HashMap<String, SortValue>> {
        let mut values = HashMap::new();
        for doc in &self.docs {
            let Some(sort_value) = doc.sort_value(sort_by) else {
                continue;
            };
            for key in doc.string_values(key_field) {
                values.insert(key.to_string(), sort_value.clone());
            }
        }
        Ok(values)
    }
}

fn compare_by_field(a: &Document, b: &Document, key: &SortKey) -> std::cmp::Ordering {
    let missing = key.missing_value.as_ref().and_then(missing_sort_value);
    let a = a.sort_value(&key.sort_by).or_else(|| missing.clone());
    let b = b.sort_value(&key.sort_by).or_else(|| missing.clone());
    let ordering = match (a, b) {
        (Some(a), Some(b)) => a.compare(&b),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    };
    if key.sort_descending {
        ordering.reverse()
    } else {
        ordering
    }
}

fn compare_joined(a: &Document, b: &Document, join: &JoinSort) -> std::cmp::Ordering {
    let lookup = |doc: &Document| {
        doc.string_values(&join.key_field)
            .find_map(|key| join.values.get(key))
            .cloned()
    };
    match (lookup(a), lookup(b)) {
        (Some(a), Some(b)) => {
            let ordering = a.compare(&b);
            if join.sort_descending {
                ordering.reverse()
            } else {
                ordering
            }
        }
        // keys without a joined value sort last either way
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    }
}

fn missing_sort_value(value: &serde_json::Value) -> Option<SortValue> {
    if let Some(n) = value.as_i64() {
        return Some(SortValue::Long(n));
    }
    match value.as_str() {
        Some("STRING_FIRST") => Some(SortValue::Str(String::new())),
        Some("STRING_LAST") => Some(SortValue::Str("\u{10FFFF}".to_string())),
        Some(other) => Some(SortValue::Str(other.to_string())),
        None => None,
    }
}

fn in_numeric_range(
    value: f64,
    lower: &Option<RangeValue>,
    upper: &Option<RangeValue>,
    include_lower: bool,
    include_upper: bool,
) -> bool {
    if let Some(lower) = lower.as_ref().and_then(range_f64) {
        if value < lower || (!include_lower && value == lower) {
            return false;
        }
    }
    if let Some(upper) = upper.as_ref().and_then(range_f64) {
        if value > upper || (!include_upper && value == upper) {
            return false;
        }
    }
    true
}

fn in_string_range(
    value: &str,
    lower: &Option<RangeValue>,
    upper: &Option<RangeValue>,
    include_lower: bool,
    include_upper: bool,
) -> bool {
    if let Some(RangeValue::Str(lower)) = lower {
        if value < lower.as_str() || (!include_lower && value == lower.as_str()) {
            return false;
        }
    }
    if let Some(RangeValue::Str(upper)) = upper {
        if value > upper.as_str() || (!include_upper && value == upper.as_str()) {
            return false;
        }
    }
    true
}

fn range_f64(value: &RangeValue) -> Option<f64> {
    match value {
        RangeValue::Long(v) => Some(*v as f64),
        RangeValue::Double(v) => Some(*v),
        RangeValue::Str(_) => None,
    }
}

/// `?` matches one character, `*` any suffix.
fn wildcard_pattern(pattern: &str) -> Result<regex::Regex> {
    let mut translated = String::with_capacity(pattern.len() + 4);
    translated.push('^');
    for c in pattern.chars() {
        match c {
            '?' => translated.push('.'),
            '*' => translated.push_str(".*"),
            c => translated.push_str(&regex::escape(&c.to_string())),
        }
    }
    translated.push('$');
    Ok(regex::Regex::new(&translated)?)
}
