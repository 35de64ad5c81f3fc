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

//! Builds a [`ComposedQuery`] from a textual query plus side-channel
//! arguments.
//!
//! The assembler runs filter extraction against the result core, routes
//! prefixed filters, rank queries, sort keys and facets to their cores, and
//! applies the deployment configuration (declared matches, dedup, feature
//! switches, facet name translation). It also hands back a
//! [`DrilldownRestore`] that maps facet names in the response back to the
//! caller-facing ones and re-establishes the caller's facet order.

use std::collections::{HashMap, HashSet};

use super::ComposedQuery;
use crate::config::FederationConfig;
use crate::query::expr::{cores_referenced, split_core_prefix, strip_core_prefix, Expression};
use crate::query::{cql, filter_extract};
use crate::schema::KEY_FIELD_PREFIX;
use crate::searcher::{DrilldownData, Facet, SortKey, SuggestionRequest};
use crate::Result;

/// Side-channel arguments accompanying a search request.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtraArguments {
    /// Extra filter queries, core-prefix-routed.
    pub x_filter: Vec<String>,
    /// Rank queries, core-prefix-routed and OR-joined per core.
    pub x_rank_query: Vec<String>,
    /// Requests clustering; only honored when the feature is enabled.
    pub x_clustering: Option<bool>,
    /// Overrides the configured dedup-by-default flag.
    pub x_filter_common_keys: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchRequest {
    pub query: String,
    pub extra_arguments: ExtraArguments,
    pub facets: Vec<Facet>,
    /// `(fieldname, path)` drilldown restrictions; fieldname may be
    /// core-prefixed.
    pub drilldown_queries: Vec<(String, Vec<String>)>,
    /// `(core, query text)` pairs, added to the named core directly.
    pub filter_queries: Vec<(String, String)>,
    pub exclude_filter_queries: Vec<(String, String)>,
    pub sort_keys: Vec<SortKey>,
    pub start: Option<usize>,
    pub stop: Option<usize>,
    pub stored_fields: Vec<String>,
    pub suggestion_request: Option<SuggestionRequest>,
}

impl SearchRequest {
    pub fn new(query: &str) -> Self {
        SearchRequest {
            query: query.to_string(),
            ..Default::default()
        }
    }
}

/// Remembers how facet fieldnames were rewritten and in which order the
/// caller asked for them, so the merged drilldown data can be restored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrilldownRestore {
    order: Vec<(String, Vec<String>)>,
    names: HashMap<String, String>,
}

impl DrilldownRestore {
    /// Rewrites translated fieldnames back to caller-facing ones and
    /// re-sorts the list into the caller's facet order. Per-core dispatch
    /// interleaves facet results in an undefined order, so this runs on
    /// every response. Entries the caller never asked for keep their
    /// relative order at the end.
    pub fn restore(&self, mut data: Vec<DrilldownData>) -> Vec<DrilldownData> {
        for entry in &mut data {
            if let Some(original) = self.names.get(&entry.fieldname) {
                entry.fieldname = original.clone();
            }
        }
        data.sort_by_key(|entry| {
            self.order
                .iter()
                .position(|(fieldname, path)| *fieldname == entry.fieldname && *path == entry.path)
                .unwrap_or(self.order.len())
        });
        data
    }
}

pub struct Assembler {
    config: FederationConfig,
}

impl Assembler {
    pub fn new(config: FederationConfig) -> Self {
        Assembler { config }
    }

    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    pub fn assemble(&self, request: &SearchRequest) -> Result<(ComposedQuery, DrilldownRestore)> {
        let home = self.config.results_from.as_str();
        let known = self.known_cores();

        let mut cq = ComposedQuery::new(home);

        for match_config in &self.config.matches {
            cq.add_match(match_config.a.clone(), match_config.b.clone())?;
        }

        let expression = cql::parse(&request.query)?;
        let extracted = filter_extract::extract(&expression, home, &known)?;
        cq.set_core_query(
            home,
            extracted.residual.unwrap_or_else(|| Expression::term("*")),
        );
        for (core, filters) in extracted.filters {
            for filter in filters {
                cq.add_filter_query(&core, filter);
            }
        }

        cq.start = request.start;
        cq.stop = request.stop;
        cq.stored_fields = request.stored_fields.clone();
        cq.suggestion_request = request.suggestion_request.clone();
        if !self.config.unqualified_term_fields.is_empty() {
            cq.unqualified_term_fields = Some(self.config.unqualified_term_fields.clone());
        }

        for sort_key in &request.sort_keys {
            cq.add_sort_key(self.resolve_sort_key(sort_key.clone(), &known));
        }

        for entry in &request.extra_arguments.x_filter {
            let expression = cql::parse(entry)?;
            let extracted = filter_extract::extract(&expression, home, &known)?;
            if let Some(residual) = extracted.residual {
                cq.add_filter_query(home, residual);
            }
            for (core, filters) in extracted.filters {
                for filter in filters {
                    cq.add_filter_query(&core, filter);
                }
            }
        }

        for (core, text) in &request.filter_queries {
            cq.add_filter_query(core, cql::parse(text)?);
        }
        for (core, text) in &request.exclude_filter_queries {
            cq.add_exclude_filter_query(core, cql::parse(text)?);
        }

        self.add_rank_queries(&mut cq, &request.extra_arguments.x_rank_query, &known)?;
        self.apply_dedup(&mut cq, &request.extra_arguments);
        cq.clustering = self.config.feature_enabled("clustering")
            && request.extra_arguments.x_clustering == Some(true);

        let mut restore = DrilldownRestore::default();
        for facet in &request.facets {
            self.add_facet(&mut cq, facet, &known, &mut restore);
        }
        for (fieldname, path) in &request.drilldown_queries {
            let (core, field) = self.resolve_field(fieldname, &known);
            let translated = self.config.translate_facet(&field).to_string();
            cq.add_drilldown_query(&core, &translated, path.clone());
        }

        Ok((cq, restore))
    }

    fn known_cores(&self) -> HashSet<String> {
        let mut cores: HashSet<String> = [self.config.results_from.clone()].into();
        for match_config in &self.config.matches {
            cores.insert(match_config.a.core.clone());
            cores.insert(match_config.b.core.clone());
        }
        cores
    }

    fn resolve_field(&self, fieldname: &str, known: &HashSet<String>) -> (String, String) {
        match split_core_prefix(fieldname, &self.config.results_from, known) {
            (Some(core), field) => (core, field.to_string()),
            (None, field) => (self.config.results_from.clone(), field.to_string()),
        }
    }

    fn resolve_sort_key(&self, mut sort_key: SortKey, known: &HashSet<String>) -> SortKey {
        let (core, field) = self.resolve_field(&sort_key.sort_by, known);
        sort_key.sort_by = field;
        sort_key.core = Some(core);
        sort_key
    }

    fn add_rank_queries(
        &self,
        cq: &mut ComposedQuery,
        entries: &[String],
        known: &HashSet<String>,
    ) -> Result<()> {
        let home = self.config.results_from.as_str();
        let mut per_core: Vec<(String, Vec<Expression>)> = Vec::new();

        for entry in entries {
            let mut expression = cql::parse(entry)?;
            let cores = cores_referenced(&expression, home, known);
            let core = match cores.iter().find(|core| *core != home) {
                Some(core) if cores.len() == 1 => {
                    strip_core_prefix(&mut expression, core);
                    core.clone()
                }
                _ => home.to_string(),
            };
            match per_core.iter_mut().find(|(c, _)| *c == core) {
                Some((_, expressions)) => expressions.push(expression),
                None => per_core.push((core, vec![expression])),
            }
        }

        for (core, mut expressions) in per_core {
            let joined = if expressions.len() == 1 {
                expressions.pop().unwrap_or_else(|| Expression::term("*"))
            } else {
                Expression::or(expressions)
            };
            cq.set_rank_query(&core, joined);
        }
        Ok(())
    }

    fn apply_dedup(&self, cq: &mut ComposedQuery, extra: &ExtraArguments) {
        let Some(field) = &self.config.dedup.field_name else {
            return;
        };
        let enabled = extra
            .x_filter_common_keys
            .unwrap_or(self.config.dedup.by_default);
        if !enabled {
            return;
        }
        cq.dedup_field = Some(if field.starts_with(KEY_FIELD_PREFIX) {
            field.clone()
        } else {
            format!("{KEY_FIELD_PREFIX}{field}")
        });
        cq.dedup_sort_field = self.config.dedup.sort_field_name.clone();
    }

    /// The first `>`-separated segment of the facet fieldname is the
    /// dimension (possibly core-prefixed), the rest a fixed drill path.
    fn add_facet(
        &self,
        cq: &mut ComposedQuery,
        facet: &Facet,
        known: &HashSet<String>,
        restore: &mut DrilldownRestore,
    ) {
        let mut segments = facet.fieldname.split('>').map(str::trim);
        let dimension = segments.next().unwrap_or_default().to_string();
        let mut path: Vec<String> = segments.map(|s| s.to_string()).collect();
        path.extend(facet.path.iter().cloned());

        let (core, field) = self.resolve_field(&dimension, known);
        let translated = self.config.translate_facet(&field).to_string();

        restore.order.push((dimension.clone(), path.clone()));
        if translated != dimension {
            restore.names.insert(translated.clone(), dimension);
        }

        cq.add_facet(
            &core,
            Facet {
                fieldname: translated,
                path,
                max_terms: if facet.max_terms == 0 {
                    self.config.max_facet_terms
                } else {
                    facet.max_terms
                },
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composed::{MatchSpec, QueryState};
    use crate::config::MatchConfig;
    use crate::searcher::DrilldownTerm;
    use pretty_assertions::assert_eq;

    fn config() -> FederationConfig {
        let mut config = FederationConfig::new("core1");
        config.matches.push(MatchConfig {
            a: MatchSpec::unique_key("core1", "__key__.field"),
            b: MatchSpec::key("core2", "__key__.field"),
        });
        config
    }

    fn assembler() -> Assembler {
        Assembler::new(config())
    }

    fn parsed(q: &str) -> QueryState {
        QueryState::Parsed(cql::parse(q).unwrap())
    }

    #[test]
    fn seeds_core_query_and_filters_from_extraction() {
        let (cq, _) = assembler()
            .assemble(&SearchRequest::new("core2.a=b AND f=v"))
            .unwrap();

        assert_eq!(cq.query_for("core1"), Some(&parsed("f=v")));
        assert_eq!(cq.filter_queries_for("core2"), &[parsed("a=b")]);
        assert_eq!(cq.key_name("core2", "core1").unwrap(), "__key__.field");
    }

    #[test]
    fn fully_extracted_query_becomes_match_all() {
        let (cq, _) = assembler()
            .assemble(&SearchRequest::new("core2.a=b"))
            .unwrap();
        assert_eq!(cq.query_for("core1"), Some(&parsed("*")));
    }

    #[test]
    fn x_filter_routes_by_prefix() {
        let mut request = SearchRequest::new("f=v");
        request.extra_arguments.x_filter =
            vec!["g=w".to_string(), "core2.h=x".to_string()];

        let (cq, _) = assembler().assemble(&request).unwrap();
        assert_eq!(cq.filter_queries_for("core1"), &[parsed("g=w")]);
        assert_eq!(cq.filter_queries_for("core2"), &[parsed("h=x")]);
    }

    #[test]
    fn explicit_filter_pairs_bypass_prefix_parsing() {
        let mut request = SearchRequest::new("f=v");
        request.filter_queries = vec![("core2".to_string(), "a=b".to_string())];
        request.exclude_filter_queries = vec![("core1".to_string(), "g=w".to_string())];

        let (cq, _) = assembler().assemble(&request).unwrap();
        assert_eq!(cq.filter_queries_for("core2"), &[parsed("a=b")]);
        assert_eq!(cq.exclude_filter_queries_for("core1"), &[parsed("g=w")]);
    }

    #[test]
    fn rank_queries_group_and_or_join_per_core() {
        let mut request = SearchRequest::new("f=v");
        request.extra_arguments.x_rank_query = vec![
            "core2.a=b".to_string(),
            "core2.c=d".to_string(),
            "e=f".to_string(),
        ];

        let (cq, _) = assembler().assemble(&request).unwrap();
        assert_eq!(
            cq.rank_query_for("core2"),
            Some(&parsed("a=b OR c=d"))
        );
        assert_eq!(cq.rank_query_for("core1"), Some(&parsed("e=f")));
    }

    #[test]
    fn dedup_follows_configuration_and_override() {
        let mut config = config();
        config.dedup.field_name = Some("dedup".to_string());
        config.dedup.sort_field_name = Some("__key__.date".to_string());

        // on by default, key prefix added automatically
        let (cq, _) = Assembler::new(config.clone())
            .assemble(&SearchRequest::new("f=v"))
            .unwrap();
        assert_eq!(cq.dedup_field.as_deref(), Some("__key__.dedup"));
        assert_eq!(cq.dedup_sort_field.as_deref(), Some("__key__.date"));

        // explicit opt-out wins
        let mut request = SearchRequest::new("f=v");
        request.extra_arguments.x_filter_common_keys = Some(false);
        let (cq, _) = Assembler::new(config).assemble(&request).unwrap();
        assert_eq!(cq.dedup_field, None);
    }

    #[test]
    fn clustering_requires_feature_and_flag() {
        let mut request = SearchRequest::new("f=v");
        request.extra_arguments.x_clustering = Some(true);
        let (cq, _) = assembler().assemble(&request).unwrap();
        assert!(cq.clustering);

        let mut disabled = config();
        disabled.features_disabled.push("clustering".to_string());
        let (cq, _) = Assembler::new(disabled).assemble(&request).unwrap();
        assert!(!cq.clustering);

        let (cq, _) = assembler().assemble(&SearchRequest::new("f=v")).unwrap();
        assert!(!cq.clustering);
    }

    #[test]
    fn sort_keys_resolve_their_core() {
        let mut request = SearchRequest::new("f=v");
        request.sort_keys = vec![
            SortKey::new("core2.date", true),
            SortKey::new("title", false),
            // literally starts with the result core's name: never split
            SortKey::new("core1.title", false),
        ];

        let (cq, _) = assembler().assemble(&request).unwrap();
        let keys = cq.sort_keys();
        assert_eq!((keys[0].sort_by.as_str(), keys[0].core.as_deref()), ("date", Some("core2")));
        assert_eq!((keys[1].sort_by.as_str(), keys[1].core.as_deref()), ("title", Some("core1")));
        assert_eq!(
            (keys[2].sort_by.as_str(), keys[2].core.as_deref()),
            ("core1.title", Some("core1"))
        );
    }

    #[test]
    fn facets_split_paths_translate_and_route() {
        let mut config = config();
        config
            .facet_translations
            .insert("subject".to_string(), "untokenized.subject".to_string());

        let mut request = SearchRequest::new("f=v");
        request.facets = vec![
            Facet::new("subject > fiction", 10),
            Facet::new("core2.field", 5),
        ];

        let (cq, _) = Assembler::new(config).assemble(&request).unwrap();
        assert_eq!(
            cq.facets_for("core1"),
            &[Facet {
                fieldname: "untokenized.subject".to_string(),
                path: vec!["fiction".to_string()],
                max_terms: 10,
            }]
        );
        assert_eq!(cq.facets_for("core2"), &[Facet::new("field", 5)]);
    }

    #[test]
    fn drilldown_restore_renames_and_reorders() {
        let mut config = config();
        config
            .facet_translations
            .insert("subject".to_string(), "untokenized.subject".to_string());

        let mut request = SearchRequest::new("f=v");
        request.facets = vec![Facet::new("subject", 10), Facet::new("core2.field", 5)];
        let (_, restore) = Assembler::new(config).assemble(&request).unwrap();

        let term = |t: &str| DrilldownTerm {
            term: t.to_string(),
            count: 1,
            subterms: None,
        };
        // dispatcher interleaved the cores in reverse order
        let restored = restore.restore(vec![
            DrilldownData {
                fieldname: "field".to_string(),
                path: vec![],
                terms: vec![term("x")],
            },
            DrilldownData {
                fieldname: "untokenized.subject".to_string(),
                path: vec![],
                terms: vec![term("y")],
            },
        ]);

        assert_eq!(restored[0].fieldname, "subject");
        assert_eq!(restored[1].fieldname, "core2.field");
    }
}
