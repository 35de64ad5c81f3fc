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

//! Fans a composed query out over the registered cores and merges the
//! sub-responses.
//!
//! Hits only ever come from the result core. Everything another core
//! contributes travels over the declared join keys: filters and excludes as
//! key sets, sort keys as key-to-value mappings, facets as a restricted
//! facet-only sub-request. Any backend failure fails the whole composed
//! query; there are no partial results.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use tracing::debug;

use super::{
    CoreInfo, CoreRequest, CoreResponse, JoinSort, Response, SearchCore, SortDirective, SortKey,
};
use crate::composed::{Assembler, ComposedQuery, SearchRequest};
use crate::config::FederationConfig;
use crate::query::translate::QueryTranslator;
use crate::query::{BooleanClause, CoreQuery, Occur};
use crate::schema::Schemas;
use crate::{Error, Result};

pub struct FederatedSearcher {
    cores: HashMap<String, Arc<dyn SearchCore>>,
    schemas: Arc<Schemas>,
}

impl FederatedSearcher {
    pub fn new(schemas: Arc<Schemas>) -> Self {
        FederatedSearcher {
            cores: HashMap::new(),
            schemas,
        }
    }

    pub fn register(&mut self, core: Arc<dyn SearchCore>) -> &mut Self {
        self.cores.insert(core.name().to_string(), core);
        self
    }

    pub fn core(&self, name: &str) -> Result<&Arc<dyn SearchCore>, Error> {
        self.cores
            .get(name)
            .ok_or_else(|| Error::UnknownCore(name.to_string()))
    }

    pub fn core_info(&self) -> Vec<CoreInfo> {
        let mut info: Vec<CoreInfo> = self.cores.values().map(|core| core.core_info()).collect();
        info.sort_by(|a, b| a.name.cmp(&b.name));
        info
    }

    pub async fn execute_composed_query(&self, mut cq: ComposedQuery) -> Result<Response> {
        cq.validate()?;

        let home = cq.results_from().to_string();
        if !cq.fully_translated() {
            let schemas = self.schemas.clone();
            let results_from = home.clone();
            cq.convert_with(|core, expression, snapshot| {
                QueryTranslator::new(core, &results_from, schemas.clone())
                    .translate(expression, Some(snapshot))
            })?;
        }

        let info = cq.to_dict();
        let mut request = self.build_home_request(&cq, &home).await?;
        let sort = self.resolve_sort(&cq, &home).await?;
        request.sort = sort;

        let restriction = combined_query(&request);
        debug!(core = %home, "dispatching result-core sub-request");
        let home_response = self.dispatch(&home, request).await?;

        let foreign_drilldown = self
            .foreign_facet_responses(&cq, &home, &restriction)
            .await?;

        let mut response = merge(home_response);
        response.drilldown_data.extend(foreign_drilldown);
        response.info = Some(info);
        Ok(response)
    }

    async fn build_home_request(&self, cq: &ComposedQuery, home: &str) -> Result<CoreRequest> {
        let query = match cq.query_for(home) {
            Some(state) => self.resolve_joins(state.expect_translated(home)?.clone()).await?,
            None => CoreQuery::MatchAll,
        };

        let mut request = CoreRequest::new(query);

        for state in cq.filter_queries_for(home) {
            let filter = self.resolve_joins(state.expect_translated(home)?.clone()).await?;
            match filter.as_exclude() {
                Some(inner) => request.exclude_filter_queries.push(inner.clone()),
                None => request.filter_queries.push(filter),
            }
        }
        for state in cq.exclude_filter_queries_for(home) {
            let filter = self.resolve_joins(state.expect_translated(home)?.clone()).await?;
            request
                .exclude_filter_queries
                .push(filter.as_exclude().cloned().unwrap_or(filter));
        }

        for core in cq.cores() {
            if core == home {
                continue;
            }
            self.join_foreign_core(cq, home, core, &mut request).await?;
        }

        if let Some(unite) = cq.unite() {
            let mut sides = Vec::with_capacity(2);
            for side in [&unite.a, &unite.b] {
                let query = side.query.expect_translated(&side.core)?.clone();
                let joined = if side.core == home {
                    self.resolve_joins(query).await?
                } else {
                    let key = cq.key_name(&side.core, home)?.to_string();
                    self.collect_key_filter(&side.core, &query, &key).await?
                };
                sides.push((Occur::Should, joined));
            }
            request.filter_queries.push(CoreQuery::boolean(sides));
        }

        request.rank_query = self.resolve_rank_query(cq, home).await?;
        request.rank_query_score_ratio = cq.rank_query_score_ratio;

        request.facets = cq.facets_for(home).to_vec();
        request.drilldown_queries = cq.drilldown_queries_for(home).to_vec();
        request.start = cq.start.unwrap_or(0);
        request.stop = cq.stop;
        request.dedup_field = cq.dedup_field.clone();
        request.dedup_sort_field = cq.dedup_sort_field.clone();
        request.stored_fields = cq.stored_fields.clone();
        request.clustering = cq.clustering;
        request.suggestion_request = cq.suggestion_request.clone();

        Ok(request)
    }

    /// A foreign core restricts the result set through the join key: its
    /// core query and filters become key filters on the home core, exclude
    /// markers become key excludes.
    async fn join_foreign_core(
        &self,
        cq: &ComposedQuery,
        home: &str,
        core: &str,
        request: &mut CoreRequest,
    ) -> Result<()> {
        let mut queries: Vec<CoreQuery> = Vec::new();
        if let Some(state) = cq.query_for(core) {
            queries.push(state.expect_translated(core)?.clone());
        }
        for state in cq.filter_queries_for(core) {
            queries.push(state.expect_translated(core)?.clone());
        }
        for state in cq.exclude_filter_queries_for(core) {
            let query = state.expect_translated(core)?.clone();
            let inner = query.as_exclude().cloned().unwrap_or(query);
            queries.push(CoreQuery::exclude(inner));
        }
        for (field, path) in cq.drilldown_queries_for(core) {
            queries.push(CoreQuery::DrillDown {
                field: field.clone(),
                path: path.clone(),
                boost: None,
            });
        }
        if queries.is_empty() {
            return Ok(());
        }

        let key = cq.key_name(core, home)?.to_string();
        for query in queries {
            match query.as_exclude() {
                Some(inner) => {
                    let filter = self.collect_key_filter(core, inner, &key).await?;
                    request.exclude_filter_queries.push(filter);
                }
                None => {
                    let filter = self.collect_key_filter(core, &query, &key).await?;
                    request.filter_queries.push(filter);
                }
            }
        }
        Ok(())
    }

    /// Replaces relational markers left by the translator with key filters
    /// computed on the referenced core.
    fn resolve_joins(&self, query: CoreQuery) -> BoxFuture<'_, Result<CoreQuery>> {
        Box::pin(async move {
            match query {
                CoreQuery::Relational { core, key, query } => {
                    self.collect_key_filter(&core, &query, &key).await
                }
                CoreQuery::Boolean { clauses } => {
                    let mut resolved = Vec::with_capacity(clauses.len());
                    for clause in clauses {
                        resolved.push(BooleanClause {
                            occur: clause.occur,
                            query: self.resolve_joins(clause.query).await?,
                        });
                    }
                    Ok(CoreQuery::Boolean { clauses: resolved })
                }
                other => Ok(other),
            }
        })
    }

    async fn collect_key_filter(
        &self,
        core: &str,
        query: &CoreQuery,
        key: &str,
    ) -> Result<CoreQuery> {
        let backend = self.core(core)?;
        let keys = backend
            .collect_keys(query, key)
            .await
            .map_err(|source| Error::Backend {
                core: core.to_string(),
                source,
            })?;
        debug!(core, key, count = keys.len(), "collected join keys");
        Ok(CoreQuery::KeyFilter {
            field: key.to_string(),
            keys,
        })
    }

    /// Foreign rank queries join over the key and contribute as optional
    /// scoring clauses next to the home rank query.
    async fn resolve_rank_query(
        &self,
        cq: &ComposedQuery,
        home: &str,
    ) -> Result<Option<CoreQuery>> {
        let mut clauses = Vec::new();
        for core in cq.rank_query_cores().map(str::to_string).collect::<Vec<_>>() {
            let state = cq
                .rank_query_for(&core)
                .ok_or_else(|| Error::UnknownCore(core.clone()))?;
            let query = state.expect_translated(&core)?.clone();
            if core == home {
                clauses.push((Occur::Should, self.resolve_joins(query).await?));
            } else {
                let key = cq.key_name(&core, home)?.to_string();
                clauses.push((
                    Occur::Should,
                    self.collect_key_filter(&core, &query, &key).await?,
                ));
            }
        }
        Ok(match clauses.len() {
            0 => None,
            1 => clauses.pop().map(|(_, query)| query),
            _ => Some(CoreQuery::boolean(clauses)),
        })
    }

    /// Sort keys on the home core pass through with registry metadata; sort
    /// keys on another core become joined key-to-value mappings computed
    /// remotely.
    async fn resolve_sort(&self, cq: &ComposedQuery, home: &str) -> Result<Vec<SortDirective>> {
        let mut directives = Vec::with_capacity(cq.sort_keys().len());
        for sort_key in cq.sort_keys() {
            let core = sort_key.core.as_deref().unwrap_or(home);
            let registry = self.schemas.registry(core)?;
            let mut sort_key: SortKey = sort_key.clone();
            registry.update_sort_key(&mut sort_key);

            if core == home {
                directives.push(SortDirective::Field(sort_key));
                continue;
            }

            let key = cq.key_name(core, home)?.to_string();
            let backend = self.core(core)?;
            let values = backend
                .collect_sort_values(&key, &sort_key.sort_by)
                .await
                .map_err(|source| Error::Backend {
                    core: core.to_string(),
                    source,
                })?;
            directives.push(SortDirective::Joined(JoinSort {
                key_field: key,
                sort_descending: sort_key.sort_descending,
                values,
            }));
        }
        Ok(directives)
    }

    /// Facets on a foreign core are counted over the documents joined to
    /// the home result set, further narrowed by any other-core facet
    /// filters.
    async fn foreign_facet_responses(
        &self,
        cq: &ComposedQuery,
        home: &str,
        restriction: &CoreQuery,
    ) -> Result<Vec<super::DrilldownData>> {
        let mut requests = Vec::new();
        for core in cq.cores() {
            if core == home {
                continue;
            }
            let facets = cq.facets_for(core);
            let drilldowns = cq.drilldown_queries_for(core);
            if facets.is_empty() && drilldowns.is_empty() {
                continue;
            }

            let key = cq.key_name(core, home)?.to_string();
            let home_backend = self.core(home)?;
            let keys = home_backend
                .collect_keys(restriction, &key)
                .await
                .map_err(|source| Error::Backend {
                    core: home.to_string(),
                    source,
                })?;

            let mut request = CoreRequest::new(CoreQuery::KeyFilter {
                field: key,
                keys,
            });
            for state in cq.other_core_facet_filters_for(core) {
                let filter = state.expect_translated(core)?.clone();
                match filter.as_exclude() {
                    Some(inner) => request.exclude_filter_queries.push(inner.clone()),
                    None => request.filter_queries.push(filter),
                }
            }
            request.facets = facets.to_vec();
            request.drilldown_queries = drilldowns.to_vec();
            request.stop = Some(0);
            requests.push((core.to_string(), request));
        }

        let responses = join_all(
            requests
                .into_iter()
                .map(|(core, request)| async move {
                    debug!(core = %core, "dispatching facet-only sub-request");
                    self.dispatch(&core, request).await
                }),
        )
        .await;

        let mut drilldown_data = Vec::new();
        for response in responses {
            drilldown_data.extend(response?.drilldown_data);
        }
        Ok(drilldown_data)
    }

    async fn dispatch(&self, core: &str, request: CoreRequest) -> Result<CoreResponse> {
        let backend = self.core(core)?;
        backend
            .execute_query(request)
            .await
            .map_err(|source| Error::Backend {
                core: core.to_string(),
                source,
            })
            .map_err(Into::into)
    }
}

/// The home query, filters, excludes and drilldown restrictions folded into
/// one query; used to compute the keys of the final result set for foreign
/// facet restriction.
fn combined_query(request: &CoreRequest) -> CoreQuery {
    if request.filter_queries.is_empty()
        && request.exclude_filter_queries.is_empty()
        && request.drilldown_queries.is_empty()
    {
        return request.query.clone();
    }
    let mut clauses = vec![(Occur::Must, request.query.clone())];
    for filter in &request.filter_queries {
        clauses.push((Occur::Must, filter.clone()));
    }
    for filter in &request.exclude_filter_queries {
        clauses.push((Occur::MustNot, filter.clone()));
    }
    for (field, path) in &request.drilldown_queries {
        clauses.push((
            Occur::Must,
            CoreQuery::DrillDown {
                field: field.clone(),
                path: path.clone(),
                boost: None,
            },
        ));
    }
    CoreQuery::boolean(clauses)
}

fn merge(home: CoreResponse) -> Response {
    Response {
        total: home.total,
        total_with_duplicates: home.total_with_duplicates,
        query_time: home.query_time,
        times: home.times,
        hits: home.hits,
        drilldown_data: home.drilldown_data,
        suggestions: home.suggestions,
        clusters: home.clusters,
        info: None,
    }
}

/// Assembler and dispatcher glued together: text in, merged response out.
pub struct Federation {
    assembler: Assembler,
    searcher: FederatedSearcher,
}

impl Federation {
    pub fn new(config: FederationConfig, searcher: FederatedSearcher) -> Self {
        Federation {
            assembler: Assembler::new(config),
            searcher,
        }
    }

    pub fn searcher(&self) -> &FederatedSearcher {
        &self.searcher
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<Response> {
        let (cq, restore) = self.assembler.assemble(request)?;
        let mut response = self.searcher.execute_composed_query(cq).await?;
        response.drilldown_data = restore.restore(std::mem::take(&mut response.drilldown_data));
        Ok(response)
    }
}
