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

//! Greedy single-pass grouping of hits by term-set overlap.
//!
//! Each hit carries per-field term sets. A hit joins the first existing
//! cluster whose representative overlaps it enough, otherwise it founds a
//! new cluster. The aggregate distance between a hit and a cluster is the
//! maximum per-field Jaccard overlap, not an average: one strongly shared
//! field is enough to group two hits. First-fit makes the outcome
//! order-dependent.

use std::collections::{HashMap, HashSet};

use crate::config::ClusteringConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterDoc {
    pub id: String,
    pub terms: HashMap<String, HashSet<String>>,
}

impl ClusterDoc {
    pub fn new(id: &str, terms: HashMap<String, HashSet<String>>) -> Self {
        ClusterDoc {
            id: id.to_string(),
            terms,
        }
    }
}

struct Cluster {
    representative: HashMap<String, HashSet<String>>,
    ids: Vec<String>,
}

pub struct Clusterer {
    fields: Vec<String>,
    threshold: f64,
}

impl Clusterer {
    pub fn new(config: &ClusteringConfig) -> Self {
        Clusterer {
            fields: config.fields.clone(),
            threshold: config.threshold,
        }
    }

    /// Clusters docs in the given order. The representative term sets of a
    /// cluster are those of its founding doc.
    pub fn cluster<I>(&self, docs: I) -> Vec<Vec<String>>
    where
        I: IntoIterator<Item = ClusterDoc>,
    {
        let mut clusters: Vec<Cluster> = Vec::new();

        for doc in docs {
            let found = clusters
                .iter_mut()
                .find(|cluster| self.overlap(&cluster.representative, &doc.terms) > self.threshold);

            match found {
                Some(cluster) => cluster.ids.push(doc.id),
                None => clusters.push(Cluster {
                    representative: doc.terms,
                    ids: vec![doc.id],
                }),
            }
        }

        clusters.into_iter().map(|cluster| cluster.ids).collect()
    }

    fn overlap(
        &self,
        a: &HashMap<String, HashSet<String>>,
        b: &HashMap<String, HashSet<String>>,
    ) -> f64 {
        let fields: Vec<&str> = if self.fields.is_empty() {
            a.keys().map(String::as_str).collect()
        } else {
            self.fields.iter().map(String::as_str).collect()
        };

        fields
            .into_iter()
            .map(|field| match (a.get(field), b.get(field)) {
                (Some(a), Some(b)) => jaccard(a, b),
                _ => 0.0,
            })
            .fold(0.0, f64::max)
    }
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}
