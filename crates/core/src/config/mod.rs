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

pub mod defaults;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Context;

use crate::composed::{MatchSpec, UnqualifiedField};
use crate::Result;

/// Startup configuration of the federation layer. Loaded once from TOML;
/// the assembler reads it on every request but never mutates it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationConfig {
    /// The core whose documents become the result set.
    pub results_from: String,

    /// Declared join paths, applied to every assembled query.
    #[serde(default)]
    pub matches: Vec<MatchConfig>,

    /// Fields searched for a term without a field, with their boosts.
    #[serde(default)]
    pub unqualified_term_fields: Vec<UnqualifiedField>,

    /// Caller-facing facet name to internal storage name.
    #[serde(default)]
    pub facet_translations: HashMap<String, String>,

    /// Features switched off in this deployment ("clustering", ...).
    #[serde(default)]
    pub features_disabled: Vec<String>,

    #[serde(default = "defaults::Federation::max_facet_terms")]
    pub max_facet_terms: usize,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub clustering: ClusteringConfig,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchConfig {
    pub a: MatchSpec,
    pub b: MatchSpec,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupConfig {
    /// Field whose equal values collapse into one hit. Dedup is off when
    /// unset.
    pub field_name: Option<String>,

    /// Field deciding which duplicate survives.
    pub sort_field_name: Option<String>,

    /// Applied when the request does not pass `x-filter-common-keys`.
    #[serde(default = "defaults::Federation::dedup_by_default")]
    pub by_default: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            field_name: None,
            sort_field_name: None,
            by_default: defaults::Federation::dedup_by_default(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusteringConfig {
    /// Fields whose term sets are compared between hits.
    #[serde(default)]
    pub fields: Vec<String>,

    #[serde(default = "defaults::Federation::clustering_threshold")]
    pub threshold: f64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        ClusteringConfig {
            fields: Vec::new(),
            threshold: defaults::Federation::clustering_threshold(),
        }
    }
}

impl FederationConfig {
    pub fn new(results_from: &str) -> Self {
        FederationConfig {
            results_from: results_from.to_string(),
            matches: Vec::new(),
            unqualified_term_fields: Vec::new(),
            facet_translations: HashMap::new(),
            features_disabled: Vec::new(),
            max_facet_terms: defaults::Federation::max_facet_terms(),
            dedup: DedupConfig::default(),
            clustering: ClusteringConfig::default(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: '{}'", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config: '{}'", path.display()))
    }

    pub fn feature_enabled(&self, feature: &str) -> bool {
        !self.features_disabled.iter().any(|f| f == feature)
    }

    pub fn translate_facet<'a>(&'a self, fieldname: &'a str) -> &'a str {
        self.facet_translations
            .get(fieldname)
            .map(String::as_str)
            .unwrap_or(fieldname)
    }
}
