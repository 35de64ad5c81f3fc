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

//! Per-core field registries and analyzers.
//!
//! A registry maps field names to their type metadata and is consulted by
//! the query translator (numeric ranges, phrase permission, drilldown
//! hierarchy) and by sort-key resolution. Registration happens at startup;
//! after that registries are shared read-only across requests.

use std::collections::HashMap;
use std::sync::Arc;

use rust_stemmers::{Algorithm, Stemmer};

use crate::searcher::SortKey;
use crate::{Error, Result};

pub const KEY_FIELD_PREFIX: &str = "__key__.";
pub const UNTOKENIZED_PREFIX: &str = "untokenized.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum FieldType {
    Text {
        tokenized: bool,
        /// False for fields indexed without positional term frequencies;
        /// phrase queries against them are dropped.
        phrase_queries: bool,
    },
    Long,
    Double,
    DrillDown {
        hierarchical: bool,
    },
}

impl FieldType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Long | FieldType::Double)
    }
}

pub struct FieldRegistry {
    fields: HashMap<String, FieldType>,
    default_type: FieldType,
    stemmer: Stemmer,
}

impl std::fmt::Debug for FieldRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldRegistry")
            .field("fields", &self.fields)
            .field("default_type", &self.default_type)
            .finish()
    }
}

impl Default for FieldRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldRegistry {
    pub fn new() -> Self {
        FieldRegistry {
            fields: HashMap::new(),
            default_type: FieldType::Text {
                tokenized: true,
                phrase_queries: true,
            },
            stemmer: Stemmer::create(Algorithm::English),
        }
    }

    pub fn register(&mut self, field: &str, field_type: FieldType) -> &mut Self {
        self.fields.insert(field.to_string(), field_type);
        self
    }

    /// Explicit registration wins; otherwise key fields and the
    /// `untokenized.` namespace are untokenized text, everything else is
    /// tokenized text with positions.
    pub fn field_type(&self, field: &str) -> FieldType {
        if let Some(field_type) = self.fields.get(field) {
            return *field_type;
        }
        if field.starts_with(KEY_FIELD_PREFIX) || field.starts_with(UNTOKENIZED_PREFIX) {
            return FieldType::Text {
                tokenized: false,
                phrase_queries: false,
            };
        }
        self.default_type
    }

    pub fn is_numeric(&self, field: &str) -> bool {
        self.field_type(field).is_numeric()
    }

    pub fn is_drilldown(&self, field: &str) -> bool {
        matches!(self.field_type(field), FieldType::DrillDown { .. })
    }

    pub fn is_hierarchical(&self, field: &str) -> bool {
        matches!(
            self.field_type(field),
            FieldType::DrillDown { hierarchical: true }
        )
    }

    pub fn is_tokenized(&self, field: &str) -> bool {
        match self.field_type(field) {
            FieldType::Text { tokenized, .. } => tokenized,
            _ => false,
        }
    }

    pub fn phrase_queries_allowed(&self, field: &str) -> bool {
        match self.field_type(field) {
            FieldType::Text { phrase_queries, .. } => phrase_queries,
            _ => false,
        }
    }

    /// Primary analysis: lowercase and split on non-alphanumeric characters.
    pub fn tokenize(&self, term: &str) -> Vec<String> {
        term.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect()
    }

    /// Secondary analysis: re-tokenize and stem. Usually yields a single
    /// token; when it yields several the translator builds an OR of term
    /// queries instead.
    pub fn stem(&self, token: &str) -> Vec<String> {
        self.tokenize(token)
            .into_iter()
            .map(|t| self.stemmer.stem(&t).to_string())
            .collect()
    }

    fn sort_type(&self, field: &str) -> &'static str {
        match self.field_type(field) {
            FieldType::Long => "Long",
            FieldType::Double => "Double",
            _ => "String",
        }
    }

    /// Fills in the registry-resolved sort value type and the default used
    /// for documents missing the field, so that absent values sort last.
    pub fn update_sort_key(&self, sort_key: &mut SortKey) {
        sort_key.type_ = Some(self.sort_type(&sort_key.sort_by).to_string());
        sort_key.missing_value = Some(match self.field_type(&sort_key.sort_by) {
            FieldType::Long | FieldType::Double => {
                if sort_key.sort_descending {
                    serde_json::Value::from(i64::MIN)
                } else {
                    serde_json::Value::from(i64::MAX)
                }
            }
            _ => {
                if sort_key.sort_descending {
                    serde_json::Value::from("STRING_FIRST")
                } else {
                    serde_json::Value::from("STRING_LAST")
                }
            }
        });
    }
}

/// The registries of every core participating in the federation, shared
/// read-only across concurrently processed requests.
#[derive(Debug, Default)]
pub struct Schemas {
    registries: HashMap<String, Arc<FieldRegistry>>,
}

impl Schemas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, core: &str, registry: FieldRegistry) -> &mut Self {
        self.registries.insert(core.to_string(), Arc::new(registry));
        self
    }

    pub fn registry(&self, core: &str) -> Result<&Arc<FieldRegistry>, Error> {
        self.registries
            .get(core)
            .ok_or_else(|| Error::UnknownCore(core.to_string()))
    }

    pub fn cores(&self) -> impl Iterator<Item = &str> {
        self.registries.keys().map(|s| s.as_str())
    }
}
