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

//! Translation of one core's expression tree into its native query.
//!
//! One translator per core. Fields prefixed with another core's name
//! translate against that core's registry and come back wrapped in a
//! relational marker carrying the join key, which the federation dispatcher
//! later resolves into a key filter.

use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use super::expr::{split_core_prefix, BoolOp, Expression, Leaf, Node, Relation};
use super::{CoreQuery, Occur, RangeValue};
use crate::composed::{ComposedQuery, UnqualifiedField};
use crate::schema::{FieldRegistry, Schemas};
use crate::{Error, Result};

static PREFIX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w-]{2,}\*$").expect("pattern is valid"));

/// The field searched when a leaf has no index and no unqualified term
/// fields were configured.
pub const DEFAULT_UNQUALIFIED_FIELD: &str = "__all__";

pub struct QueryTranslator {
    core: String,
    results_from: String,
    schemas: Arc<Schemas>,
}

impl QueryTranslator {
    pub fn new(core: &str, results_from: &str, schemas: Arc<Schemas>) -> Self {
        QueryTranslator {
            core: core.to_string(),
            results_from: results_from.to_string(),
            schemas,
        }
    }

    pub fn translate(
        &self,
        expr: &Expression,
        composed: Option<&ComposedQuery>,
    ) -> Result<CoreQuery> {
        let unqualified = composed
            .filter(|_| self.core == self.results_from)
            .and_then(|cq| cq.unqualified_term_fields.as_deref());
        self.translate_with(expr, unqualified, composed)
    }

    pub fn translate_with(
        &self,
        expr: &Expression,
        unqualified: Option<&[UnqualifiedField]>,
        composed: Option<&ComposedQuery>,
    ) -> Result<CoreQuery> {
        // a bare NOT has nothing to subtract from; give it a match-all
        if expr.must_not {
            let mut inner = expr.clone();
            inner.must_not = false;
            let translated = self.translate_with(&inner, unqualified, composed)?;
            return Ok(CoreQuery::boolean(vec![
                (Occur::Must, CoreQuery::MatchAll),
                (Occur::MustNot, translated),
            ]));
        }

        match &expr.node {
            Node::Boolean { op, operands } => {
                self.translate_boolean(*op, operands, unqualified, composed)
            }
            Node::Leaf(leaf) => self.translate_leaf(leaf, unqualified, composed),
        }
    }

    fn translate_boolean(
        &self,
        op: BoolOp,
        operands: &[Expression],
        unqualified: Option<&[UnqualifiedField]>,
        composed: Option<&ComposedQuery>,
    ) -> Result<CoreQuery> {
        let mut clauses = Vec::with_capacity(operands.len());
        for operand in operands {
            let occur = if operand.must_not {
                Occur::MustNot
            } else {
                match op {
                    BoolOp::And => Occur::Must,
                    BoolOp::Or => Occur::Should,
                }
            };

            let mut inner = operand.clone();
            inner.must_not = false;
            let translated = self.translate_with(&inner, unqualified, composed)?;
            if translated.is_degenerate() {
                continue;
            }
            clauses.push((occur, translated));
        }

        if clauses.iter().all(|(occur, _)| *occur == Occur::MustNot) && !clauses.is_empty() {
            clauses.insert(0, (Occur::Must, CoreQuery::MatchAll));
        }

        if clauses.len() == 1 && clauses[0].0 != Occur::MustNot {
            return Ok(clauses.pop().unwrap().1);
        }

        Ok(CoreQuery::boolean(clauses))
    }

    fn translate_leaf(
        &self,
        leaf: &Leaf,
        unqualified: Option<&[UnqualifiedField]>,
        composed: Option<&ComposedQuery>,
    ) -> Result<CoreQuery> {
        let Some(fieldname) = &leaf.index else {
            return self.translate_unqualified(leaf, unqualified);
        };

        let known = self.known_cores(composed);
        let (core, field) = match split_core_prefix(fieldname, &self.results_from, &known) {
            (Some(core), field) => (core, field),
            (None, field) => (self.core.clone(), field),
        };

        let registry = self.schemas.registry(&core)?;
        let query = leaf_query(registry, field, leaf)?;
        let query = with_boost(query, leaf.boost);

        if core != self.core {
            let key = match composed {
                Some(cq) => cq.key_name(&core, &self.results_from)?.to_string(),
                None => return Err(Error::NoMatch(core, self.results_from.clone()).into()),
            };
            return Ok(CoreQuery::Relational {
                core,
                key,
                query: Box::new(query),
            });
        }

        Ok(query)
    }

    fn translate_unqualified(
        &self,
        leaf: &Leaf,
        unqualified: Option<&[UnqualifiedField]>,
    ) -> Result<CoreQuery> {
        if leaf.term == "*" {
            return Ok(CoreQuery::MatchAll);
        }

        let default_fields;
        let fields = match unqualified {
            Some(fields) if !fields.is_empty() => fields,
            _ => {
                default_fields = [UnqualifiedField::new(DEFAULT_UNQUALIFIED_FIELD, 1.0)];
                &default_fields[..]
            }
        };

        let registry = self.schemas.registry(&self.core)?;
        let multi_token = registry.tokenize(&leaf.term).len() > 1;
        let mut candidates = Vec::new();
        for unqualified_field in fields {
            // a multi-word term needs positions the field may not store
            if multi_token && !registry.phrase_queries_allowed(&unqualified_field.field) {
                continue;
            }
            let synthetic = Leaf {
                index: Some(unqualified_field.field.clone()),
                relation: Relation::Eq,
                term: leaf.term.clone(),
                boost: None,
            };
            let query = leaf_query(registry, &unqualified_field.field, &synthetic)?;
            if query.is_degenerate() {
                continue;
            }
            candidates.push(with_boost(query, Some(unqualified_field.boost)));
        }

        match candidates.len() {
            0 => Ok(CoreQuery::boolean(vec![])),
            1 => Ok(candidates.pop().unwrap()),
            _ => Ok(CoreQuery::boolean(
                candidates.into_iter().map(|q| (Occur::Should, q)).collect(),
            )),
        }
    }

    fn known_cores(&self, composed: Option<&ComposedQuery>) -> HashSet<String> {
        match composed {
            Some(cq) => cq.cores().iter().cloned().collect(),
            None => self.schemas.cores().map(|s| s.to_string()).collect(),
        }
    }
}

fn leaf_query(registry: &FieldRegistry, field: &str, leaf: &Leaf) -> Result<CoreQuery> {
    if registry.is_drilldown(field) {
        let path = if registry.is_hierarchical(field) {
            leaf.term.split('>').map(|s| s.trim().to_string()).collect()
        } else {
            vec![leaf.term.clone()]
        };
        return Ok(CoreQuery::DrillDown {
            field: field.to_string(),
            path,
            boost: None,
        });
    }

    if registry.is_numeric(field) {
        return numeric_query(registry, field, leaf);
    }

    text_query(registry, field, leaf)
}

fn numeric_query(registry: &FieldRegistry, field: &str, leaf: &Leaf) -> Result<CoreQuery> {
    let value = parse_numeric(registry, field, &leaf.term)?;
    let range = match leaf.relation {
        // equality on numeric fields is always the closed range [v, v]
        Relation::Eq | Relation::EqEq | Relation::Exact => {
            range(field, Some(value.clone()), Some(value), true, true)
        }
        Relation::Lt => range(field, None, Some(value), true, false),
        Relation::Le => range(field, None, Some(value), true, true),
        Relation::Ge => range(field, Some(value), None, true, true),
        Relation::Gt => range(field, Some(value), None, false, true),
        Relation::Ne => {
            return Err(unsupported(leaf.relation, field));
        }
    };
    Ok(range)
}

fn text_query(registry: &FieldRegistry, field: &str, leaf: &Leaf) -> Result<CoreQuery> {
    match leaf.relation {
        Relation::EqEq | Relation::Exact => Ok(CoreQuery::term(field, &leaf.term)),
        Relation::Lt => Ok(range(
            field,
            None,
            Some(RangeValue::Str(leaf.term.clone())),
            true,
            false,
        )),
        Relation::Le => Ok(range(
            field,
            None,
            Some(RangeValue::Str(leaf.term.clone())),
            true,
            true,
        )),
        Relation::Ge => Ok(range(
            field,
            Some(RangeValue::Str(leaf.term.clone())),
            None,
            true,
            true,
        )),
        Relation::Gt => Ok(range(
            field,
            Some(RangeValue::Str(leaf.term.clone())),
            None,
            false,
            true,
        )),
        Relation::Eq => {
            if !registry.is_tokenized(field) {
                return Ok(CoreQuery::term(field, &leaf.term));
            }
            Ok(tokenized_query(registry, field, &leaf.term))
        }
        Relation::Ne => Err(unsupported(leaf.relation, field)),
    }
}

fn tokenized_query(registry: &FieldRegistry, field: &str, term: &str) -> CoreQuery {
    if term == "???*" {
        return CoreQuery::Wildcard {
            field: field.to_string(),
            pattern: term.to_string(),
            boost: None,
        };
    }

    if PREFIX_PATTERN.is_match(term) {
        return CoreQuery::Prefix {
            field: field.to_string(),
            prefix: term[..term.len() - 1].to_lowercase(),
            boost: None,
        };
    }

    let tokens = registry.tokenize(term);
    match tokens.as_slice() {
        [] => CoreQuery::boolean(vec![]),
        [token] => {
            let stemmed = registry.stem(token);
            match stemmed.as_slice() {
                [] => CoreQuery::boolean(vec![]),
                [single] => CoreQuery::term(field, single),
                many => CoreQuery::boolean(
                    many.iter()
                        .map(|t| (Occur::Should, CoreQuery::term(field, t)))
                        .collect(),
                ),
            }
        }
        many => CoreQuery::Phrase {
            field: field.to_string(),
            terms: many.to_vec(),
            boost: None,
        },
    }
}

fn parse_numeric(registry: &FieldRegistry, field: &str, term: &str) -> Result<RangeValue> {
    use crate::schema::FieldType;
    match registry.field_type(field) {
        FieldType::Long => term
            .parse::<i64>()
            .map(RangeValue::Long)
            .map_err(|_| Error::QueryParse(format!("'{term}' is not a long for field '{field}'")).into()),
        FieldType::Double => term
            .parse::<f64>()
            .map(RangeValue::Double)
            .map_err(|_| {
                Error::QueryParse(format!("'{term}' is not a double for field '{field}'")).into()
            }),
        _ => unreachable!("only called for numeric fields"),
    }
}

fn range(
    field: &str,
    lower: Option<RangeValue>,
    upper: Option<RangeValue>,
    include_lower: bool,
    include_upper: bool,
) -> CoreQuery {
    CoreQuery::Range {
        field: field.to_string(),
        lower,
        upper,
        include_lower,
        include_upper,
        boost: None,
    }
}

fn with_boost(query: CoreQuery, boost: Option<f32>) -> CoreQuery {
    let Some(value) = boost else {
        return query;
    };
    match query {
        CoreQuery::Term { field, value: v, .. } => CoreQuery::Term {
            field,
            value: v,
            boost: Some(value),
        },
        CoreQuery::Phrase { field, terms, .. } => CoreQuery::Phrase {
            field,
            terms,
            boost: Some(value),
        },
        CoreQuery::Prefix { field, prefix, .. } => CoreQuery::Prefix {
            field,
            prefix,
            boost: Some(value),
        },
        CoreQuery::Wildcard { field, pattern, .. } => CoreQuery::Wildcard {
            field,
            pattern,
            boost: Some(value),
        },
        CoreQuery::DrillDown { field, path, .. } => CoreQuery::DrillDown {
            field,
            path,
            boost: Some(value),
        },
        CoreQuery::Range {
            field,
            lower,
            upper,
            include_lower,
            include_upper,
            ..
        } => CoreQuery::Range {
            field,
            lower,
            upper,
            include_lower,
            include_upper,
            boost: Some(value),
        },
        other => other,
    }
}

fn unsupported(relation: Relation, field: &str) -> anyhow::Error {
    Error::UnsupportedQueryRelation {
        relation: relation.to_string(),
        field: field.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composed::MatchSpec;
    use crate::query::cql;
    use crate::schema::FieldType;
    use pretty_assertions::assert_eq;

    fn schemas() -> Arc<Schemas> {
        let mut main = FieldRegistry::new();
        main.register("age", FieldType::Long);
        main.register("price", FieldType::Double);
        main.register(
            "category",
            FieldType::DrillDown {
                hierarchical: true,
            },
        );

        let main2 = FieldRegistry::new();

        let mut schemas = Schemas::new();
        schemas.insert("main", main);
        schemas.insert("main2", main2);
        Arc::new(schemas)
    }

    fn translator() -> QueryTranslator {
        QueryTranslator::new("main", "main", schemas())
    }

    fn translate(q: &str) -> CoreQuery {
        translator()
            .translate(&cql::parse(q).unwrap(), None)
            .unwrap()
    }

    #[test]
    fn match_all_for_star() {
        assert_eq!(translate("*"), CoreQuery::MatchAll);
    }

    #[test]
    fn numeric_equality_is_a_closed_range() {
        for q in ["age=3", "age == 3", "age exact 3"] {
            assert_eq!(
                translate(q),
                CoreQuery::Range {
                    field: "age".to_string(),
                    lower: Some(RangeValue::Long(3)),
                    upper: Some(RangeValue::Long(3)),
                    include_lower: true,
                    include_upper: true,
                    boost: None,
                }
            );
        }
    }

    #[test]
    fn numeric_open_ranges() {
        assert_eq!(
            translate("age < 3"),
            CoreQuery::Range {
                field: "age".to_string(),
                lower: None,
                upper: Some(RangeValue::Long(3)),
                include_lower: true,
                include_upper: false,
                boost: None,
            }
        );
        assert_eq!(
            translate("age >= 3"),
            CoreQuery::Range {
                field: "age".to_string(),
                lower: Some(RangeValue::Long(3)),
                upper: None,
                include_lower: true,
                include_upper: true,
                boost: None,
            }
        );
        assert_eq!(
            translate("price > 1.5"),
            CoreQuery::Range {
                field: "price".to_string(),
                lower: Some(RangeValue::Double(1.5)),
                upper: None,
                include_lower: false,
                include_upper: true,
                boost: None,
            }
        );
    }

    #[test]
    fn exact_term_on_untokenized_field() {
        assert_eq!(
            translate("untokenized.field2=value0"),
            CoreQuery::term("untokenized.field2", "value0")
        );
        assert_eq!(
            translate("title == \"Two Words\""),
            CoreQuery::term("title", "Two Words")
        );
    }

    #[test]
    fn tokenized_single_term_is_stemmed() {
        assert_eq!(translate("title=Queries"), CoreQuery::term("title", "queri"));
    }

    #[test]
    fn tokenized_multi_term_becomes_phrase() {
        assert_eq!(
            translate("title=\"two words\""),
            CoreQuery::Phrase {
                field: "title".to_string(),
                terms: vec!["two".to_string(), "words".to_string()],
                boost: None,
            }
        );
    }

    #[test]
    fn prefix_and_wildcard_patterns() {
        assert_eq!(
            translate("title=Word*"),
            CoreQuery::Prefix {
                field: "title".to_string(),
                prefix: "word".to_string(),
                boost: None,
            }
        );
        assert_eq!(
            translate("title=???*"),
            CoreQuery::Wildcard {
                field: "title".to_string(),
                pattern: "???*".to_string(),
                boost: None,
            }
        );
        // single '*' after one character is not a prefix pattern
        assert!(!matches!(translate("title=a*"), CoreQuery::Prefix { .. }));
    }

    #[test]
    fn drilldown_field_splits_hierarchical_path() {
        assert_eq!(
            translate("category=books > fiction"),
            CoreQuery::DrillDown {
                field: "category".to_string(),
                path: vec!["books".to_string(), "fiction".to_string()],
                boost: None,
            }
        );
    }

    #[test]
    fn boost_survives_every_query_shape() {
        let expr = cql::parse("age >= 3").unwrap().with_boost(2.0);
        assert_eq!(
            translator().translate(&expr, None).unwrap(),
            CoreQuery::Range {
                field: "age".to_string(),
                lower: Some(RangeValue::Long(3)),
                upper: None,
                include_lower: true,
                include_upper: true,
                boost: Some(2.0),
            }
        );

        let expr = cql::parse("category=books").unwrap().with_boost(1.5);
        assert_eq!(
            translator().translate(&expr, None).unwrap(),
            CoreQuery::DrillDown {
                field: "category".to_string(),
                path: vec!["books".to_string()],
                boost: Some(1.5),
            }
        );

        let expr = cql::parse("title=???*").unwrap().with_boost(0.5);
        assert_eq!(
            translator().translate(&expr, None).unwrap(),
            CoreQuery::Wildcard {
                field: "title".to_string(),
                pattern: "???*".to_string(),
                boost: Some(0.5),
            }
        );
    }

    #[test]
    fn unsupported_relation_is_a_typed_error() {
        let err = translator()
            .translate(&cql::parse("title <> value").unwrap(), None)
            .unwrap_err();
        let err = err.downcast_ref::<Error>().unwrap();
        assert!(matches!(err, Error::UnsupportedQueryRelation { .. }));
        assert_eq!(
            err.to_string(),
            "Unsupported query relation '<>' for field 'title'"
        );
    }

    #[test]
    fn boolean_occur_mapping() {
        assert_eq!(
            translate("title=a AND untokenized.f=b"),
            CoreQuery::boolean(vec![
                (Occur::Must, CoreQuery::term("title", "a")),
                (Occur::Must, CoreQuery::term("untokenized.f", "b")),
            ])
        );
        assert_eq!(
            translate("title=a OR title=b"),
            CoreQuery::boolean(vec![
                (Occur::Should, CoreQuery::term("title", "a")),
                (Occur::Should, CoreQuery::term("title", "b")),
            ])
        );
        assert_eq!(
            translate("title=a NOT title=b"),
            CoreQuery::boolean(vec![
                (Occur::Must, CoreQuery::term("title", "a")),
                (Occur::MustNot, CoreQuery::term("title", "b")),
            ])
        );
    }

    #[test]
    fn bare_not_gets_a_match_all_guard() {
        let expr = cql::parse("title=a").unwrap().negated();
        assert_eq!(
            translator().translate(&expr, None).unwrap(),
            CoreQuery::boolean(vec![
                (Occur::Must, CoreQuery::MatchAll),
                (Occur::MustNot, CoreQuery::term("title", "a")),
            ])
        );
    }

    #[test]
    fn foreign_core_field_wraps_relational() {
        let mut cq = ComposedQuery::new("main");
        cq.add_match(
            MatchSpec::unique_key("main", "__key__.field"),
            MatchSpec::key("main2", "__key__.field"),
        )
        .unwrap();

        let query = translator()
            .translate(&cql::parse("main2.title=value").unwrap(), Some(&cq))
            .unwrap();
        assert_eq!(
            query,
            CoreQuery::Relational {
                core: "main2".to_string(),
                key: "__key__.field".to_string(),
                query: Box::new(CoreQuery::term("title", "valu")),
            }
        );
    }

    #[test]
    fn unqualified_term_searches_configured_fields() {
        let fields = vec![
            UnqualifiedField::new("title", 2.0),
            UnqualifiedField::new("untokenized.field2", 1.0),
        ];
        let query = translator()
            .translate_with(&cql::parse("word").unwrap(), Some(&fields), None)
            .unwrap();
        assert_eq!(
            query,
            CoreQuery::boolean(vec![
                (
                    Occur::Should,
                    CoreQuery::Term {
                        field: "title".to_string(),
                        value: "word".to_string(),
                        boost: Some(2.0),
                    }
                ),
                (
                    Occur::Should,
                    CoreQuery::Term {
                        field: "untokenized.field2".to_string(),
                        value: "word".to_string(),
                        boost: Some(1.0),
                    }
                ),
            ])
        );
    }

    #[test]
    fn phrase_dropped_for_fields_without_positions() {
        // "untokenized.*" stores no positions, so only "title" survives the
        // multi-word unqualified term
        let fields = vec![
            UnqualifiedField::new("title", 1.0),
            UnqualifiedField::new("untokenized.field2", 1.0),
        ];
        let query = translator()
            .translate_with(&cql::parse("\"two words\"").unwrap(), Some(&fields), None)
            .unwrap();
        assert_eq!(
            query,
            CoreQuery::Phrase {
                field: "title".to_string(),
                terms: vec!["two".to_string(), "words".to_string()],
                boost: Some(1.0),
            }
        );
    }
}
