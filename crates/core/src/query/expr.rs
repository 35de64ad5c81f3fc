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

//! The generic boolean query-expression tree.
//!
//! An expression is either a leaf (field, relation, term) or a boolean node
//! over an ordered operand list. Any node can carry a `must_not` flag. The
//! tree is produced by a query parser and consumed by the translator and the
//! filter extractor; equality is structural.

use std::collections::{BTreeSet, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Relation {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "==")]
    EqEq,
    #[serde(rename = "exact")]
    Exact,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<>")]
    Ne,
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Relation::Eq => "=",
            Relation::EqEq => "==",
            Relation::Exact => "exact",
            Relation::Lt => "<",
            Relation::Le => "<=",
            Relation::Ge => ">=",
            Relation::Gt => ">",
            Relation::Ne => "<>",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Leaf {
    pub index: Option<String>,
    pub relation: Relation,
    pub term: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boost: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Node {
    Leaf(Leaf),
    Boolean { op: BoolOp, operands: Vec<Expression> },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Expression {
    #[serde(default, skip_serializing_if = "is_false")]
    pub must_not: bool,
    pub node: Node,
}

fn is_false(b: &bool) -> bool {
    !b
}

impl Expression {
    pub fn leaf(index: Option<&str>, relation: Relation, term: &str) -> Self {
        Expression {
            must_not: false,
            node: Node::Leaf(Leaf {
                index: index.map(|s| s.to_string()),
                relation,
                term: term.to_string(),
                boost: None,
            }),
        }
    }

    pub fn term(term: &str) -> Self {
        Self::leaf(None, Relation::Eq, term)
    }

    pub fn eq(index: &str, term: &str) -> Self {
        Self::leaf(Some(index), Relation::Eq, term)
    }

    pub fn and(operands: Vec<Expression>) -> Self {
        Expression {
            must_not: false,
            node: Node::Boolean {
                op: BoolOp::And,
                operands,
            },
        }
    }

    pub fn or(operands: Vec<Expression>) -> Self {
        Expression {
            must_not: false,
            node: Node::Boolean {
                op: BoolOp::Or,
                operands,
            },
        }
    }

    pub fn negated(mut self) -> Self {
        self.must_not = !self.must_not;
        self
    }

    pub fn with_boost(mut self, boost: f32) -> Self {
        if let Node::Leaf(leaf) = &mut self.node {
            leaf.boost = Some(boost);
        }
        self
    }

    pub fn as_leaf(&self) -> Option<&Leaf> {
        match &self.node {
            Node::Leaf(leaf) => Some(leaf),
            Node::Boolean { .. } => None,
        }
    }
}

/// Splits a `core.field` name into its core prefix and the bare field name.
///
/// A field starting with the home core's name is never split; this avoids
/// ambiguity when the home core name is itself a prefix of a field name.
/// A dot prefix only counts as a core prefix when it names a known other
/// core; everything else belongs to the (ambient) home core.
pub fn split_core_prefix<'a>(
    fieldname: &'a str,
    home: &str,
    known_cores: &HashSet<String>,
) -> (Option<String>, &'a str) {
    // "home." as a literal prefix, not just any field whose name begins
    // with the home core's name
    if fieldname
        .strip_prefix(home)
        .is_some_and(|rest| rest.starts_with('.'))
    {
        return (None, fieldname);
    }

    if let Some((prefix, rest)) = fieldname.split_once('.') {
        if prefix != home && known_cores.contains(prefix) {
            return (Some(prefix.to_string()), rest);
        }
    }

    (None, fieldname)
}

/// The set of distinct cores referenced anywhere inside an expression.
///
/// Unqualified leaves count as references to the home core.
pub fn cores_referenced(
    expr: &Expression,
    home: &str,
    known_cores: &HashSet<String>,
) -> BTreeSet<String> {
    let mut cores = BTreeSet::new();
    collect_cores(expr, home, known_cores, &mut cores);
    cores
}

fn collect_cores(
    expr: &Expression,
    home: &str,
    known_cores: &HashSet<String>,
    cores: &mut BTreeSet<String>,
) {
    match &expr.node {
        Node::Leaf(leaf) => {
            let core = leaf
                .index
                .as_deref()
                .and_then(|field| split_core_prefix(field, home, known_cores).0)
                .unwrap_or_else(|| home.to_string());
            cores.insert(core);
        }
        Node::Boolean { operands, .. } => {
            for operand in operands {
                collect_cores(operand, home, known_cores, cores);
            }
        }
    }
}

/// Removes the `core.` prefix from every leaf field name inside the tree.
pub fn strip_core_prefix(expr: &mut Expression, core: &str) {
    match &mut expr.node {
        Node::Leaf(leaf) => {
            if let Some(field) = &leaf.index {
                if let Some(rest) = field.strip_prefix(core).and_then(|r| r.strip_prefix('.')) {
                    leaf.index = Some(rest.to_string());
                }
            }
        }
        Node::Boolean { operands, .. } => {
            for operand in operands {
                strip_core_prefix(operand, core);
            }
        }
    }
}
