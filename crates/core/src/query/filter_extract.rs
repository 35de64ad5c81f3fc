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

//! Splits a mixed-core expression into a home-core residual and per-core
//! filter lists.
//!
//! The top-level AND operands are routed by the set of cores their subtree
//! references. An operand touching exactly one foreign core moves, prefixes
//! stripped, into that core's filter list; everything else stays in the
//! residual. A residual that still mixes cores after the split is rejected.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::expr::{cores_referenced, strip_core_prefix, BoolOp, Expression, Node};
use crate::Error;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Extracted {
    /// What remains of the query for the home core, `None` if every operand
    /// was extracted.
    pub residual: Option<Expression>,
    /// Extracted subtrees per foreign core, in original operand order. A
    /// `must_not`-flagged entry is an exclude filter.
    pub filters: BTreeMap<String, Vec<Expression>>,
}

pub fn extract(
    expr: &Expression,
    home: &str,
    known_cores: &HashSet<String>,
) -> Result<Extracted, Error> {
    let operands: Vec<Expression> = match &expr.node {
        Node::Boolean {
            op: BoolOp::And,
            operands,
        } if !expr.must_not => operands.clone(),
        _ => vec![expr.clone()],
    };

    let mut residual = Vec::new();
    let mut filters: BTreeMap<String, Vec<Expression>> = BTreeMap::new();

    for mut operand in operands {
        let cores = cores_referenced(&operand, home, known_cores);
        match single_foreign_core(&cores, home) {
            Some(core) => {
                strip_core_prefix(&mut operand, &core);
                filters.entry(core).or_default().push(operand);
            }
            None => residual.push(operand),
        }
    }

    let residual = match residual.len() {
        0 => None,
        1 => residual.into_iter().next(),
        _ => Some(Expression::and(residual)),
    };

    if let Some(residual) = &residual {
        let remaining = cores_referenced(residual, home, known_cores);
        if remaining.iter().any(|core| core != home) {
            return Err(Error::TooComplexQueryExpression);
        }
    }

    Ok(Extracted { residual, filters })
}

fn single_foreign_core(cores: &BTreeSet<String>, home: &str) -> Option<String> {
    if cores.len() != 1 {
        return None;
    }
    cores.iter().next().filter(|core| *core != home).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::cql;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    fn cores() -> HashSet<String> {
        ["core1".to_string(), "core2".to_string()].into()
    }

    fn parse(q: &str) -> Expression {
        cql::parse(q).unwrap()
    }

    #[test]
    fn splits_foreign_and_operand_into_filter() {
        let result = extract(&parse("core2.a=b AND f=v"), "core1", &cores()).unwrap();
        assert_eq!(result.residual, Some(parse("f=v")));
        assert_eq!(result.filters, btreemap! {"core2".to_string() => vec![parse("a=b")]});
    }

    #[test]
    fn single_core_expression_passes_through() {
        let expr = parse("f=v AND g=w");
        let result = extract(&expr, "core1", &cores()).unwrap();
        assert_eq!(result.residual, Some(expr));
        assert!(result.filters.is_empty());
    }

    #[test]
    fn extraction_is_idempotent() {
        let first = extract(&parse("core2.a=b AND f=v"), "core1", &cores()).unwrap();
        let residual = first.residual.unwrap();
        let second = extract(&residual, "core1", &cores()).unwrap();
        assert_eq!(second.residual, Some(residual));
        assert!(second.filters.is_empty());
    }

    #[test]
    fn fully_extracted_query_leaves_no_residual() {
        let result = extract(&parse("core2.a=b"), "core1", &cores()).unwrap();
        assert_eq!(result.residual, None);
        assert_eq!(result.filters, btreemap! {"core2".to_string() => vec![parse("a=b")]});
    }

    #[test]
    fn whole_or_subtree_moves_when_single_core() {
        let result = extract(&parse("(core2.a=b OR core2.c=d) AND f=v"), "core1", &cores()).unwrap();
        assert_eq!(result.residual, Some(parse("f=v")));
        assert_eq!(
            result.filters,
            btreemap! {"core2".to_string() => vec![parse("a=b OR c=d")]}
        );
    }

    #[test]
    fn must_not_flag_survives_extraction() {
        let result = extract(&parse("f=v NOT core2.a=b"), "core1", &cores()).unwrap();
        assert_eq!(result.residual, Some(parse("f=v")));
        assert_eq!(
            result.filters,
            btreemap! {"core2".to_string() => vec![parse("a=b").negated()]}
        );
    }

    #[test]
    fn or_across_cores_is_too_complex() {
        let err = extract(&parse("core2.a=b OR f=v"), "core1", &cores()).unwrap_err();
        assert!(matches!(err, Error::TooComplexQueryExpression));
    }

    #[test]
    fn unknown_prefix_belongs_to_home() {
        // "dc.title" is not a core, so the dot is part of the field name
        let result = extract(&parse("dc.title=something AND f=v"), "core1", &cores()).unwrap();
        assert_eq!(result.residual, Some(parse("dc.title=something AND f=v")));
        assert!(result.filters.is_empty());
    }
}
