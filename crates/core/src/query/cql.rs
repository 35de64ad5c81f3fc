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

//! Parser for the CQL subset accepted at the front door.
//!
//! Produces the generic [`Expression`] tree. Grammar: `OR` binds loosest,
//! then `AND`/`NOT` (CQL-style connectives, `a NOT b` reads `a AND -b`),
//! then parenthesized groups and leaves. A leaf is either a bare term, a
//! quoted phrase, or `field <relation> value` with relations
//! `=`, `==`, `exact`, `<`, `<=`, `>=`, `>`, `<>`. After an equality
//! relation, `>`-separated values chain into one hierarchical term
//! (`category=books > fiction`).

use super::expr::{BoolOp, Expression, Relation};
use crate::Error;

fn ws(input: &str) -> nom::IResult<&str, &str> {
    nom::character::complete::multispace0(input)
}

fn bare_token(input: &str) -> nom::IResult<&str, &str> {
    let (input, output) = nom::bytes::complete::take_while1(|c: char| {
        !c.is_whitespace() && !matches!(c, '(' | ')' | '"' | '=' | '<' | '>')
    })(input)?;
    Ok((input, output))
}

fn quoted(input: &str) -> nom::IResult<&str, &str> {
    let (input, _) = nom::character::complete::char('"')(input)?;
    let (input, output) = nom::bytes::complete::take_until("\"")(input)?;
    let (input, _) = nom::character::complete::char('"')(input)?;
    Ok((input, output))
}

fn value(input: &str) -> nom::IResult<&str, &str> {
    nom::branch::alt((quoted, bare_token))(input)
}

fn relation(input: &str) -> nom::IResult<&str, Relation> {
    let (input, _) = ws(input)?;
    nom::branch::alt((
        nom::combinator::value(Relation::EqEq, nom::bytes::complete::tag("==")),
        nom::combinator::value(Relation::Ne, nom::bytes::complete::tag("<>")),
        nom::combinator::value(Relation::Le, nom::bytes::complete::tag("<=")),
        nom::combinator::value(Relation::Ge, nom::bytes::complete::tag(">=")),
        nom::combinator::value(Relation::Eq, nom::bytes::complete::tag("=")),
        nom::combinator::value(Relation::Lt, nom::bytes::complete::tag("<")),
        nom::combinator::value(Relation::Gt, nom::bytes::complete::tag(">")),
        exact_relation,
    ))(input)
}

// leading whitespace is already consumed by `relation`; the trailing
// whitespace check keeps "exactly" from parsing as a relation
fn exact_relation(input: &str) -> nom::IResult<&str, Relation> {
    let (input, _) = nom::bytes::complete::tag_no_case("exact")(input)?;
    let (input, _) = nom::combinator::peek(nom::character::complete::multispace1)(input)?;
    Ok((input, Relation::Exact))
}

fn field_relation_leaf(input: &str) -> nom::IResult<&str, Expression> {
    let (input, field) = bare_token(input)?;
    let (input, rel) = relation(input)?;
    let (input, _) = ws(input)?;
    let (mut input, first) = value(input)?;
    let mut term = first.to_string();

    // `category=books > fiction` is one hierarchical term, not a comparison
    if matches!(rel, Relation::Eq | Relation::EqEq | Relation::Exact) {
        while let Ok((rest, segment)) = path_segment(input) {
            term.push_str(" > ");
            term.push_str(segment);
            input = rest;
        }
    }

    Ok((input, Expression::leaf(Some(field), rel, &term)))
}

fn path_segment(input: &str) -> nom::IResult<&str, &str> {
    let (input, _) = ws(input)?;
    let (input, _) = nom::character::complete::char('>')(input)?;
    let (input, _) = ws(input)?;
    value(input)
}

fn term_leaf(input: &str) -> nom::IResult<&str, Expression> {
    let (input, term) = value(input)?;
    Ok((input, Expression::term(term)))
}

fn group(input: &str) -> nom::IResult<&str, Expression> {
    let (input, _) = nom::character::complete::char('(')(input)?;
    let (input, expr) = or_expr(input)?;
    let (input, _) = ws(input)?;
    let (input, _) = nom::character::complete::char(')')(input)?;
    Ok((input, expr))
}

fn primary(input: &str) -> nom::IResult<&str, Expression> {
    let (input, _) = ws(input)?;
    nom::branch::alt((group, field_relation_leaf, term_leaf))(input)
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> nom::IResult<&'a str, &'a str> {
    move |input: &'a str| {
        let (input, _) = nom::character::complete::multispace1(input)?;
        let (input, output) = nom::bytes::complete::tag_no_case(word)(input)?;
        let (input, _) = nom::combinator::peek(nom::branch::alt((
            nom::character::complete::multispace1,
            nom::combinator::eof,
        )))(input)?;
        Ok((input, output))
    }
}

fn and_expr(input: &str) -> nom::IResult<&str, Expression> {
    let (mut input, first) = primary(input)?;
    let mut operands = vec![first];

    loop {
        if let Ok((rest, _)) = keyword("and")(input) {
            let (rest, operand) = primary(rest)?;
            operands.push(operand);
            input = rest;
        } else if let Ok((rest, _)) = keyword("not")(input) {
            let (rest, operand) = primary(rest)?;
            operands.push(operand.negated());
            input = rest;
        } else {
            break;
        }
    }

    if operands.len() == 1 {
        Ok((input, operands.pop().unwrap()))
    } else {
        Ok((input, Expression::and(operands)))
    }
}

fn or_expr(input: &str) -> nom::IResult<&str, Expression> {
    let (mut input, first) = and_expr(input)?;
    let mut operands = vec![first];

    while let Ok((rest, _)) = keyword("or")(input) {
        let (rest, operand) = and_expr(rest)?;
        operands.push(operand);
        input = rest;
    }

    if operands.len() == 1 {
        Ok((input, operands.pop().unwrap()))
    } else {
        Ok((input, Expression::or(operands)))
    }
}

pub fn parse(query: &str) -> crate::Result<Expression, Error> {
    match or_expr(query) {
        Ok((rest, expr)) if rest.trim().is_empty() => Ok(expr),
        Ok((rest, _)) => Err(Error::QueryParse(format!(
            "trailing input '{}' in query '{}'",
            rest.trim(),
            query
        ))),
        Err(e) => Err(Error::QueryParse(format!("{e} in query '{query}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::expr::Node;

    #[test]
    fn single_term() {
        assert_eq!(parse("value").unwrap(), Expression::term("value"));
        assert_eq!(parse("*").unwrap(), Expression::term("*"));
    }

    #[test]
    fn field_relations() {
        assert_eq!(parse("f=v").unwrap(), Expression::eq("f", "v"));
        assert_eq!(
            parse("f == v").unwrap(),
            Expression::leaf(Some("f"), Relation::EqEq, "v")
        );
        assert_eq!(
            parse("age >= 3").unwrap(),
            Expression::leaf(Some("age"), Relation::Ge, "3")
        );
        assert_eq!(
            parse("f exact \"two words\"").unwrap(),
            Expression::leaf(Some("f"), Relation::Exact, "two words")
        );
        assert_eq!(
            parse("f <> v").unwrap(),
            Expression::leaf(Some("f"), Relation::Ne, "v")
        );
    }

    #[test]
    fn quoted_phrase_term() {
        assert_eq!(
            parse("\"test term\"").unwrap(),
            Expression::term("test term")
        );
    }

    #[test]
    fn boolean_precedence() {
        // AND binds tighter than OR.
        let expr = parse("a=b AND c=d OR e=f").unwrap();
        assert_eq!(
            expr,
            Expression::or(vec![
                Expression::and(vec![Expression::eq("a", "b"), Expression::eq("c", "d")]),
                Expression::eq("e", "f"),
            ])
        );
    }

    #[test]
    fn chains_flatten() {
        let expr = parse("a=1 AND b=2 AND c=3").unwrap();
        match expr.node {
            Node::Boolean { operands, .. } => assert_eq!(operands.len(), 3),
            _ => panic!("expected boolean node"),
        }
    }

    #[test]
    fn not_connective_sets_must_not() {
        let expr = parse("a=b NOT c=d").unwrap();
        assert_eq!(
            expr,
            Expression::and(vec![
                Expression::eq("a", "b"),
                Expression::eq("c", "d").negated(),
            ])
        );
    }

    #[test]
    fn parenthesized_groups() {
        let expr = parse("(a=b OR c=d) AND e=f").unwrap();
        assert_eq!(
            expr,
            Expression::and(vec![
                Expression::or(vec![Expression::eq("a", "b"), Expression::eq("c", "d")]),
                Expression::eq("e", "f"),
            ])
        );
    }

    #[test]
    fn hierarchical_path_terms() {
        assert_eq!(
            parse("category=books > fiction").unwrap(),
            Expression::eq("category", "books > fiction")
        );
        assert_eq!(
            parse("category=books > fiction AND f=v").unwrap(),
            Expression::and(vec![
                Expression::eq("category", "books > fiction"),
                Expression::eq("f", "v"),
            ])
        );
        // comparison relations never absorb a path
        assert_eq!(
            parse("age > 3").unwrap(),
            Expression::leaf(Some("age"), Relation::Gt, "3")
        );
    }

    #[test]
    fn dotted_field_names() {
        assert_eq!(
            parse("core2.field=value").unwrap(),
            Expression::eq("core2.field", "value")
        );
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(parse("a=b c=d").is_err());
        assert!(parse("").is_err());
    }

    proptest::proptest! {
        #[test]
        fn never_panics(query in "[a-zA-Z0-9 =<>()\"*._-]{0,60}") {
            let _ = parse(&query);
        }
    }
}
