//! Container list queries.
//!
//! A query is a whitespace-separated list of terms, all of which must
//! hold, evaluated against the JSON form of a [`Cntrinfo`]:
//!
//! - `path` holds when the field exists and is not null;
//! - `path=glob` holds when some value at `path` matches `glob`;
//! - `path!=glob` holds when no value at `path` matches `glob`.
//!
//! Paths are dot-separated field names (`meta.hostname`). Arrays along the
//! way are searched element by element, so `tags=web` holds for any
//! container tagged `web`. Globs support `*` and `?` and may be quoted to
//! include spaces. The empty query matches everything.
//!
//! A query whose first word is `<node-id>,...` is scoped to that node; the
//! text after the comma is the query proper.

use burrow_common::constants::ID_SEPARATOR;
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::Cntrinfo;
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, multispace0, multispace1},
    combinator::{all_consuming, opt, value},
    multi::{separated_list0, separated_list1},
    sequence::delimited,
};
use regex::Regex;
use serde_json::Value;

/// A parsed query.
#[derive(Debug, Clone)]
pub struct Query {
    node: Option<String>,
    terms: Vec<Term>,
}

#[derive(Debug, Clone)]
struct Term {
    path: Vec<String>,
    test: Test,
}

#[derive(Debug, Clone)]
enum Test {
    Present,
    Matches(Regex),
    Differs(Regex),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
}

type RawTerm<'a> = (Vec<&'a str>, Option<(Op, &'a str)>);

impl Query {
    /// Parses a query.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::InvalidArgument`] for malformed input.
    pub fn parse(input: &str) -> Result<Self> {
        let (node, expr) = split_scope(input);
        let (_, raw) = all_consuming(terms).parse(expr).map_err(|e| BurrowError::InvalidArgument {
            message: format!("invalid query {input:?}: {e}"),
        })?;
        let terms = raw
            .into_iter()
            .map(|(path, op)| {
                let test = match op {
                    None => Test::Present,
                    Some((Op::Eq, glob)) => Test::Matches(compile_glob(glob)?),
                    Some((Op::Ne, glob)) => Test::Differs(compile_glob(glob)?),
                };
                Ok(Term {
                    path: path.into_iter().map(str::to_string).collect(),
                    test,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            node: node.map(str::to_string),
            terms,
        })
    }

    /// The node the query is scoped to, if any.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// Returns `true` if the query has no terms.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Evaluates the query against a container description.
    pub fn matches(&self, info: &Cntrinfo) -> bool {
        if self.terms.is_empty() {
            return true;
        }
        let Ok(doc) = serde_json::to_value(info) else {
            return false;
        };
        self.terms.iter().all(|term| term.holds(&doc))
    }
}

impl Term {
    fn holds(&self, doc: &Value) -> bool {
        let mut found = Vec::new();
        collect(doc, &self.path, &mut found);
        match &self.test {
            Test::Present => found.iter().any(|v| !v.is_null()),
            Test::Matches(glob) => found.iter().any(|v| scalar_matches(v, glob)),
            Test::Differs(glob) => !found.iter().any(|v| scalar_matches(v, glob)),
        }
    }
}

/// Splits off a leading `<node-id>,` scope.
pub fn split_scope(input: &str) -> (Option<&str>, &str) {
    let trimmed = input.trim_start();
    let first = trimmed.split_whitespace().next().unwrap_or_default();
    match first.split_once(ID_SEPARATOR) {
        Some((node, _)) if !node.is_empty() && !node.contains(['=', '!', '"']) => {
            (Some(node), &trimmed[node.len() + ID_SEPARATOR.len_utf8()..])
        }
        _ => (None, input),
    }
}

/// Gathers every value at `path`, descending into arrays.
fn collect<'v>(value: &'v Value, path: &[String], out: &mut Vec<&'v Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect(item, path, out);
            }
        }
        _ => match path.split_first() {
            None => out.push(value),
            Some((field, rest)) => {
                if let Some(child) = value.get(field) {
                    collect(child, rest, out);
                }
            }
        },
    }
}

fn scalar_matches(value: &Value, glob: &Regex) -> bool {
    match value {
        Value::String(s) => glob.is_match(s),
        Value::Number(n) => glob.is_match(&n.to_string()),
        Value::Bool(b) => glob.is_match(if *b { "true" } else { "false" }),
        Value::Null | Value::Array(_) | Value::Object(_) => false,
    }
}

fn compile_glob(glob: &str) -> Result<Regex> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push_str("(?s)^");
    let mut literal = [0_u8; 4];
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(other.encode_utf8(&mut literal))),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|e| BurrowError::InvalidArgument {
        message: format!("invalid pattern {glob:?}: {e}"),
    })
}

fn segment(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-').parse(input)
}

fn path(input: &str) -> IResult<&str, Vec<&str>> {
    separated_list1(char('.'), segment).parse(input)
}

fn operator(input: &str) -> IResult<&str, Op> {
    alt((value(Op::Ne, tag("!=")), value(Op::Eq, tag("=")))).parse(input)
}

fn pattern(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
        take_while1(|c: char| !c.is_whitespace()),
    ))
    .parse(input)
}

fn term(input: &str) -> IResult<&str, RawTerm<'_>> {
    (path, opt((operator, pattern))).parse(input)
}

fn terms(input: &str) -> IResult<&str, Vec<RawTerm<'_>>> {
    delimited(multispace0, separated_list0(multispace1, term), multispace0).parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_common::meta::Metainfo;

    fn info() -> Cntrinfo {
        Cntrinfo {
            id: "node-a,4".into(),
            rootfs: "/srv/rootfs/alpine".into(),
            tags: vec!["web".into(), "prod".into()],
            meta: Metainfo {
                name: "nginx".into(),
                hostname: "edge one".into(),
                uid_map_size: 1,
                ..Metainfo::default()
            },
            created_at: "2026-10-19T00:00:00Z".into(),
        }
    }

    fn matches(query: &str) -> bool {
        Query::parse(query).unwrap().matches(&info())
    }

    #[test]
    fn empty_query_matches_everything() {
        assert!(matches(""));
        assert!(matches("   "));
        assert!(Query::parse("").unwrap().is_empty());
    }

    #[test]
    fn presence_checks_non_null_fields() {
        assert!(matches("meta.name"));
        assert!(matches("tags"));
        assert!(!matches("meta.nothing"));
    }

    #[test]
    fn equality_uses_globs_and_searches_arrays() {
        assert!(matches("tags=web"));
        assert!(matches("tags=pr?d"));
        assert!(matches("rootfs=/srv/*"));
        assert!(!matches("tags=db"));
        assert!(!matches("rootfs=/srv"));
    }

    #[test]
    fn numbers_and_quoted_patterns() {
        assert!(matches("meta.uid_map_size=1"));
        assert!(matches(r#"meta.hostname="edge one""#));
        assert!(matches(r#"meta.hostname="edge*""#));
    }

    #[test]
    fn inequality_holds_when_nothing_matches() {
        assert!(matches("tags!=db"));
        assert!(!matches("tags!=web"));
        assert!(matches("meta.nothing!=x"));
    }

    #[test]
    fn all_terms_must_hold() {
        assert!(matches("tags=web meta.name=nginx"));
        assert!(!matches("tags=web meta.name=redis"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        assert!(!matches("meta.name=ngin."));
        assert!(matches("id=node-a,4"));
    }

    #[test]
    fn node_scope_is_split_off() {
        let query = Query::parse("node-a,tags=web").unwrap();
        assert_eq!(query.node(), Some("node-a"));
        assert!(query.matches(&info()));

        let query = Query::parse("node-b,").unwrap();
        assert_eq!(query.node(), Some("node-b"));
        assert!(query.is_empty());

        assert_eq!(split_scope("id=node-a,4").0, None);
        assert_eq!(split_scope("tags=a,b").0, None);
    }

    #[test]
    fn malformed_queries_are_rejected() {
        for bad in ["tags=", "=web", "tags!", "a..b", "tags =web"] {
            assert!(
                matches!(Query::parse(bad), Err(BurrowError::InvalidArgument { .. })),
                "{bad:?} should be rejected"
            );
        }
    }
}
