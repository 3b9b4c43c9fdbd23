//! Query expression parsing and evaluation.
//!
//! A query arrives as a structured value: either a bare expression term or
//! an object of the form `{"expression": <term>, "since": <clockspec>}`.
//! Terms compose with `allof`/`anyof`/`not`; leaves match on existence,
//! name, suffix, or glob. The `find` and `since` commands instead take a
//! trailing list of glob patterns matched against relative names.

use globset::{Glob, GlobMatcher, GlobSet, GlobSetBuilder};
use serde_json::Value;

use crate::files::FileRecord;
use crate::protocol::RequestError;

/// One node of a parsed query expression.
#[derive(Debug, Clone)]
pub enum Expr {
    True,
    False,
    Exists,
    Not(Box<Expr>),
    AllOf(Vec<Expr>),
    AnyOf(Vec<Expr>),
    /// Exact relative-name match against any of the listed names.
    Name(Vec<String>),
    /// Extension suffix match, case-insensitive.
    Suffix(String),
    /// Glob match against the file's basename.
    Match(GlobMatcher),
}

/// A parsed standing query: the expression plus an optional since term
/// taken from the object form (resolved by the caller against the root).
#[derive(Debug, Clone)]
pub struct Query {
    pub expr: Expr,
    pub since: Option<Value>,
}

fn parse_error(msg: impl Into<String>) -> RequestError {
    RequestError::Collaborator {
        message: format!("failed to parse query: {}", msg.into()),
    }
}

fn parse_term(value: &Value) -> Result<Expr, RequestError> {
    match value {
        Value::String(s) => match s.as_str() {
            "true" => Ok(Expr::True),
            "false" => Ok(Expr::False),
            "exists" => Ok(Expr::Exists),
            other => Err(parse_error(format!("unknown expression term '{}'", other))),
        },
        Value::Array(items) => {
            let name = items
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| parse_error("expected term name as element 0"))?;
            match name {
                "not" => {
                    if items.len() != 2 {
                        return Err(parse_error("'not' takes exactly one argument"));
                    }
                    Ok(Expr::Not(Box::new(parse_term(&items[1])?)))
                }
                "allof" => Ok(Expr::AllOf(
                    items[1..].iter().map(parse_term).collect::<Result<_, _>>()?,
                )),
                "anyof" => Ok(Expr::AnyOf(
                    items[1..].iter().map(parse_term).collect::<Result<_, _>>()?,
                )),
                "name" => {
                    let arg = items
                        .get(1)
                        .ok_or_else(|| parse_error("'name' takes an argument"))?;
                    let names = match arg {
                        Value::String(s) => vec![s.clone()],
                        Value::Array(list) => list
                            .iter()
                            .map(|v| {
                                v.as_str()
                                    .map(str::to_string)
                                    .ok_or_else(|| parse_error("'name' list must hold strings"))
                            })
                            .collect::<Result<_, _>>()?,
                        _ => return Err(parse_error("'name' takes a string or string list")),
                    };
                    Ok(Expr::Name(names))
                }
                "suffix" => {
                    let suffix = items
                        .get(1)
                        .and_then(Value::as_str)
                        .ok_or_else(|| parse_error("'suffix' takes a string argument"))?;
                    Ok(Expr::Suffix(suffix.to_ascii_lowercase()))
                }
                "match" => {
                    let pattern = items
                        .get(1)
                        .and_then(Value::as_str)
                        .ok_or_else(|| parse_error("'match' takes a string argument"))?;
                    let glob = Glob::new(pattern)
                        .map_err(|e| parse_error(format!("bad match pattern: {}", e)))?;
                    Ok(Expr::Match(glob.compile_matcher()))
                }
                other => Err(parse_error(format!("unknown expression term '{}'", other))),
            }
        }
        _ => Err(parse_error("expected a string or array expression")),
    }
}

impl Query {
    /// Parses the query argument of `query` and `subscribe`.
    ///
    /// `null` means match-everything; an object may carry `expression`
    /// and `since` fields; anything else is a bare expression term.
    pub fn parse(value: &Value) -> Result<Self, RequestError> {
        match value {
            Value::Null => Ok(Query { expr: Expr::True, since: None }),
            Value::Object(obj) => {
                let expr = match obj.get("expression") {
                    Some(e) => parse_term(e)?,
                    None => Expr::True,
                };
                Ok(Query { expr, since: obj.get("since").cloned() })
            }
            other => Ok(Query { expr: parse_term(other)?, since: None }),
        }
    }

    pub fn matches(&self, name: &str, rec: &FileRecord) -> bool {
        eval(&self.expr, name, rec)
    }
}

fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn eval(expr: &Expr, name: &str, rec: &FileRecord) -> bool {
    match expr {
        Expr::True => true,
        Expr::False => false,
        Expr::Exists => rec.exists,
        Expr::Not(inner) => !eval(inner, name, rec),
        Expr::AllOf(terms) => terms.iter().all(|t| eval(t, name, rec)),
        Expr::AnyOf(terms) => terms.iter().any(|t| eval(t, name, rec)),
        Expr::Name(names) => names.iter().any(|n| n == name),
        Expr::Suffix(suffix) => basename(name)
            .rsplit_once('.')
            .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case(suffix)),
        Expr::Match(matcher) => matcher.is_match(basename(name)),
    }
}

/// Builds a matcher from the trailing pattern arguments of `find`/`since`.
///
/// Returns `None` when no patterns were given (match everything).
pub fn parse_name_patterns(args: &[Value]) -> Result<Option<GlobSet>, RequestError> {
    if args.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for (i, arg) in args.iter().enumerate() {
        let pattern = arg.as_str().ok_or_else(|| RequestError::BadArgType {
            index: i,
            expected: "a string pattern".into(),
        })?;
        let glob = Glob::new(pattern).map_err(|e| RequestError::Collaborator {
            message: format!("bad pattern '{}': {}", pattern, e),
        })?;
        builder.add(glob);
    }
    let set = builder.build().map_err(|e| RequestError::Collaborator {
        message: format!("failed to compile patterns: {}", e),
    })?;
    Ok(Some(set))
}

/// Applies an optional pattern set to a relative name.
pub fn patterns_match(set: &Option<GlobSet>, name: &str) -> bool {
    match set {
        None => true,
        Some(set) => set.is_match(basename(name)) || set.is_match(name),
    }
}
