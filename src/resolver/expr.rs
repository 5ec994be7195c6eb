//! A minimal expression language for deriving rate-limit keys from request
//! attributes, deliberately far short of a general-purpose scripting
//! language: no control flow, no arithmetic beyond string concatenation, no
//! way to call back into the host beyond reading one of four fixed
//! bindings.
//!
//! Grammar:
//!   expr    := term ("+" term)*
//!   term    := binding | index | literal
//!   binding := "#" identifier
//!   index   := binding "[" (string | integer) "]"
//!   literal := '"' ... '"'
//!
//! `identifier` is one of `user`, `ip`, `args`, `headers`. `ip` is the only
//! binding usable on its own (it resolves to a scalar); the other three are
//! map-valued and must be indexed.

use crate::error::{RateLimitError, Result};
use std::collections::HashMap;

pub const MARKER: char = '#';

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Literal(String),
    Binding(String),
    Index(String, String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpr {
    terms: Vec<Term>,
}

/// Bindings visible to a compiled expression. Nothing outside these four
/// maps/scalars is reachable — the sandbox's "read-only, small vocabulary"
/// property is structural, not merely policy.
///
/// `args` is an ordered sequence (method call arguments), indexed by
/// position (`#args[0]`); `headers` is case-insensitive by name, matching
/// how the surrounding framework glue would have parsed them off the wire.
#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    pub user: HashMap<String, String>,
    pub ip: String,
    pub args: Vec<String>,
    pub headers: HeaderMap,
}

/// Case-insensitive header lookup. Headers arrive with whatever casing the
/// client sent; the sandbox binding must not care.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap(HashMap<String, String>);

impl HeaderMap {
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

impl<const N: usize> From<[(&str, &str); N]> for HeaderMap {
    fn from(pairs: [(&str, &str); N]) -> Self {
        let mut map = HeaderMap::default();
        for (k, v) in pairs {
            map.insert(k, v);
        }
        map
    }
}

pub fn parse(expression: &str) -> Result<CompiledExpr> {
    let mut terms = Vec::new();
    for raw in split_top_level(expression, '+') {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(RateLimitError::security("empty term in key expression"));
        }
        terms.push(parse_term(raw)?);
    }
    if terms.is_empty() {
        return Err(RateLimitError::security("key expression has no terms"));
    }
    Ok(CompiledExpr { terms })
}

fn parse_term(raw: &str) -> Result<Term> {
    if let Some(lit) = raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Ok(Term::Literal(lit.to_string()));
    }
    if let Some(rest) = raw.strip_prefix(MARKER) {
        if let Some(bracket) = rest.find('[') {
            let ident = &rest[..bracket];
            let inside = rest[bracket + 1..]
                .strip_suffix(']')
                .ok_or_else(|| RateLimitError::security(format!("unterminated index in '{raw}'")))?;
            let key = inside
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .unwrap_or(inside);
            validate_identifier(ident)?;
            return Ok(Term::Index(ident.to_string(), key.to_string()));
        }
        validate_identifier(rest)?;
        return Ok(Term::Binding(rest.to_string()));
    }
    Err(RateLimitError::security(format!(
        "term '{raw}' is neither a quoted literal nor a '#' binding"
    )))
}

fn validate_identifier(ident: &str) -> Result<()> {
    match ident {
        "user" | "ip" | "args" | "headers" => Ok(()),
        other => Err(RateLimitError::security(format!(
            "unknown binding '{other}', expected one of user/ip/args/headers"
        ))),
    }
}

/// Splits on `sep` but not inside `"..."` or `[...]`, so literals and index
/// keys containing `+` are left intact.
fn split_top_level(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut bracket_depth = 0i32;
    for c in s.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '[' if !in_quotes => {
                bracket_depth += 1;
                current.push(c);
            }
            ']' if !in_quotes => {
                bracket_depth -= 1;
                current.push(c);
            }
            c if c == sep && !in_quotes && bracket_depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    parts.push(current);
    parts
}

impl CompiledExpr {
    pub fn evaluate(&self, ctx: &ResolveContext) -> Result<String> {
        let mut out = String::new();
        for term in &self.terms {
            match term {
                Term::Literal(s) => out.push_str(s),
                Term::Binding(ident) => out.push_str(&resolve_scalar(ident, ctx)?),
                Term::Index(ident, key) => out.push_str(resolve_index(ident, key, ctx)?.unwrap_or("null")),
            }
        }
        Ok(out)
    }
}

fn resolve_scalar<'a>(ident: &str, ctx: &'a ResolveContext) -> Result<&'a str> {
    match ident {
        "ip" => Ok(ctx.ip.as_str()),
        other => Err(RateLimitError::security(format!(
            "binding '{other}' is map-valued and must be indexed, e.g. #{other}[key]"
        ))),
    }
}

fn resolve_index<'a>(ident: &str, key: &str, ctx: &'a ResolveContext) -> Result<Option<&'a str>> {
    match ident {
        "user" => Ok(ctx.user.get(key).map(String::as_str)),
        "headers" => Ok(ctx.headers.get(key)),
        "args" => {
            let idx: usize = key.parse().map_err(|_| {
                RateLimitError::security(format!("args index '{key}' is not a non-negative integer"))
            })?;
            Ok(ctx.args.get(idx).map(String::as_str))
        }
        "ip" => Err(RateLimitError::security(
            "binding 'ip' is scalar and cannot be indexed",
        )),
        other => Err(RateLimitError::security(format!("unknown binding '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ResolveContext {
        let mut user = HashMap::new();
        user.insert("id".to_string(), "42".to_string());
        ResolveContext {
            user,
            ip: "10.0.0.1".to_string(),
            args: vec!["first".to_string(), "second".to_string()],
            headers: HeaderMap::from([("X-Api-Key", "abc123")]),
        }
    }

    #[test]
    fn concatenates_literal_and_index() {
        let expr = parse(r#""user:" + #user[id]"#).unwrap();
        assert_eq!(expr.evaluate(&ctx()).unwrap(), "user:42");
    }

    #[test]
    fn scalar_binding_resolves_directly() {
        let expr = parse("#ip").unwrap();
        assert_eq!(expr.evaluate(&ctx()).unwrap(), "10.0.0.1");
    }

    #[test]
    fn missing_key_resolves_to_the_literal_null() {
        let expr = parse(r#""u:" + #user[missing]"#).unwrap();
        assert_eq!(expr.evaluate(&ctx()).unwrap(), "u:null");
    }

    #[test]
    fn bare_missing_binding_resolves_to_the_literal_null() {
        let expr = parse("#user[missing]").unwrap();
        assert_eq!(expr.evaluate(&ctx()).unwrap(), "null");
    }

    #[test]
    fn unindexed_map_binding_is_rejected() {
        assert!(parse("#user").unwrap().evaluate(&ctx()).is_err());
    }

    #[test]
    fn unknown_binding_rejected_at_parse_time() {
        assert!(parse("#secrets[aws_key]").is_err());
    }

    #[test]
    fn args_is_indexed_by_position() {
        let expr = parse("#args[0]").unwrap();
        assert_eq!(expr.evaluate(&ctx()).unwrap(), "first");
        let expr = parse("#args[1]").unwrap();
        assert_eq!(expr.evaluate(&ctx()).unwrap(), "second");
        let expr = parse("#args[5]").unwrap();
        assert_eq!(expr.evaluate(&ctx()).unwrap(), "null");
    }

    #[test]
    fn headers_lookup_is_case_insensitive() {
        let expr = parse(r#"#headers["x-api-key"]"#).unwrap();
        assert_eq!(expr.evaluate(&ctx()).unwrap(), "abc123");
    }

    #[test]
    fn non_numeric_args_index_is_a_security_rejection() {
        assert!(parse(r#"#args["x"]"#).unwrap().evaluate(&ctx()).is_err());
    }
}
