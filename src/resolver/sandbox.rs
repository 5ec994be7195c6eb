use crate::error::{RateLimitError, Result};

/// Case-insensitive substrings that must never appear in a key expression.
/// This is defense in depth on top of the grammar itself (which has no
/// statement, loop, or I/O form to exploit) — it exists so an expression
/// that merely *looks* like it reaches for something dangerous is rejected
/// before it is even parsed, rather than relying solely on the parser
/// rejecting it for syntactic reasons.
const BASE_BLACKLIST: &[&str] = &[
    "eval", "exec", "system", "process", "env", "import", "require",
    "__proto__", "constructor", "function", "script", "scriptengine",
    "introspector", "jndi", "rmi", "methodhandle", "classloader",
    "reflect", "runtime",
];

pub fn check(expression: &str, max_len: usize, max_bracket_depth: u32, extra_blacklist: &[String]) -> Result<()> {
    if expression.len() > max_len {
        return Err(RateLimitError::security(format!(
            "expression length {} exceeds limit {max_len}",
            expression.len()
        )));
    }

    let lower = expression.to_ascii_lowercase();
    for term in BASE_BLACKLIST.iter().copied().chain(extra_blacklist.iter().map(String::as_str)) {
        if lower.contains(&term.to_ascii_lowercase()) {
            return Err(RateLimitError::security(format!(
                "expression contains blacklisted term '{term}'"
            )));
        }
    }

    // Depth is tracked over all three bracket kinds, not just `[]`: the
    // grammar itself only ever nests `[]`, but a deeply nested `()`/`{}` run
    // is exactly the shape a scripting-language injection attempt takes.
    let mut depth: u32 = 0;
    let mut max_depth: u32 = 0;
    for c in expression.chars() {
        match c {
            '[' | '(' | '{' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            ']' | ')' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    if max_depth > max_bracket_depth {
        return Err(RateLimitError::security(format!(
            "expression bracket depth {max_depth} exceeds limit {max_bracket_depth}"
        )));
    }
    if depth != 0 {
        return Err(RateLimitError::security("unbalanced brackets in expression"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlong_expression() {
        let long = "#ip".repeat(200);
        assert!(check(&long, 500, 10, &[]).is_err());
    }

    #[test]
    fn rejects_blacklisted_term() {
        assert!(check("#user[__proto__]", 500, 10, &[]).is_err());
    }

    #[test]
    fn rejects_excess_bracket_depth() {
        let expr = "#user[".repeat(12) + &"]".repeat(12);
        assert!(check(&expr, 500, 10, &[]).is_err());
    }

    #[test]
    fn rejects_excess_depth_from_parens_and_braces_too() {
        let expr = "((((((((((((".to_string() + &")".repeat(12).to_string();
        assert!(check(&expr, 500, 10, &[]).is_err());
        let expr = "{{{{{{{{{{{{".to_string() + &"}".repeat(12).to_string();
        assert!(check(&expr, 500, 10, &[]).is_err());
    }

    #[test]
    fn allows_ordinary_expression() {
        assert!(check(r#""req:" + #user[id]"#, 500, 10, &[]).is_ok());
    }
}
