//! Key resolution (C6): turns a per-limiter key template plus a request's
//! attributes into the string used to look up algorithm state.
//!
//! Every template, marker or not, passes the `sandbox` length/blacklist/
//! depth checks before anything else runs. Templates with no `#` marker are
//! then used verbatim — the fast path, zero allocation beyond the clone
//! callers need anyway. Templates containing the marker are parsed into a
//! small expression (`expr`), compiled once, and cached (`cache`) so repeat
//! requests for the same template skip parsing entirely.

pub mod cache;
pub mod expr;
pub mod sandbox;

pub use expr::ResolveContext;

use crate::config::ResolverConfig;
use crate::error::Result;
use cache::ExprCache;
use expr::MARKER;
use std::sync::Arc;

pub struct KeyResolver {
    cache: ExprCache,
}

impl KeyResolver {
    pub fn new(cache_capacity: usize) -> Self {
        KeyResolver {
            cache: ExprCache::new(cache_capacity),
        }
    }

    pub fn resolve(
        &self,
        template: &str,
        ctx: &ResolveContext,
        config: &ResolverConfig,
    ) -> Result<String> {
        if template.is_empty() {
            return Ok("global".to_string());
        }

        if let Err(e) = sandbox::check(
            template,
            config.max_expression_len,
            config.max_bracket_depth,
            &config.extra_blacklist,
        ) {
            metrics::counter!("ratekeeper_resolver_security_rejections_total").increment(1);
            return Err(e);
        }

        if !template.contains(MARKER) {
            return Ok(template.to_string());
        }

        if let Some(compiled) = self.cache.get(template) {
            metrics::counter!("ratekeeper_resolver_cache_hits_total").increment(1);
            return compiled.evaluate(ctx);
        }

        let compiled = Arc::new(expr::parse(template)?);
        self.cache.insert(template.to_string(), compiled.clone());
        compiled.evaluate(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_path_skips_parsing_entirely() {
        let resolver = KeyResolver::new(10);
        let ctx = ResolveContext::default();
        let cfg = ResolverConfig::default();
        let key = resolver.resolve("static-key", &ctx, &cfg).unwrap();
        assert_eq!(key, "static-key");
        assert_eq!(resolver.cache.len(), 0, "literal templates never touch the expr cache");
    }

    #[test]
    fn empty_template_resolves_to_global() {
        let resolver = KeyResolver::new(10);
        let ctx = ResolveContext::default();
        let cfg = ResolverConfig::default();
        assert_eq!(resolver.resolve("", &ctx, &cfg).unwrap(), "global");
    }

    #[test]
    fn slow_path_compiles_once_and_reuses() {
        let resolver = KeyResolver::new(10);
        let mut ctx = ResolveContext::default();
        ctx.ip = "1.2.3.4".to_string();
        let cfg = ResolverConfig::default();
        let k1 = resolver.resolve(r#""ip:" + #ip"#, &ctx, &cfg).unwrap();
        let k2 = resolver.resolve(r#""ip:" + #ip"#, &ctx, &cfg).unwrap();
        assert_eq!(k1, "ip:1.2.3.4");
        assert_eq!(k2, "ip:1.2.3.4");
        assert_eq!(resolver.cache.len(), 1);
    }

    #[test]
    fn marker_free_template_is_still_sandboxed() {
        let resolver = KeyResolver::new(10);
        let ctx = ResolveContext::default();
        let cfg = ResolverConfig::default();
        assert!(
            resolver.resolve("T(System).exit(1)", &ctx, &cfg).is_err(),
            "a marker-free template must still pass the sandbox before being used verbatim"
        );
    }

    #[test]
    fn rejects_security_violation_before_caching() {
        let resolver = KeyResolver::new(10);
        let ctx = ResolveContext::default();
        let cfg = ResolverConfig::default();
        assert!(resolver.resolve("#secrets[x]", &ctx, &cfg).is_err());
        assert_eq!(resolver.cache.len(), 0);
    }
}
