//! Render façade
//!
//! `StencilEngine` owns the source registry, the shared AST cache and the
//! render pipeline: cache retrieve, source read, lex/parse, resolve, cache
//! store, serialize, touch. The engine may be driven concurrently from
//! independent tasks; a single render never suspends after its
//! dependencies are materialized.

use crate::ast::{Ast, AstKey, Touch};
use crate::cache::AstCache;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::resolver::Resolver;
use crate::runtime;
use crate::sources::{Source, SourceSet};
use log::debug;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};

pub struct StencilEngine {
    sources: RwLock<SourceSet>,
    cache: AstCache,
}

impl Default for StencilEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StencilEngine {
    pub fn new() -> Self {
        Self::with_cache(AstCache::new())
    }

    /// Share a cache between engines.
    pub fn with_cache(cache: AstCache) -> Self {
        Self {
            sources: RwLock::new(SourceSet::new()),
            cache,
        }
    }

    pub fn cache(&self) -> &AstCache {
        &self.cache
    }

    /// Register a named template source. Lookup order follows registration
    /// order for keys not pinned to a source.
    pub fn register_source(&self, name: impl Into<String>, source: Arc<dyn Source>) -> Result<()> {
        let mut sources = self
            .sources
            .write()
            .map_err(|_| Error::unknown("source registry lock poisoned"))?;
        sources.register(name, source)
    }

    fn source_snapshot(&self) -> Result<SourceSet> {
        self.sources
            .read()
            .map(|s| s.clone())
            .map_err(|_| Error::unknown("source registry lock poisoned"))
    }

    /// Render `name` against `context`, producing encoded output bytes.
    pub async fn render(&self, name: &str, context: &Context) -> Result<Vec<u8>> {
        runtime::mark_started();
        let started = Instant::now();
        let sources = self.source_snapshot()?;
        if sources.is_empty() {
            return Err(Error::NoSources);
        }
        let options = context.options.clone();
        let resolver = Resolver::new(&sources, &self.cache, &options)
            .with_literals(context.literal_entries());

        let caching = options.caching;
        let mut cached = if caching.reads() {
            self.lookup(&sources, name)
        } else {
            None
        };

        // Auto-update: poll the source timestamp at the configured
        // frequency and re-parse when the source is newer than the AST.
        if caching.auto_updates() {
            if let Some(ast) = cached.clone() {
                if self.poll_due(&ast, options.polling_frequency) {
                    match sources.timestamp(&ast.key).await {
                        Ok(modified) if modified > ast.info.parsed_at => {
                            debug!("source for \"{}\" changed; re-parsing", ast.key);
                            cached = None;
                        }
                        _ => {
                            let mut refreshed = ast.as_ref().clone();
                            refreshed.info.last_poll = Some(SystemTime::now());
                            cached = Some(self.cache.insert(refreshed, true)?);
                        }
                    }
                }
            }
        }

        let (ast, transient) = match cached {
            Some(ast) => {
                let transient = resolver.refetch_raws(&ast).await?;
                (ast, transient)
            }
            None => {
                let loaded = resolver.load(&AstKey::searched(name)).await?;
                let (mut resolved, transient) = resolver.resolve(loaded).await?;
                if caching.auto_updates() {
                    resolved.info.last_poll = Some(SystemTime::now());
                }
                let ast = if caching.stores() {
                    self.cache.insert(resolved, true)?
                } else {
                    Arc::new(resolved)
                };
                (ast, transient)
            }
        };

        let output = crate::serializer::serialize(&ast, &transient, context)?;

        if !caching.bypasses() && ast.info.cached {
            self.cache.touch(
                &ast.key,
                Touch {
                    exec_time: started.elapsed(),
                    size: output.len(),
                },
            );
        }
        Ok(output)
    }

    /// Find a cached AST for `name` across the registered sources.
    fn lookup(&self, sources: &SourceSet, name: &str) -> Option<Arc<Ast>> {
        for source in sources.names() {
            if let Some(ast) = self.cache.retrieve(&AstKey::new(source, name)) {
                return Some(ast);
            }
        }
        None
    }

    fn poll_due(&self, ast: &Ast, frequency: f64) -> bool {
        match ast.info.last_poll {
            None => true,
            Some(last) => SystemTime::now()
                .duration_since(last)
                .map(|elapsed| elapsed >= Duration::from_secs_f64(frequency.max(f64::MIN_POSITIVE)))
                .unwrap_or(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Caching;
    use crate::sources::MemorySource;
    use serde_json::json;

    fn engine(templates: &[(&str, &str)]) -> StencilEngine {
        let memory = MemorySource::new();
        for (name, body) in templates {
            memory.insert(*name, *body);
        }
        let engine = StencilEngine::new();
        engine.register_source("memory", Arc::new(memory)).unwrap();
        engine
    }

    async fn render(engine: &StencilEngine, name: &str, data: serde_json::Value) -> Result<String> {
        let context = Context::from_json(data)?;
        let bytes = engine.render(name, &context).await?;
        Ok(String::from_utf8(bytes).expect("utf8 output"))
    }

    #[tokio::test]
    async fn test_render_simple() {
        let engine = engine(&[("hello", "Hello #(name)!")]);
        let out = render(&engine, "hello", json!({"name": "World"}))
            .await
            .unwrap();
        assert_eq!(out, "Hello World!");
    }

    #[tokio::test]
    async fn test_render_without_sources() {
        let engine = StencilEngine::new();
        let error = render(&engine, "any", json!({})).await.unwrap_err();
        assert!(matches!(error, Error::NoSources));
    }

    #[tokio::test]
    async fn test_render_caches_ast() {
        let engine = engine(&[("page", "static")]);
        render(&engine, "page", json!({})).await.unwrap();
        assert_eq!(engine.cache().len(), 1);
        // second render hits the cache
        let out = render(&engine, "page", json!({})).await.unwrap();
        assert_eq!(out, "static");
        let info = engine.cache().info(&AstKey::new("memory", "page")).unwrap();
        assert!(info.touches.count >= 1);
    }

    #[tokio::test]
    async fn test_bypass_skips_cache() {
        let engine = engine(&[("page", "static")]);
        let mut context = Context::from_json(json!({})).unwrap();
        context.options.caching = Caching::default().with(Caching::BYPASS);
        engine.render("page", &context).await.unwrap();
        assert!(engine.cache().is_empty());
    }

    #[tokio::test]
    async fn test_inline_resolution_through_engine() {
        let engine = engine(&[
            ("base", r#"#define(adminValue = admin)
#inline("parameter")"#),
            (
                "parameter",
                "#if(evaluate(adminValue ?? false)):Hi Admin#else:No Access#endif",
            ),
        ]);
        let granted = render(&engine, "base", json!({"admin": true}))
            .await
            .unwrap();
        assert_eq!(granted, "Hi Admin");
        let denied = render(&engine, "base", json!({"admin": false}))
            .await
            .unwrap();
        assert_eq!(denied, "No Access");
    }

    #[tokio::test]
    async fn test_cyclical_inline_fails() {
        let engine = engine(&[
            ("a", r#"#inline("b")"#),
            ("b", r#"#inline("c")"#),
            ("c", r#"#inline("a")"#),
        ]);
        let error = render(&engine, "a", json!({})).await.unwrap_err();
        assert!(matches!(error, Error::CyclicalReference { .. }));
    }
}
