//! Resolver: dependency materialization and inlining
//!
//! The fixpoint driver over an AST's required templates. Each dependency is
//! fetched through the cache and source set, resolved recursively, and its
//! scope tables spliced into the parent with every cross-table reference
//! rewritten by the splice offset. The chain of in-progress names detects
//! cycles. Raw dependencies embed into the AST when small enough; larger
//! ones are re-fetched on every render.

use crate::ast::{Ast, AstKey, MetaBlock, ScopeRef, Syntax};
use crate::cache::AstCache;
use crate::context::Options;
use crate::error::{Error, Result};
use crate::sources::SourceSet;
use crate::syntax::Parser;
use crate::value::TemplateData;
use log::debug;
use std::collections::HashMap;

pub struct Resolver<'a> {
    sources: &'a SourceSet,
    cache: &'a AstCache,
    options: &'a Options,
    literals: HashMap<String, TemplateData>,
}

impl<'a> Resolver<'a> {
    pub fn new(sources: &'a SourceSet, cache: &'a AstCache, options: &'a Options) -> Self {
        Self {
            sources,
            cache,
            options,
            literals: HashMap::new(),
        }
    }

    /// Literal context entries handed to dependency parses.
    pub fn with_literals(mut self, literals: HashMap<String, TemplateData>) -> Self {
        self.literals = literals;
        self
    }

    /// Read and parse a template from the source set.
    pub async fn load(&self, key: &AstKey) -> Result<Ast> {
        let (pinned, bytes) = self.sources.read(key, false).await?;
        let body = String::from_utf8(bytes)
            .map_err(|_| Error::unknown(format!("template \"{}\" is not UTF-8", key.name)))?;
        let parser =
            Parser::new(pinned.name.clone(), &body)?.with_literals(self.literals.clone());
        parser.parse(pinned)
    }

    /// Materialize every dependency of `ast`. The returned map carries raw
    /// files above the embed limit, fetched for this render only.
    pub async fn resolve(&self, ast: Ast) -> Result<(Ast, HashMap<String, Vec<u8>>)> {
        let mut chain = Vec::new();
        let mut ast = self.resolve_inner(ast, &mut chain).await?;
        let transient = self.collect_raws(&mut ast).await?;
        Ok((ast, transient))
    }

    fn resolve_inner<'s>(
        &'s self,
        mut ast: Ast,
        chain: &'s mut Vec<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Ast>> + Send + 's>> {
        Box::pin(async move {
            chain.push(ast.key.name.clone());

            while let Some(name) = ast.info.required_asts.iter().next().cloned() {
                if chain.contains(&name) {
                    let mut cycle = chain.clone();
                    cycle.push(name.clone());
                    return Err(Error::cyclical(name, cycle));
                }

                let key = AstKey::new(ast.key.source.clone(), name.clone());
                let dependency = match self
                    .cache
                    .retrieve(&key)
                    .filter(|_| self.options.caching.reads())
                {
                    Some(cached) if cached.info.resolved => cached.as_ref().clone(),
                    _ => {
                        let loaded = self.load(&key).await?;
                        let resolved = self.resolve_inner(loaded, chain).await?;
                        if self.options.caching.stores() {
                            self.cache.insert(resolved.clone(), false)?;
                        }
                        resolved
                    }
                };

                debug!("inlining \"{}\" into \"{}\"", name, ast.key);
                splice(&mut ast, &name, dependency);
                ast.info.required_asts.remove(&name);
            }

            ast.info.resolved = true;
            chain.pop();
            Ok(ast)
        })
    }

    /// Raw dependencies a cached AST did not embed, fetched per render.
    pub async fn refetch_raws(&self, ast: &Ast) -> Result<HashMap<String, Vec<u8>>> {
        let mut transient = HashMap::new();
        for name in &ast.info.required_raws {
            if ast.raws.contains_key(name) {
                continue;
            }
            let key = AstKey::new(ast.key.source.clone(), name.clone());
            let (_, bytes) = self
                .sources
                .read(&key, false)
                .await
                .map_err(|error| match error {
                    Error::NoTemplateExists(_) => Error::MissingRaw(name.clone()),
                    other => other,
                })?;
            transient.insert(name.clone(), bytes);
        }
        Ok(transient)
    }

    /// Fetch raw dependencies: embed small ones, hand back the rest.
    async fn collect_raws(&self, ast: &mut Ast) -> Result<HashMap<String, Vec<u8>>> {
        let mut transient = HashMap::new();
        for name in ast.info.required_raws.clone() {
            if ast.raws.contains_key(&name) {
                continue;
            }
            let key = AstKey::new(ast.key.source.clone(), name.clone());
            let (_, bytes) = self
                .sources
                .read(&key, false)
                .await
                .map_err(|error| match error {
                    Error::NoTemplateExists(_) => Error::MissingRaw(name.clone()),
                    other => other,
                })?;
            if bytes.len() <= self.options.embedded_ast_raw_limit as usize {
                ast.raws.insert(name, bytes);
            } else {
                debug!(
                    "raw \"{}\" exceeds the embed limit; fetching per render",
                    name
                );
                transient.insert(name, bytes);
            }
        }
        Ok(transient)
    }
}

/// Splice a resolved dependency's tables into the parent and point every
/// matching inline at the dependency's entry table.
fn splice(parent: &mut Ast, name: &str, dependency: Ast) {
    let offset = parent.scopes.len();
    for table in dependency.scopes {
        let mut table = table;
        for syntax in &mut table {
            syntax.offset_scopes(offset);
        }
        parent.scopes.push(table);
    }

    for table in &mut parent.scopes[..offset] {
        for syntax in table.iter_mut() {
            if matches!(
                syntax,
                Syntax::Meta(MetaBlock::InlineTemplate { name: inline }) if inline == name
            ) {
                *syntax = Syntax::Jump(ScopeRef::Table(offset));
            }
        }
    }

    for (raw_name, bytes) in dependency.raws {
        parent.raws.entry(raw_name).or_insert(bytes);
    }
    for raw in dependency.info.required_raws {
        parent.info.required_raws.insert(raw);
    }
    for variable in dependency.info.required_vars {
        parent.info.required_vars.insert(variable);
    }
    parent.info.max_depth = parent.info.max_depth.max(dependency.info.max_depth + 1);
    parent.info.underestimated_size += dependency.info.underestimated_size;
}
