//! Stencil - a server-side text template engine
//!
//! Stencil compiles template sources into an AST of typed scopes and
//! resolves that AST against a contextual value store to produce rendered
//! bytes. The pipeline: tokenize, parse into a multi-scope AST with typed
//! expressions and resolved calls, inline dependent templates, then run a
//! non-recursive serializer over the scope tables with a variable stack,
//! definitions, chained blocks and per-render timeouts.
//!
//! ```no_run
//! use std::sync::Arc;
//! use stencil::{Context, MemorySource, StencilEngine};
//!
//! # async fn demo() -> stencil::Result<()> {
//! let templates = MemorySource::new();
//! templates.insert("hello", "Hello #(name)!");
//!
//! let engine = StencilEngine::new();
//! engine.register_source("memory", Arc::new(templates))?;
//!
//! let context = Context::from_json(serde_json::json!({"name": "World"}))?;
//! let bytes = engine.render("hello", &context).await?;
//! assert_eq!(bytes, b"Hello World!");
//! # Ok(())
//! # }
//! ```

// Enforce error handling best practices
#![cfg_attr(
    not(test),
    warn(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo,
    )
)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used,))]

pub mod ast;
pub mod cache;
pub mod context;
pub mod engine;
pub mod entities;
pub mod error;
pub mod resolver;
pub mod runtime;
pub mod serializer;
pub mod sources;
pub mod syntax;
pub mod value;
pub mod variable;

// Re-export main types for public API
pub use ast::{Ast, AstInfo, AstKey, Touch, TouchStats};
pub use cache::AstCache;
pub use context::{Caching, Context, ContextPublisher, Encoding, Options};
pub use engine::StencilEngine;
pub use entities::{
    BlockFactory, BlockInstance, CallParameter, CallSignature, CallValues, CustomBlock,
    Entities, FunctionEntity, MethodEntity, RawBlock, RawFactory,
};
pub use error::{Error, Result, SourceLocation};
pub use sources::{FileSource, MemorySource, Source};
pub use value::{DataKind, TemplateData};
pub use variable::Variable;

// Re-export commonly used external types
pub use serde_json::{json, Value as JsonValue};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::context::{Caching, Context, Encoding, Options};
    pub use crate::engine::StencilEngine;
    pub use crate::error::{Error, Result};
    pub use crate::sources::{FileSource, MemorySource, Source};
    pub use crate::value::{DataKind, TemplateData};
    pub use serde_json::json;
    pub use std::sync::Arc;
}
