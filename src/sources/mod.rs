//! Template sources
//!
//! A `Source` hands the resolver template bodies and change timestamps.
//! The interface is asynchronous; the engine awaits it only at clearly
//! delimited points before serialization begins.

pub mod file;
pub mod memory;

pub use file::FileSource;
pub use memory::MemorySource;

use crate::ast::AstKey;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::SystemTime;

#[async_trait]
pub trait Source: Send + Sync {
    /// Read a template body. `escape` permits leaving the view root (but
    /// never the sandbox) for providers that distinguish the two. Returns
    /// the full resolved name alongside the bytes.
    async fn file(&self, key: &AstKey, escape: bool) -> Result<(String, Vec<u8>)>;

    /// Last modification instant of the template, for auto-update polling.
    async fn timestamp(&self, key: &AstKey) -> Result<SystemTime>;
}

/// Ordered registry of named sources. A key pinned to a source name reads
/// from that source only; a searched key walks the registration order.
#[derive(Clone, Default)]
pub struct SourceSet {
    ordered: Vec<(String, Arc<dyn Source>)>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, source: Arc<dyn Source>) -> Result<()> {
        let name = name.into();
        if self.ordered.iter().any(|(n, _)| *n == name) {
            return Err(Error::unknown(format!(
                "source \"{}\" is already registered",
                name
            )));
        }
        self.ordered.push((name, source));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Registered source names, in lookup order.
    pub fn names(&self) -> Vec<String> {
        self.ordered.iter().map(|(name, _)| name.clone()).collect()
    }

    fn named(&self, name: &str) -> Result<&Arc<dyn Source>> {
        self.ordered
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
            .ok_or_else(|| Error::NoSourceForKey(name.to_string()))
    }

    /// Read a template, returning the key pinned to the source that held it.
    pub async fn read(&self, key: &AstKey, escape: bool) -> Result<(AstKey, Vec<u8>)> {
        if self.ordered.is_empty() {
            return Err(Error::NoSources);
        }
        if key.source != "$default" {
            let source = self.named(&key.source)?;
            let (_, bytes) = source.file(key, escape).await?;
            return Ok((key.clone(), bytes));
        }
        for (name, source) in &self.ordered {
            match source.file(key, escape).await {
                Ok((_, bytes)) => return Ok((AstKey::new(name.clone(), &key.name), bytes)),
                Err(Error::NoTemplateExists(_)) => continue,
                Err(error) => return Err(error),
            }
        }
        Err(Error::NoTemplateExists(key.name.clone()))
    }

    pub async fn timestamp(&self, key: &AstKey) -> Result<SystemTime> {
        if self.ordered.is_empty() {
            return Err(Error::NoSources);
        }
        if key.source != "$default" {
            return self.named(&key.source)?.timestamp(key).await;
        }
        for (_, source) in &self.ordered {
            match source.timestamp(key).await {
                Ok(instant) => return Ok(instant),
                Err(Error::NoTemplateExists(_)) => continue,
                Err(error) => return Err(error),
            }
        }
        Err(Error::NoTemplateExists(key.name.clone()))
    }
}
