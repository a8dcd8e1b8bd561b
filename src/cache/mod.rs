//! Thread-safe AST cache with touch aggregation
//!
//! Maps `(source, name)` keys to resolved ASTs. Two independent
//! reader-writer locks split cache data from touch state so render threads
//! recording statistics do not contend with readers; where both are needed
//! the touch lock is always acquired after the data lock.

use crate::ast::{Ast, AstInfo, AstKey, Touch, TouchStats};
use crate::error::{Error, Result};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Pending touches flush into the AST once this many accumulate.
const TOUCH_FLUSH_THRESHOLD: u64 = 128;

/// Shared cache of compiled templates.
pub struct AstCache {
    data: Arc<RwLock<HashMap<AstKey, Arc<Ast>>>>,
    touches: Arc<RwLock<HashMap<AstKey, TouchStats>>>,
}

impl Default for AstCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for AstCache {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            touches: Arc::clone(&self.touches),
        }
    }
}

impl AstCache {
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            touches: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn read_data(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<AstKey, Arc<Ast>>>> {
        self.data
            .read()
            .map_err(|_| Error::unknown("AST cache lock poisoned"))
    }

    fn write_data(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<AstKey, Arc<Ast>>>> {
        self.data
            .write()
            .map_err(|_| Error::unknown("AST cache lock poisoned"))
    }

    fn write_touches(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<AstKey, TouchStats>>> {
        self.touches
            .write()
            .map_err(|_| Error::unknown("AST touch lock poisoned"))
    }

    /// Insert a resolved AST. With `replace` false an existing entry wins
    /// and is returned unchanged.
    pub fn insert(&self, mut ast: Ast, replace: bool) -> Result<Arc<Ast>> {
        ast.info.cached = true;
        let key = ast.key.clone();
        let mut data = self.write_data()?;
        if !replace {
            if let Some(existing) = data.get(&key) {
                debug!("cache insert skipped, \"{}\" already cached", key);
                return Ok(Arc::clone(existing));
            }
        }
        let shared = Arc::new(ast);
        data.insert(key.clone(), Arc::clone(&shared));
        debug!("cached \"{}\"", key);
        Ok(shared)
    }

    /// Fetch a cached AST, folding in any pending touches first.
    pub fn retrieve(&self, key: &AstKey) -> Option<Arc<Ast>> {
        self.flush_touches(key);
        self.read_data().ok()?.get(key).cloned()
    }

    /// Drop an entry; `Some(true)` when something was removed.
    pub fn remove(&self, key: &AstKey) -> Option<bool> {
        let mut data = self.write_data().ok()?;
        let removed = data.remove(key).is_some();
        if let Ok(mut touches) = self.touches.write() {
            touches.remove(key);
        }
        removed.then(|| {
            debug!("removed \"{}\" from cache", key);
            true
        })
    }

    /// Metadata snapshot for a cached AST, with pending touches folded in.
    pub fn info(&self, key: &AstKey) -> Option<AstInfo> {
        self.flush_touches(key);
        self.read_data()
            .ok()?
            .get(key)
            .map(|ast| ast.info.clone())
    }

    /// Record an execution sample. Touches aggregate in the side table and
    /// flush into the AST when enough accumulate or on the next read.
    pub fn touch(&self, key: &AstKey, touch: Touch) {
        let should_flush = {
            let Ok(mut touches) = self.touches.write() else {
                return;
            };
            let stats = touches.entry(key.clone()).or_default();
            stats.aggregate(touch);
            stats.count >= TOUCH_FLUSH_THRESHOLD
        };
        if should_flush {
            self.flush_touches(key);
        }
    }

    /// Fold the pending touch state for `key` into its cached AST.
    fn flush_touches(&self, key: &AstKey) {
        let Ok(mut data) = self.data.write() else {
            return;
        };
        // touch lock deliberately taken after the data lock
        let Ok(mut touches) = self.touches.write() else {
            return;
        };
        let Some(pending) = touches.remove(key) else {
            return;
        };
        if pending.count == 0 {
            return;
        }
        if let Some(entry) = data.get_mut(key) {
            let mut ast = entry.as_ref().clone();
            ast.info.touches.merge(&pending);
            *entry = Arc::new(ast);
        }
    }

    /// Empty the cache entirely.
    pub fn drop_all(&self) {
        if let Ok(mut data) = self.data.write() {
            let count = data.len();
            data.clear();
            info!("dropped {} cached ASTs", count);
        }
        if let Ok(mut touches) = self.touches.write() {
            touches.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.read_data().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
