//! Render contexts and per-render options
//!
//! A `Context` is the variable world a render is evaluated against: a map
//! from scope name (`self` for the root scope, `$name` for registered
//! scopes) to a dictionary of values. Contexts are passed by value at
//! render entry; mutations by the caller never affect an in-flight render.

use crate::entities::UnsafeObjects;
use crate::error::{Error, Result};
use crate::value::TemplateData;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Output byte encodings the serializer can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Ascii,
    Iso8859_1,
    /// NeXTSTEP text; identical to ASCII over the 7-bit range, which is
    /// the only part supported here.
    NextStep,
}

impl Encoding {
    /// Encode rendered text; a code point the codec cannot express is a
    /// serialize-time error.
    pub fn encode(&self, text: &str) -> Result<Vec<u8>> {
        match self {
            Encoding::Utf8 => Ok(text.as_bytes().to_vec()),
            Encoding::Ascii | Encoding::NextStep => {
                let mut bytes = Vec::with_capacity(text.len());
                for ch in text.chars() {
                    if !ch.is_ascii() {
                        return Err(Error::encoding(format!(
                            "U+{:04X} is not representable in {:?}",
                            ch as u32, self
                        )));
                    }
                    bytes.push(ch as u8);
                }
                Ok(bytes)
            }
            Encoding::Iso8859_1 => {
                let mut bytes = Vec::with_capacity(text.len());
                for ch in text.chars() {
                    let code = ch as u32;
                    if code > 0xFF {
                        return Err(Error::encoding(format!(
                            "U+{:04X} is not representable in ISO-8859-1",
                            code
                        )));
                    }
                    bytes.push(code as u8);
                }
                Ok(bytes)
            }
        }
    }
}

/// Cache behavior bits for a render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caching(u8);

impl Caching {
    pub const BYPASS: Caching = Caching(0b0001);
    pub const READ: Caching = Caching(0b0010);
    pub const STORE: Caching = Caching(0b0100);
    pub const AUTO_UPDATE: Caching = Caching(0b1000);

    pub fn default_behavior() -> Caching {
        Caching(Self::READ.0 | Self::STORE.0)
    }

    pub fn with(self, other: Caching) -> Caching {
        Caching(self.0 | other.0)
    }

    pub fn bypasses(&self) -> bool {
        self.0 & Self::BYPASS.0 != 0
    }

    pub fn reads(&self) -> bool {
        !self.bypasses() && self.0 & Self::READ.0 != 0
    }

    pub fn stores(&self) -> bool {
        !self.bypasses() && self.0 & Self::STORE.0 != 0
    }

    pub fn auto_updates(&self) -> bool {
        !self.bypasses() && self.0 & Self::AUTO_UPDATE.0 != 0
    }
}

impl Default for Caching {
    fn default() -> Self {
        Self::default_behavior()
    }
}

/// Per-render option bundle.
#[derive(Debug, Clone)]
pub struct Options {
    /// Render deadline in seconds; floor 1 ms.
    pub timeout: f64,
    pub parse_warning_throws: bool,
    pub missing_variable_throws: bool,
    pub grant_unsafe_entity_access: bool,
    pub encoding: Encoding,
    pub caching: Caching,
    /// Raw files at or under this size embed into the cached AST.
    pub embedded_ast_raw_limit: u32,
    /// Seconds between source timestamp polls when auto-updating.
    pub polling_frequency: f64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: 30.0,
            parse_warning_throws: false,
            missing_variable_throws: false,
            grant_unsafe_entity_access: false,
            encoding: Encoding::Utf8,
            caching: Caching::default(),
            embedded_ast_raw_limit: 4096,
            polling_frequency: 10.0,
        }
    }
}

impl Options {
    pub fn timeout(mut self, seconds: f64) -> Self {
        self.timeout = seconds.max(0.001);
        self
    }

    pub fn polling_frequency(mut self, seconds: f64) -> Self {
        if seconds > 0.0 {
            self.polling_frequency = seconds;
        }
        self
    }
}

/// One entry of a context dictionary.
#[derive(Debug, Clone)]
struct ContextEntry {
    value: TemplateData,
    literal: bool,
}

/// Name-keyed values for one scope.
#[derive(Debug, Clone, Default)]
pub struct ContextDictionary {
    values: HashMap<String, ContextEntry>,
    /// Every entry is literal.
    pub literal: bool,
    /// Frozen on first match access; further writes are rejected.
    pub frozen: bool,
}

impl ContextDictionary {
    fn set(&mut self, key: String, value: TemplateData, literal: bool) -> Result<()> {
        if self.frozen {
            return Err(Error::unknown(format!(
                "context dictionary is frozen; cannot set \"{}\"",
                key
            )));
        }
        self.values.insert(key, ContextEntry { value, literal });
        self.literal = self.values.values().all(|e| e.literal);
        Ok(())
    }

    /// Look up an entry, freezing the dictionary on first access.
    pub fn match_value(&mut self, key: &str) -> Option<TemplateData> {
        self.frozen = true;
        self.values.get(key).map(|e| e.value.clone())
    }

    pub fn get(&self, key: &str) -> Option<TemplateData> {
        self.values.get(key).map(|e| e.value.clone())
    }

    /// The whole dictionary as a template value.
    pub fn as_value(&self) -> TemplateData {
        TemplateData::dictionary(
            self.values
                .iter()
                .map(|(k, e)| (k.clone(), e.value.clone()))
                .collect(),
        )
    }

    fn literal_entries(&self) -> HashMap<String, TemplateData> {
        self.values
            .iter()
            .filter(|(_, e)| e.literal && !e.value.is_variant())
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }
}

/// Publishes variables into a registered scope.
pub trait ContextPublisher: Send + Sync {
    fn variables(&self) -> HashMap<String, TemplateData>;
}

/// The root scope name.
pub const SELF_SCOPE: &str = "self";

/// The externally supplied variable world for a render.
#[derive(Clone, Default)]
pub struct Context {
    scopes: HashMap<String, ContextDictionary>,
    pub options: Options,
    unsafe_objects: UnsafeObjects,
    locked_scopes: HashSet<String>,
    overlay_blocked: HashSet<String>,
}

impl Context {
    /// A root context with default options.
    pub fn new() -> Self {
        Self {
            scopes: HashMap::new(),
            options: Options::default(),
            unsafe_objects: HashMap::new(),
            locked_scopes: HashSet::new(),
            overlay_blocked: HashSet::new(),
        }
    }

    /// Build the root scope from a JSON object.
    pub fn from_json(data: serde_json::Value) -> Result<Self> {
        let mut context = Self::new();
        match data {
            serde_json::Value::Object(map) => {
                for (key, value) in map {
                    context.set(key, TemplateData::from(value))?;
                }
            }
            serde_json::Value::Null => {}
            other => {
                context.set("self", TemplateData::from(other))?;
            }
        }
        Ok(context)
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    fn scope_mut(&mut self, scope: &str) -> Result<&mut ContextDictionary> {
        if self.locked_scopes.contains(scope) {
            return Err(Error::unknown(format!(
                "scope \"{}\" is locked against additional variables",
                scope
            )));
        }
        Ok(self.scopes.entry(scope.to_string()).or_default())
    }

    /// Set a value in the root scope.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<TemplateData>) -> Result<()> {
        self.scope_mut(SELF_SCOPE)?.set(key.into(), value.into(), false)
    }

    /// Set a value in a registered scope (`$scope.key`).
    pub fn set_scope_value(
        &mut self,
        scope: &str,
        key: impl Into<String>,
        value: impl Into<TemplateData>,
    ) -> Result<()> {
        self.scope_mut(scope)?.set(key.into(), value.into(), false)
    }

    /// Mark a root entry literal: fixed for the context's lifetime and
    /// inlinable at parse. Root contexts only.
    pub fn set_literal(
        &mut self,
        key: impl Into<String>,
        value: impl Into<TemplateData>,
    ) -> Result<()> {
        self.scope_mut(SELF_SCOPE)?.set(key.into(), value.into(), true)
    }

    /// Register a publisher's variables into a scope.
    pub fn register_contextual(
        &mut self,
        scope: &str,
        publisher: &dyn ContextPublisher,
    ) -> Result<()> {
        if self.overlay_blocked.contains(scope) && self.scopes.contains_key(scope) {
            return Err(Error::unknown(format!(
                "scope \"{}\" blocks replacement",
                scope
            )));
        }
        for (key, value) in publisher.variables() {
            self.scope_mut(scope)?.set(key, value, false)?;
        }
        Ok(())
    }

    /// Register a host object reference passed outside the value model.
    pub fn register_unsafe(
        &mut self,
        name: impl Into<String>,
        object: Arc<dyn std::any::Any + Send + Sync>,
    ) {
        self.unsafe_objects.insert(name.into(), object);
    }

    /// Forbid additional variables in a scope.
    pub fn lock_context_variables(&mut self, scope: &str) {
        self.locked_scopes.insert(scope.to_string());
    }

    /// Block replacement of a scope's contents.
    pub fn prevent_overlay(&mut self, scope: &str) {
        self.overlay_blocked.insert(scope.to_string());
    }

    pub fn scope(&self, name: &str) -> Option<&ContextDictionary> {
        self.scopes.get(name)
    }

    /// Iterate every scope dictionary, the root included.
    pub fn scopes(&self) -> impl Iterator<Item = (&str, &ContextDictionary)> {
        self.scopes.iter().map(|(name, dict)| (name.as_str(), dict))
    }

    /// The root scope as a dictionary value (`self`).
    pub fn root_value(&self) -> TemplateData {
        self.scopes
            .get(SELF_SCOPE)
            .map(ContextDictionary::as_value)
            .unwrap_or_else(|| TemplateData::dictionary(HashMap::new()))
    }

    /// Root entries marked literal, for parse-time inlining.
    pub fn literal_entries(&self) -> HashMap<String, TemplateData> {
        self.scopes
            .get(SELF_SCOPE)
            .map(ContextDictionary::literal_entries)
            .unwrap_or_default()
    }

    pub fn unsafe_objects(&self) -> Arc<UnsafeObjects> {
        Arc::new(self.unsafe_objects.clone())
    }

    /// Freeze every dictionary; used at render entry on the render's copy.
    pub fn freeze(&mut self) {
        for dictionary in self.scopes.values_mut() {
            dictionary.frozen = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_utf8_encoding_of_tau() {
        let bytes = Encoding::Utf8.encode("τ").unwrap();
        assert_eq!(bytes, vec![0xCF, 0x84]);
    }

    #[test]
    fn test_ascii_rejects_tau() {
        assert!(Encoding::Ascii.encode("τ").is_err());
        assert_eq!(Encoding::Ascii.encode("tau").unwrap(), b"tau");
    }

    #[test]
    fn test_latin1_range() {
        assert_eq!(Encoding::Iso8859_1.encode("é").unwrap(), vec![0xE9]);
        assert!(Encoding::Iso8859_1.encode("τ").is_err());
    }

    #[test]
    fn test_caching_bits() {
        let default = Caching::default();
        assert!(default.reads() && default.stores());
        assert!(!default.bypasses() && !default.auto_updates());

        let bypass = default.with(Caching::BYPASS);
        assert!(bypass.bypasses());
        assert!(!bypass.reads() && !bypass.stores());

        let auto = Caching::default_behavior().with(Caching::AUTO_UPDATE);
        assert!(auto.auto_updates());
    }

    #[test]
    fn test_timeout_floor() {
        let options = Options::default().timeout(0.0);
        assert!((options.timeout - 0.001).abs() < f64::EPSILON);
    }

    #[test]
    fn test_context_from_json() {
        let context = Context::from_json(json!({"todo": {"title": "Template!"}})).unwrap();
        let root = context.root_value();
        assert_eq!(
            root.member("todo")
                .and_then(|t| t.member("title"))
                .and_then(|t| t.as_string())
                .as_deref(),
            Some("Template!")
        );
    }

    #[test]
    fn test_literal_entries() {
        let mut context = Context::new();
        context.set("a", 1i64).unwrap();
        context.set_literal("version", "1.0").unwrap();
        let literals = context.literal_entries();
        assert_eq!(literals.len(), 1);
        assert!(literals.contains_key("version"));
    }

    #[test]
    fn test_frozen_dictionary_rejects_writes() {
        let mut context = Context::new();
        context.set("a", 1i64).unwrap();
        context.freeze();
        assert!(context.set("b", 2i64).is_err());
    }

    #[test]
    fn test_locked_scope() {
        let mut context = Context::new();
        context.set_scope_value("api", "key", "k").unwrap();
        context.lock_context_variables("api");
        assert!(context.set_scope_value("api", "other", 1i64).is_err());
    }

    #[test]
    fn test_match_freezes() {
        let mut dictionary = ContextDictionary::default();
        dictionary.set("a".into(), 1i64.into(), false).unwrap();
        assert!(dictionary.match_value("a").is_some());
        assert!(dictionary.frozen);
        assert!(dictionary.set("b".into(), 2i64.into(), false).is_err());
    }
}
