//! Process-wide entity registry
//!
//! Catalogues every registered callable: free functions, methods (mutating
//! and non-mutating, in their own namespace), block factories, raw-block
//! factories and type identities. The registry is mutable until the first
//! engine starts, then frozen; registration afterwards is rejected.

pub mod blocks;
pub mod functions;
pub mod raw;

pub use blocks::{BlockCall, BlockFactory, BlockInstance, CustomBlock, ForBlock};
pub use functions::{
    CallParameter, CallSignature, CallValues, FunctionEntity, MethodEntity, UnsafeObjects,
};
pub use raw::{RawBlock, RawFactory, DEFAULT_RAW};

use crate::error::{Error, Result, SourceLocation};
use crate::runtime;
use crate::syntax::parameter::Tuple;
use crate::value::DataKind;
use crate::variable::validate_identifier;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Tag names with special parse semantics; not registrable as blocks.
pub const META_BLOCKS: &[&str] = &["raw", "define", "evaluate", "inline"];

/// The entity catalog.
pub struct Entities {
    functions: HashMap<String, Vec<Arc<FunctionEntity>>>,
    methods: HashMap<String, Vec<Arc<MethodEntity>>>,
    blocks: HashMap<String, BlockFactory>,
    raws: HashMap<String, RawFactory>,
    types: HashMap<String, DataKind>,
    meta_blocks: HashSet<String>,
}

impl Entities {
    /// An empty catalog, meta-block names reserved.
    pub fn empty() -> Self {
        Self {
            functions: HashMap::new(),
            methods: HashMap::new(),
            blocks: HashMap::new(),
            raws: HashMap::new(),
            types: HashMap::new(),
            meta_blocks: META_BLOCKS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// The default catalog every engine starts from.
    pub fn core_set() -> Self {
        let mut entities = Self::empty();
        entities.register_defaults();
        entities
    }

    fn register_defaults(&mut self) {
        for factory in blocks::builtin_blocks() {
            if let Err(error) = self.register_block(factory) {
                log::warn!("builtin block registration failed: {}", error);
            }
        }
        for factory in raw::builtin_raws() {
            if let Err(error) = self.register_raw(factory) {
                log::warn!("builtin raw registration failed: {}", error);
            }
        }
        for entity in functions::builtins::functions() {
            if let Err(error) = self.register_function(entity) {
                log::warn!("builtin function registration failed: {}", error);
            }
        }
        for entity in functions::builtins::methods() {
            if let Err(error) = self.register_method(entity) {
                log::warn!("builtin method registration failed: {}", error);
            }
        }
        for (name, kind) in [
            ("Bool", DataKind::Bool),
            ("Int", DataKind::Int),
            ("Double", DataKind::Double),
            ("String", DataKind::String),
            ("Data", DataKind::Data),
            ("Array", DataKind::Array),
            ("Dictionary", DataKind::Dictionary),
        ] {
            self.types.insert(name.to_string(), kind);
        }
    }

    fn check_name(&self, name: &str) -> Result<()> {
        validate_identifier(name)
            .map_err(|_| Error::unknown(format!("\"{}\" is not a registrable entity name", name)))
    }

    pub fn register_function(&mut self, entity: FunctionEntity) -> Result<()> {
        self.check_name(&entity.name)?;
        if let Some(bucket) = self.methods.get(&entity.name) {
            if bucket.iter().any(|m| m.mutating) {
                return Err(Error::unknown(format!(
                    "\"{}\" is a mutating method and must not be registered as a function",
                    entity.name
                )));
            }
        }
        let bucket = self.functions.entry(entity.name.clone()).or_default();
        for existing in bucket.iter() {
            if existing.signature.confusable_with(&entity.signature) {
                return Err(Error::unknown(format!(
                    "function \"{}\" overload {} is confusable with existing {}",
                    entity.name, entity.signature, existing.signature
                )));
            }
        }
        bucket.push(Arc::new(entity));
        Ok(())
    }

    pub fn register_method(&mut self, entity: MethodEntity) -> Result<()> {
        self.check_name(&entity.function.name)?;
        if entity.mutating && self.functions.contains_key(&entity.function.name) {
            return Err(Error::unknown(format!(
                "mutating method \"{}\" collides with a registered function",
                entity.function.name
            )));
        }
        let bucket = self.methods.entry(entity.function.name.clone()).or_default();
        for existing in bucket.iter() {
            let overlapping_operand = existing.operand_types.is_empty()
                || entity.operand_types.is_empty()
                || existing
                    .operand_types
                    .iter()
                    .any(|t| entity.operand_types.contains(t));
            if overlapping_operand
                && existing
                    .function
                    .signature
                    .confusable_with(&entity.function.signature)
            {
                return Err(Error::unknown(format!(
                    "method \"{}\" overload {} is confusable with existing {}",
                    entity.function.name, entity.function.signature, existing.function.signature
                )));
            }
        }
        bucket.push(Arc::new(entity));
        Ok(())
    }

    pub fn register_block(&mut self, factory: BlockFactory) -> Result<()> {
        self.check_name(&factory.name)?;
        if self.meta_blocks.contains(&factory.name) {
            return Err(Error::unknown(format!(
                "\"{}\" is a meta-block name and cannot be registered",
                factory.name
            )));
        }
        if self.blocks.contains_key(&factory.name) {
            return Err(Error::unknown(format!(
                "block \"{}\" is already registered",
                factory.name
            )));
        }
        for antecedent in &factory.chains_to {
            // a chain may name itself (elseif follows elseif)
            if *antecedent != factory.name && !self.blocks.contains_key(antecedent) {
                return Err(Error::unknown(format!(
                    "block \"{}\" chains to unregistered \"{}\"",
                    factory.name, antecedent
                )));
            }
        }
        self.blocks.insert(factory.name.clone(), factory);
        Ok(())
    }

    pub fn register_raw(&mut self, factory: RawFactory) -> Result<()> {
        self.check_name(&factory.name)?;
        if self.raws.contains_key(&factory.name) {
            return Err(Error::unknown(format!(
                "raw handler \"{}\" is already registered",
                factory.name
            )));
        }
        self.raws.insert(factory.name.clone(), factory);
        Ok(())
    }

    pub fn register_type(&mut self, name: impl Into<String>, kind: DataKind) -> Result<()> {
        let name = name.into();
        self.check_name(&name)?;
        self.types.insert(name, kind);
        Ok(())
    }

    pub fn is_meta_block(&self, name: &str) -> bool {
        self.meta_blocks.contains(name)
    }

    pub fn block_factory(&self, name: &str) -> Option<&BlockFactory> {
        self.blocks.get(name)
    }

    pub fn type_identity(&self, name: &str) -> Option<DataKind> {
        self.types.get(name).copied()
    }

    /// Candidate overloads of `name` matching the call tuple, with defaults
    /// back-filled. Zero matches is an error citing the candidates.
    pub fn validate_function(
        &self,
        name: &str,
        tuple: &Tuple,
    ) -> Result<Vec<(Arc<FunctionEntity>, Tuple)>> {
        let Some(bucket) = self.functions.get(name) else {
            return Err(Error::unknown(format!("unknown function \"{}\"", name)));
        };
        let matches: Vec<(Arc<FunctionEntity>, Tuple)> = bucket
            .iter()
            .filter_map(|f| f.signature.matches(tuple).map(|t| (f.clone(), t)))
            .collect();
        if matches.is_empty() {
            let candidates: Vec<String> = bucket
                .iter()
                .map(|f| format!("{}{}", f.name, f.signature))
                .collect();
            return Err(Error::unknown(format!(
                "no overload of \"{}\" matches {}; candidates: {}",
                name,
                tuple,
                candidates.join(", ")
            )));
        }
        Ok(matches)
    }

    /// Candidate method overloads for an operand of (possibly unknown)
    /// stored type.
    pub fn validate_method(
        &self,
        name: &str,
        operand: Option<DataKind>,
        tuple: &Tuple,
    ) -> Result<Vec<(Arc<MethodEntity>, Tuple)>> {
        let Some(bucket) = self.methods.get(name) else {
            return Err(Error::unknown(format!("unknown method \"{}\"", name)));
        };
        let matches: Vec<(Arc<MethodEntity>, Tuple)> = bucket
            .iter()
            .filter(|m| m.accepts_operand(operand))
            .filter_map(|m| m.function.signature.matches(tuple).map(|t| (m.clone(), t)))
            .collect();
        if matches.is_empty() {
            let candidates: Vec<String> = bucket
                .iter()
                .map(|m| format!("{}{}", m.function.name, m.function.signature))
                .collect();
            return Err(Error::unknown(format!(
                "no overload of method \"{}\" matches {}; candidates: {}",
                name,
                tuple,
                candidates.join(", ")
            )));
        }
        Ok(matches)
    }

    /// Instantiate a block for a parsed call.
    pub fn validate_block(
        &self,
        name: &str,
        params: &Tuple,
        location: &SourceLocation,
    ) -> Result<BlockCall> {
        let Some(factory) = self.blocks.get(name) else {
            return Err(Error::parse(
                format!("unknown block \"{}\"", name),
                location.clone(),
            ));
        };
        factory.instantiate(params, location)
    }

    pub fn validate_raw(&self, name: &str) -> Result<RawFactory> {
        self.raws
            .get(name)
            .cloned()
            .ok_or_else(|| Error::unknown(format!("unknown raw handler \"{}\"", name)))
    }

    /// Normalize one tuple against one signature.
    pub fn validate_tuple_call(tuple: &Tuple, signature: &CallSignature) -> Result<Tuple> {
        signature
            .matches(tuple)
            .ok_or_else(|| Error::unknown(format!("call {} does not fit {}", tuple, signature)))
    }
}

static REGISTRY: Lazy<RwLock<Entities>> = Lazy::new(|| RwLock::new(Entities::core_set()));

/// Read access to the shared registry.
pub fn with_registry<R>(read: impl FnOnce(&Entities) -> R) -> Result<R> {
    let guard = REGISTRY
        .read()
        .map_err(|_| Error::unknown("entity registry lock poisoned"))?;
    Ok(read(&guard))
}

/// Mutate the shared registry. Rejected once the engine has started.
pub fn register<R>(mutate: impl FnOnce(&mut Entities) -> Result<R>) -> Result<R> {
    if runtime::started() {
        debug_assert!(
            !runtime::started(),
            "entity registered after engine start"
        );
        return Err(Error::unknown(
            "the entity registry is frozen once the engine has started",
        ));
    }
    let mut guard = REGISTRY
        .write()
        .map_err(|_| Error::unknown("entity registry lock poisoned"))?;
    mutate(&mut guard)
}

/// Register a value under the shared registry; convenience wrappers.
pub fn register_function(entity: FunctionEntity) -> Result<()> {
    register(|e| e.register_function(entity))
}

pub fn register_method(entity: MethodEntity) -> Result<()> {
    register(|e| e.register_method(entity))
}

pub fn register_block(factory: BlockFactory) -> Result<()> {
    register(|e| e.register_block(factory))
}

pub fn register_raw(factory: RawFactory) -> Result<()> {
    register(|e| e.register_raw(factory))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::parameter::Parameter;
    use crate::value::TemplateData;

    #[test]
    fn test_core_set_has_builtins() {
        let entities = Entities::core_set();
        assert!(entities.block_factory("if").is_some());
        assert!(entities.block_factory("for").is_some());
        assert!(entities.validate_raw(DEFAULT_RAW).is_ok());
        assert!(entities.is_meta_block("define"));
        assert_eq!(entities.type_identity("Int"), Some(DataKind::Int));
    }

    #[test]
    fn test_meta_block_names_unregistrable() {
        let mut entities = Entities::core_set();
        let factory = BlockFactory::new("define", &[], |_, location| {
            Err(Error::parse("never", location.clone()))
        });
        assert!(entities.register_block(factory).is_err());
    }

    #[test]
    fn test_invalid_entity_name_rejected() {
        let mut entities = Entities::empty();
        let entity = FunctionEntity::new("2bad", CallSignature::empty(), |_| {
            TemplateData::true_nil()
        });
        assert!(entities.register_function(entity).is_err());
    }

    #[test]
    fn test_confusable_overloads_rejected() {
        let mut entities = Entities::empty();
        let first = FunctionEntity::new(
            "dup",
            CallSignature::new(vec![CallParameter::typed(&[DataKind::Int])]),
            |_| TemplateData::true_nil(),
        );
        let second = FunctionEntity::new(
            "dup",
            CallSignature::new(vec![CallParameter::typed(&[DataKind::Int])]),
            |_| TemplateData::true_nil(),
        );
        entities.register_function(first).unwrap();
        assert!(entities.register_function(second).is_err());
    }

    #[test]
    fn test_distinct_overloads_accepted() {
        let mut entities = Entities::empty();
        let ints = FunctionEntity::new(
            "pick",
            CallSignature::new(vec![CallParameter::typed(&[DataKind::Int])]),
            |_| TemplateData::true_nil(),
        );
        let strings = FunctionEntity::new(
            "pick",
            CallSignature::new(vec![CallParameter::typed(&[DataKind::String])]),
            |_| TemplateData::true_nil(),
        );
        entities.register_function(ints).unwrap();
        entities.register_function(strings).unwrap();
    }

    #[test]
    fn test_mutating_method_never_a_function() {
        let mut entities = Entities::core_set();
        // `append` is registered as a mutating method by the core set.
        let shadow = FunctionEntity::new("append", CallSignature::empty(), |_| {
            TemplateData::true_nil()
        });
        assert!(entities.register_function(shadow).is_err());
    }

    #[test]
    fn test_validate_function_reports_candidates() {
        let entities = Entities::core_set();
        let mut call = Tuple::new();
        call.push(None, Parameter::Value(1i64.into()));
        call.push(None, Parameter::Value(2i64.into()));
        call.push(None, Parameter::Value(3i64.into()));
        let error = entities.validate_function("count", &call).unwrap_err();
        assert!(error.to_string().contains("count("));
    }

    #[test]
    fn test_validate_function_single_match() {
        let entities = Entities::core_set();
        let mut call = Tuple::new();
        call.push(None, Parameter::Value("word".into()));
        let matches = entities.validate_function("count", &call).unwrap();
        assert_eq!(matches.len(), 1);
    }
}
