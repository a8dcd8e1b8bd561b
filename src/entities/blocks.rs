//! Block entities and their scope-evaluation protocol
//!
//! A block instance lives inside a scope frame during serialization and
//! answers the same protocol everywhere: `evaluate_scope` returns how many
//! times the body runs (`Some(0)` discards it, `Some(n)` runs it n times,
//! `None` keeps it open indefinitely and re-asks every pass), and
//! `re_evaluate_scope` refreshes the scope variables between finite passes.
//!
//! Chained blocks (`elseif`, `else`) are a tagged variant of the same enum;
//! the previous-hit bit lives on the scope frame, not here.

use super::functions::CallValues;
use crate::error::{Error, Result, SourceLocation};
use crate::syntax::parameter::{ExpressionForm, Parameter, Tuple};
use crate::syntax::token::Keyword;
use crate::value::TemplateData;
use std::collections::HashMap;
use std::sync::Arc;

/// Extension point for host-registered blocks.
pub trait CustomBlock: Send + Sync {
    fn evaluate_scope(
        &mut self,
        call: &CallValues,
        vars: &mut HashMap<String, TemplateData>,
    ) -> Result<Option<usize>>;

    fn re_evaluate_scope(&mut self, vars: &mut HashMap<String, TemplateData>) -> Result<()>;

    fn clone_block(&self) -> Box<dyn CustomBlock>;
}

/// A block as stored in the AST and instantiated per frame.
pub enum BlockInstance {
    If,
    ElseIf,
    Else,
    For(ForBlock),
    While,
    Custom {
        block: Box<dyn CustomBlock>,
        chains: bool,
    },
}

impl Clone for BlockInstance {
    fn clone(&self) -> Self {
        match self {
            BlockInstance::If => BlockInstance::If,
            BlockInstance::ElseIf => BlockInstance::ElseIf,
            BlockInstance::Else => BlockInstance::Else,
            BlockInstance::For(block) => BlockInstance::For(block.clone()),
            BlockInstance::While => BlockInstance::While,
            BlockInstance::Custom { block, chains } => BlockInstance::Custom {
                block: block.clone_block(),
                chains: *chains,
            },
        }
    }
}

impl std::fmt::Debug for BlockInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockInstance::If => write!(f, "If"),
            BlockInstance::ElseIf => write!(f, "ElseIf"),
            BlockInstance::Else => write!(f, "Else"),
            BlockInstance::For(block) => write!(f, "For({})", block.binding),
            BlockInstance::While => write!(f, "While"),
            BlockInstance::Custom { chains, .. } => write!(f, "Custom(chains: {})", chains),
        }
    }
}

impl BlockInstance {
    /// Whether this block may only follow a chain antecedent.
    pub fn chains(&self) -> bool {
        matches!(self, BlockInstance::ElseIf | BlockInstance::Else)
            || matches!(self, BlockInstance::Custom { chains: true, .. })
    }

    /// Whether this block starts a chain the following siblings test.
    pub fn chain_head(&self) -> bool {
        matches!(self, BlockInstance::If)
    }

    /// First entry into the scope.
    pub fn evaluate_scope(
        &mut self,
        call: &CallValues,
        vars: &mut HashMap<String, TemplateData>,
    ) -> Result<Option<usize>> {
        match self {
            BlockInstance::If | BlockInstance::ElseIf => {
                Ok(Some(usize::from(call.get(0).truthy())))
            }
            BlockInstance::Else => Ok(Some(1)),
            BlockInstance::For(block) => block.evaluate_scope(call, vars),
            BlockInstance::While => Ok(if call.get(0).truthy() { None } else { Some(0) }),
            BlockInstance::Custom { block, .. } => block.evaluate_scope(call, vars),
        }
    }

    /// Entry into the next finite pass of an already-evaluated scope.
    pub fn re_evaluate_scope(&mut self, vars: &mut HashMap<String, TemplateData>) -> Result<()> {
        match self {
            BlockInstance::For(block) => block.re_evaluate_scope(vars),
            BlockInstance::Custom { block, .. } => block.re_evaluate_scope(vars),
            _ => Ok(()),
        }
    }
}

/// `#for(x in collection)` — finite iteration with an index counter.
#[derive(Debug, Clone)]
pub struct ForBlock {
    binding: String,
    items: Vec<(Option<String>, TemplateData)>,
    position: usize,
}

impl ForBlock {
    pub fn new(binding: impl Into<String>) -> Self {
        Self {
            binding: binding.into(),
            items: Vec::new(),
            position: 0,
        }
    }

    fn evaluate_scope(
        &mut self,
        call: &CallValues,
        vars: &mut HashMap<String, TemplateData>,
    ) -> Result<Option<usize>> {
        let collection = call.get(0).evaluate();
        if collection.errored() {
            return Err(Error::serialize(format!(
                "for loop over errored value: {}",
                collection.error_message().unwrap_or("unknown")
            )));
        }
        self.items = if let Some(values) = collection.as_array() {
            values.into_iter().map(|v| (None, v)).collect()
        } else if let Some(map) = collection.as_dictionary() {
            // Dictionary order is unspecified; iterate keys sorted so the
            // rendered order is reproducible.
            let mut entries: Vec<(String, TemplateData)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries.into_iter().map(|(k, v)| (Some(k), v)).collect()
        } else if collection.is_nil() {
            Vec::new()
        } else {
            return Err(Error::serialize(format!(
                "for loop requires a collection, found {}",
                collection.kind()
            )));
        };
        self.position = 0;
        if self.items.is_empty() {
            return Ok(Some(0));
        }
        self.bind(vars);
        Ok(Some(self.items.len()))
    }

    fn re_evaluate_scope(&mut self, vars: &mut HashMap<String, TemplateData>) -> Result<()> {
        self.position += 1;
        self.bind(vars);
        Ok(())
    }

    fn bind(&self, vars: &mut HashMap<String, TemplateData>) {
        let Some((key, value)) = self.items.get(self.position) else {
            return;
        };
        if self.binding != "_" {
            vars.insert(self.binding.clone(), value.clone());
        }
        if let Some(key) = key {
            vars.insert("key".to_string(), key.clone().into());
        }
        vars.insert("index".to_string(), self.position.into());
        vars.insert("isFirst".to_string(), (self.position == 0).into());
        vars.insert(
            "isLast".to_string(),
            (self.position + 1 == self.items.len()).into(),
        );
    }
}

/// Instantiation outcome: the per-frame block plus the call tuple the
/// serializer evaluates on (re)entry.
pub type BlockCall = (BlockInstance, Tuple);

type InstantiateFn = dyn Fn(&Tuple, &SourceLocation) -> Result<BlockCall> + Send + Sync;

/// A registered block entity: a name, the chain antecedents it declares,
/// and an instantiation function validating its parse signature.
#[derive(Clone)]
pub struct BlockFactory {
    pub name: String,
    pub chains_to: Vec<String>,
    instantiate: Arc<InstantiateFn>,
}

impl BlockFactory {
    pub fn new<F>(name: impl Into<String>, chains_to: &[&str], instantiate: F) -> Self
    where
        F: Fn(&Tuple, &SourceLocation) -> Result<BlockCall> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            chains_to: chains_to.iter().map(|s| s.to_string()).collect(),
            instantiate: Arc::new(instantiate),
        }
    }

    pub fn instantiate(&self, params: &Tuple, location: &SourceLocation) -> Result<BlockCall> {
        (self.instantiate)(params, location)
    }
}

fn single_condition(
    name: &str,
    params: &Tuple,
    location: &SourceLocation,
) -> Result<Tuple> {
    if params.len() != 1 || !params.labels().is_empty() {
        return Err(Error::parse(
            format!("#{} expects a single condition", name),
            location.clone(),
        ));
    }
    Ok(params.clone())
}

/// The builtin block set.
pub fn builtin_blocks() -> Vec<BlockFactory> {
    vec![
        BlockFactory::new("if", &[], |params, location| {
            Ok((BlockInstance::If, single_condition("if", params, location)?))
        }),
        BlockFactory::new("elseif", &["if", "elseif"], |params, location| {
            Ok((
                BlockInstance::ElseIf,
                single_condition("elseif", params, location)?,
            ))
        }),
        BlockFactory::new("else", &["if", "elseif"], |params, location| {
            if !params.is_empty() {
                return Err(Error::parse("#else takes no parameters", location.clone()));
            }
            Ok((BlockInstance::Else, Tuple::new()))
        }),
        BlockFactory::new("while", &[], |params, location| {
            Ok((
                BlockInstance::While,
                single_condition("while", params, location)?,
            ))
        }),
        BlockFactory::new("for", &[], |params, location| {
            // Parse signature: a single `binding in collection` element.
            let bad = || {
                Error::parse(
                    "#for expects \"identifier in collection\"",
                    location.clone(),
                )
            };
            if params.len() != 1 {
                return Err(bad());
            }
            let Some(Parameter::Expression(expression)) = params.get(0) else {
                return Err(bad());
            };
            if expression.form() != ExpressionForm::Custom {
                return Err(bad());
            }
            let [binding, keyword, collection] = expression.elements() else {
                return Err(bad());
            };
            if !matches!(keyword, Parameter::Keyword(Keyword::In)) {
                return Err(bad());
            }
            let binding = match binding {
                Parameter::Variable(var) if var.is_atomic() && !var.is_contextualized() => {
                    var.ancestor().to_string()
                }
                Parameter::Keyword(Keyword::Discard) => "_".to_string(),
                _ => return Err(bad()),
            };
            let mut call = Tuple::new();
            call.push(None, collection.clone());
            Ok((BlockInstance::For(ForBlock::new(binding)), call))
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::parameter::Expression;
    use crate::variable::Variable;

    fn vars() -> HashMap<String, TemplateData> {
        HashMap::new()
    }

    #[test]
    fn test_if_block_counts() {
        let mut block = BlockInstance::If;
        let mut scope = vars();
        let hit = block
            .evaluate_scope(&CallValues::positional(vec![true.into()]), &mut scope)
            .unwrap();
        assert_eq!(hit, Some(1));
        let miss = block
            .evaluate_scope(&CallValues::positional(vec![false.into()]), &mut scope)
            .unwrap();
        assert_eq!(miss, Some(0));
    }

    #[test]
    fn test_else_always_hits_and_chains() {
        let mut block = BlockInstance::Else;
        assert!(block.chains());
        assert!(!block.chain_head());
        let count = block
            .evaluate_scope(&CallValues::positional(vec![]), &mut vars())
            .unwrap();
        assert_eq!(count, Some(1));
    }

    #[test]
    fn test_while_is_indefinite() {
        let mut block = BlockInstance::While;
        let open = block
            .evaluate_scope(&CallValues::positional(vec![true.into()]), &mut vars())
            .unwrap();
        assert_eq!(open, None);
        let done = block
            .evaluate_scope(&CallValues::positional(vec![false.into()]), &mut vars())
            .unwrap();
        assert_eq!(done, Some(0));
    }

    #[test]
    fn test_for_block_iterates_array() {
        let mut block = BlockInstance::For(ForBlock::new("a"));
        let mut scope = vars();
        let items = TemplateData::array(vec!["1".into(), "2".into(), "3".into()]);
        let count = block
            .evaluate_scope(&CallValues::positional(vec![items]), &mut scope)
            .unwrap();
        assert_eq!(count, Some(3));
        assert_eq!(scope["a"].as_string().as_deref(), Some("1"));
        assert_eq!(scope["index"].as_int(), Some(0));
        assert_eq!(scope["isFirst"].as_bool(), Some(true));

        block.re_evaluate_scope(&mut scope).unwrap();
        assert_eq!(scope["a"].as_string().as_deref(), Some("2"));
        assert_eq!(scope["index"].as_int(), Some(1));

        block.re_evaluate_scope(&mut scope).unwrap();
        assert_eq!(scope["isLast"].as_bool(), Some(true));
    }

    #[test]
    fn test_for_block_over_dictionary_binds_key() {
        let mut map = HashMap::new();
        map.insert("b".to_string(), TemplateData::from(2i64));
        map.insert("a".to_string(), TemplateData::from(1i64));
        let mut block = BlockInstance::For(ForBlock::new("v"));
        let mut scope = vars();
        let count = block
            .evaluate_scope(
                &CallValues::positional(vec![TemplateData::dictionary(map)]),
                &mut scope,
            )
            .unwrap();
        assert_eq!(count, Some(2));
        assert_eq!(scope["key"].as_string().as_deref(), Some("a"));
        assert_eq!(scope["v"].as_int(), Some(1));
    }

    #[test]
    fn test_for_block_rejects_scalars() {
        let mut block = BlockInstance::For(ForBlock::new("x"));
        let result =
            block.evaluate_scope(&CallValues::positional(vec![5i64.into()]), &mut vars());
        assert!(result.is_err());
    }

    #[test]
    fn test_for_factory_signature() {
        let factory = builtin_blocks()
            .into_iter()
            .find(|f| f.name == "for")
            .unwrap();
        let location = SourceLocation::new("test", 1, 1);

        let mut good = Tuple::new();
        good.push(
            None,
            Parameter::Expression(Box::new(Expression::custom(vec![
                Parameter::Variable(Variable::atom("a").unwrap()),
                Parameter::Keyword(Keyword::In),
                Parameter::Variable(Variable::atom("b").unwrap()),
            ]))),
        );
        assert!(factory.instantiate(&good, &location).is_ok());

        let mut bad = Tuple::new();
        bad.push(None, Parameter::Value(1i64.into()));
        assert!(factory.instantiate(&bad, &location).is_err());
    }

    #[test]
    fn test_chain_declarations() {
        let blocks = builtin_blocks();
        let elseif = blocks.iter().find(|f| f.name == "elseif").unwrap();
        assert_eq!(elseif.chains_to, vec!["if", "elseif"]);
        let if_block = blocks.iter().find(|f| f.name == "if").unwrap();
        assert!(if_block.chains_to.is_empty());
    }
}
