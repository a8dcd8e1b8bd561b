//! Scope frames and the variable stack
//!
//! The variable stack is the LIFO of binding tables built during
//! serialization. Lookups walk frames top-down and fall through to the
//! root frame populated from the render's context; pathed lookups cache
//! every intermediate value in the owning frame's table so repeated
//! descents stay cheap. A pathed write drops the cached descendants of its
//! root to keep the table consistent.

use crate::ast::ScopeRef;
use crate::context::{Context, SELF_SCOPE};
use crate::entities::BlockInstance;
use crate::syntax::parameter::{Parameter, Tuple};
use crate::value::TemplateData;
use crate::variable::Variable;
use std::collections::{HashMap, HashSet};

/// A deferred `#define` body: a scope table or a lazy parameter.
#[derive(Debug, Clone)]
pub enum DefineRecord {
    Scope(ScopeRef),
    Param(Parameter),
}

/// One interpreter frame on the serializer's scope stack.
pub struct ScopeFrame {
    pub table: usize,
    pub offset: usize,
    /// Remaining passes; `None` while an indefinite block stays open.
    pub count: Option<usize>,
    /// Whether the block has evaluated its scope for the current pass.
    pub evaluated: bool,
    pub block: Option<BlockInstance>,
    pub call: Option<Tuple>,
    /// Set when a chain member already hit; later siblings elide.
    pub break_chain: bool,
    /// Frame owns a variable frame on the stack.
    pub allocated: bool,
    /// Frame opened its own output buffer (raw switch).
    pub owns_buffer: bool,
    pub buffer_index: usize,
    pub defines: HashMap<String, DefineRecord>,
}

impl ScopeFrame {
    pub fn plain(table: usize, buffer_index: usize) -> Self {
        Self {
            table,
            offset: 0,
            count: Some(1),
            evaluated: true,
            block: None,
            call: None,
            break_chain: false,
            allocated: false,
            owns_buffer: false,
            buffer_index,
            defines: HashMap::new(),
        }
    }

    pub fn for_block(
        table: usize,
        buffer_index: usize,
        block: BlockInstance,
        call: Tuple,
    ) -> Self {
        Self {
            table,
            offset: 0,
            count: None,
            evaluated: false,
            block: Some(block),
            call: Some(call),
            break_chain: false,
            allocated: false,
            owns_buffer: false,
            buffer_index,
            defines: HashMap::new(),
        }
    }
}

/// One binding table on the variable stack.
struct VarFrame {
    declared: HashSet<String>,
    constants: HashSet<String>,
    table: HashMap<String, TemplateData>,
}

impl VarFrame {
    fn new() -> Self {
        Self {
            declared: HashSet::new(),
            constants: HashSet::new(),
            table: HashMap::new(),
        }
    }

    fn owns(&self, root: &str) -> bool {
        self.declared.contains(root)
    }

    /// Drop cached descendants of a rewritten root.
    fn invalidate(&mut self, root: &str) {
        let prefix = format!("{}.", root);
        self.table.retain(|key, _| !key.starts_with(&prefix));
    }
}

/// Outcome of a variable write.
#[derive(Debug, PartialEq)]
pub enum WriteOutcome {
    Written,
    Undeclared,
    Constant,
}

pub struct VariableStack {
    frames: Vec<VarFrame>,
}

impl VariableStack {
    /// Build the root frame from a render context.
    pub fn new(context: &Context) -> Self {
        let mut root = VarFrame::new();

        let self_value = context.root_value();
        if let Some(entries) = self_value.as_dictionary() {
            for (key, value) in entries {
                root.declared.insert(key.clone());
                root.table.insert(key, value);
            }
        }
        root.declared.insert(SELF_SCOPE.to_string());
        root.table.insert(SELF_SCOPE.to_string(), self_value);

        let mut stack = Self { frames: vec![root] };
        for (name, dictionary) in context.scopes() {
            if name != SELF_SCOPE {
                stack.publish_scope(name, dictionary.as_value());
            }
        }
        stack
    }

    /// The root context dictionary (`self`).
    pub fn self_value(&self) -> TemplateData {
        self.frames
            .first()
            .and_then(|root| root.table.get(SELF_SCOPE).cloned())
            .unwrap_or_else(TemplateData::true_nil)
    }

    /// Register a contextual scope (`$name`) in the root frame.
    pub fn publish_scope(&mut self, name: &str, value: TemplateData) {
        if let Some(root) = self.frames.first_mut() {
            let key = format!("${}", name);
            root.declared.insert(key.clone());
            root.table.insert(key, value);
        }
    }

    pub fn push_frame(&mut self) {
        self.frames.push(VarFrame::new());
    }

    pub fn pop_frame(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Replace the top frame's bindings with a block's scope variables.
    pub fn rebind_top(&mut self, bindings: HashMap<String, TemplateData>) {
        if self.frames.len() < 2 {
            return;
        }
        if let Some(top) = self.frames.last_mut() {
            top.declared = bindings.keys().cloned().collect();
            top.constants.clear();
            top.table = bindings;
        }
    }

    /// Declare a binding in the top frame.
    pub fn declare(&mut self, name: &str, value: TemplateData, constant: bool) -> WriteOutcome {
        let Some(top) = self.frames.last_mut() else {
            return WriteOutcome::Undeclared;
        };
        if top.owns(name) && top.constants.contains(name) {
            return WriteOutcome::Constant;
        }
        top.declared.insert(name.to_string());
        if constant {
            top.constants.insert(name.to_string());
        }
        top.invalidate(name);
        top.table.insert(name.to_string(), value);
        WriteOutcome::Written
    }

    fn root_key(variable: &Variable) -> String {
        if variable.is_contextualized() {
            format!("${}", variable.ancestor())
        } else {
            variable.ancestor().to_string()
        }
    }

    fn flat_key(variable: &Variable) -> String {
        let mut key = Self::root_key(variable);
        for part in &variable.parts()[1..] {
            key.push('.');
            key.push_str(part);
        }
        key
    }

    /// Look up a variable. Walks frames top-down, resolving the root first
    /// and descending through dictionary members, caching each intermediate
    /// in the owning frame. `None` means the root is unknown everywhere.
    pub fn match_key(&mut self, variable: &Variable) -> Option<TemplateData> {
        let root = Self::root_key(variable);
        let frame_index = self
            .frames
            .iter()
            .rposition(|frame| frame.owns(&root))?;

        let flat = Self::flat_key(variable);
        let frame = &mut self.frames[frame_index];
        if let Some(cached) = frame.table.get(&flat) {
            return Some(cached.clone());
        }

        let mut current = frame.table.get(&root)?.clone();
        let mut path = root;
        for part in &variable.parts()[1..] {
            if current.errored() {
                return Some(current);
            }
            path.push('.');
            path.push_str(part);
            current = match current.member(part) {
                Some(next) => next,
                None => {
                    return Some(if current.is_collection() || current.is_nil() {
                        TemplateData::true_nil()
                    } else {
                        TemplateData::error(format!(
                            "\"{}\" has no member \"{}\"",
                            path, part
                        ))
                    })
                }
            };
            frame.table.insert(path.clone(), current.clone());
        }
        Some(current)
    }

    /// Write a variable in the nearest frame owning its root.
    pub fn assign(&mut self, variable: &Variable, value: TemplateData) -> WriteOutcome {
        let root = Self::root_key(variable);
        let Some(frame_index) = self.frames.iter().rposition(|frame| frame.owns(&root)) else {
            return WriteOutcome::Undeclared;
        };
        let frame = &mut self.frames[frame_index];
        if frame.constants.contains(&root) {
            return WriteOutcome::Constant;
        }

        if variable.is_atomic() {
            frame.invalidate(&root);
            frame.table.insert(root, value);
            return WriteOutcome::Written;
        }

        let Some(current) = frame.table.get(&root).cloned() else {
            return WriteOutcome::Undeclared;
        };
        let Some(updated) = write_path(&current, &variable.parts()[1..], value) else {
            return WriteOutcome::Undeclared;
        };
        frame.invalidate(&root);
        frame.table.insert(root, updated);
        WriteOutcome::Written
    }
}

/// Rebuild a dictionary value with one path replaced.
fn write_path(
    current: &TemplateData,
    parts: &[String],
    value: TemplateData,
) -> Option<TemplateData> {
    let Some((head, rest)) = parts.split_first() else {
        return Some(value);
    };
    let mut entries = current.as_dictionary()?;
    let next = match entries.get(head) {
        Some(inner) => write_path(inner, rest, value)?,
        None if rest.is_empty() => value,
        None => return None,
    };
    entries.insert(head.clone(), next);
    Some(TemplateData::dictionary(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stack(data: serde_json::Value) -> VariableStack {
        VariableStack::new(&Context::from_json(data).unwrap())
    }

    fn var(path: &str) -> Variable {
        let mut parts = path.split('.');
        let mut variable = Variable::atom(parts.next().unwrap()).unwrap();
        for part in parts {
            variable = variable.extended(part).unwrap();
        }
        variable
    }

    #[test]
    fn test_root_lookup() {
        let mut stack = stack(json!({"a": 1}));
        assert_eq!(stack.match_key(&var("a")).unwrap().as_int(), Some(1));
        assert!(stack.match_key(&var("missing")).is_none());
    }

    #[test]
    fn test_pathed_lookup_caches_intermediates() {
        let mut stack = stack(json!({"todo": {"title": "Template!"}}));
        let value = stack.match_key(&var("todo.title")).unwrap();
        assert_eq!(value.as_string().as_deref(), Some("Template!"));
        // cached flat key resolves without re-descending
        let again = stack.match_key(&var("todo.title")).unwrap();
        assert_eq!(again.as_string().as_deref(), Some("Template!"));
    }

    #[test]
    fn test_missing_member_of_collection_is_nil() {
        let mut stack = stack(json!({"todo": {"title": "x"}}));
        let value = stack.match_key(&var("todo.absent")).unwrap();
        assert!(value.is_true_nil());
    }

    #[test]
    fn test_member_of_scalar_is_errored() {
        let mut stack = stack(json!({"n": 3}));
        let value = stack.match_key(&var("n.member")).unwrap();
        assert!(value.errored());
    }

    #[test]
    fn test_write_then_match() {
        let mut stack = stack(json!({}));
        stack.push_frame();
        stack.declare("x", 1i64.into(), false);
        assert_eq!(stack.match_key(&var("x")).unwrap().as_int(), Some(1));
        assert_eq!(stack.assign(&var("x"), 2i64.into()), WriteOutcome::Written);
        assert_eq!(stack.match_key(&var("x")).unwrap().as_int(), Some(2));
        stack.pop_frame();
        assert!(stack.match_key(&var("x")).is_none());
    }

    #[test]
    fn test_shadowing_inner_frame_wins() {
        let mut stack = stack(json!({"x": 1}));
        stack.push_frame();
        stack.declare("x", 10i64.into(), false);
        assert_eq!(stack.match_key(&var("x")).unwrap().as_int(), Some(10));
        stack.pop_frame();
        assert_eq!(stack.match_key(&var("x")).unwrap().as_int(), Some(1));
    }

    #[test]
    fn test_constant_rejects_write() {
        let mut stack = stack(json!({}));
        stack.push_frame();
        stack.declare("k", 1i64.into(), true);
        assert_eq!(stack.assign(&var("k"), 2i64.into()), WriteOutcome::Constant);
    }

    #[test]
    fn test_pathed_write_drops_cached_descendants() {
        let mut stack = stack(json!({"user": {"name": "a", "age": 1}}));
        // warm the cache
        assert_eq!(
            stack.match_key(&var("user.name")).unwrap().as_string().as_deref(),
            Some("a")
        );
        assert_eq!(
            stack.assign(&var("user.name"), "b".into()),
            WriteOutcome::Written
        );
        assert_eq!(
            stack.match_key(&var("user.name")).unwrap().as_string().as_deref(),
            Some("b")
        );
        // sibling keys survive the rewrite
        assert_eq!(stack.match_key(&var("user.age")).unwrap().as_int(), Some(1));
    }

    #[test]
    fn test_contextualized_scope() {
        let mut stack = stack(json!({}));
        let mut entries = HashMap::new();
        entries.insert("key".to_string(), TemplateData::from("k"));
        stack.publish_scope("api", TemplateData::dictionary(entries));
        let variable = Variable::scope("api").unwrap().extended("key").unwrap();
        assert_eq!(
            stack.match_key(&variable).unwrap().as_string().as_deref(),
            Some("k")
        );
    }

    #[test]
    fn test_self_resolves_to_root() {
        let stack = stack(json!({"a": 1}));
        let value = stack.self_value();
        assert_eq!(value.member("a").and_then(|v| v.as_int()), Some(1));
    }
}
