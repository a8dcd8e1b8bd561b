//! Compiled template representation
//!
//! An AST is an arena of scope tables: each table is an ordered sequence of
//! `Syntax` nodes, and tables reference one another by integer index only.
//! No node holds a direct pointer into the arena, which keeps inlining (the
//! resolver splices dependency tables in with an offset) a pure index
//! rewrite.

use crate::entities::BlockInstance;
use crate::syntax::parameter::{Parameter, Tuple};
use crate::variable::Variable;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

/// Cache key: the source a template was read from plus its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AstKey {
    pub source: String,
    pub name: String,
}

impl AstKey {
    pub fn new(source: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
        }
    }

    /// Key for a template whose source is not pinned.
    pub fn searched(name: impl Into<String>) -> Self {
        Self::new("$default", name)
    }
}

impl std::fmt::Display for AstKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source, self.name)
    }
}

/// Reference from a block to its body table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeRef {
    /// Placeholder while a body is still being parsed.
    Unset,
    /// A full scope table.
    Table(usize),
    /// A single-statement body; stored as a table but entered without the
    /// bookkeeping a full scope needs.
    Atomic(usize),
}

impl ScopeRef {
    pub fn table_index(&self) -> Option<usize> {
        match self {
            ScopeRef::Unset => None,
            ScopeRef::Table(index) | ScopeRef::Atomic(index) => Some(*index),
        }
    }

    /// Shift the reference by a splice offset.
    pub fn offset(&self, by: usize) -> ScopeRef {
        match self {
            ScopeRef::Unset => ScopeRef::Unset,
            ScopeRef::Table(index) => ScopeRef::Table(index + by),
            ScopeRef::Atomic(index) => ScopeRef::Atomic(index + by),
        }
    }
}

/// Meta-blocks carry their own parse/serialize semantics.
#[derive(Debug, Clone)]
pub enum MetaBlock {
    /// `#define(id)` with a body scope or `#define(id = expr)`.
    Define {
        id: String,
        value: Option<Parameter>,
        scope: ScopeRef,
    },
    /// `#evaluate(id)` / `#evaluate(id ?? default)`.
    Evaluate {
        id: String,
        default: Option<Parameter>,
    },
    /// `#inline("name", as: template)` before resolution.
    InlineTemplate { name: String },
    /// `#inline("name", as: raw)` or with a named handler.
    InlineRaw { name: String, handler: String },
    /// `#raw:` buffer switch (default handler only).
    RawSwitch { handler: String, scope: ScopeRef },
}

/// One node in a scope table.
#[derive(Debug, Clone)]
pub enum Syntax {
    /// Raw output span.
    Raw(String),
    /// An expression or call whose value is appended to the output.
    Passthrough(Parameter),
    /// A block and the scope its body occupies.
    Block {
        name: String,
        instance: BlockInstance,
        call: Tuple,
        scope: ScopeRef,
    },
    Meta(MetaBlock),
    /// A resolved inline: enter another table directly.
    Jump(ScopeRef),
}

impl Syntax {
    /// Rewrite scope references by a splice offset.
    pub fn offset_scopes(&mut self, by: usize) {
        match self {
            Syntax::Block { scope, .. } => *scope = scope.offset(by),
            Syntax::Meta(MetaBlock::Define { scope, .. }) => *scope = scope.offset(by),
            Syntax::Meta(MetaBlock::RawSwitch { scope, .. }) => *scope = scope.offset(by),
            Syntax::Jump(scope) => *scope = scope.offset(by),
            _ => {}
        }
    }
}

/// Aggregated execution samples for a cached AST.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TouchStats {
    pub count: u64,
    pub average_exec_micros: f64,
    pub average_size: f64,
}

/// One execution sample.
#[derive(Debug, Clone, Copy)]
pub struct Touch {
    pub exec_time: Duration,
    pub size: usize,
}

impl TouchStats {
    /// Fold one sample into the running averages. Idempotent aggregation:
    /// folding the same combined batch in any order yields the same means.
    pub fn aggregate(&mut self, touch: Touch) {
        let count = self.count as f64;
        let micros = touch.exec_time.as_micros() as f64;
        self.average_exec_micros = (self.average_exec_micros * count + micros) / (count + 1.0);
        self.average_size = (self.average_size * count + touch.size as f64) / (count + 1.0);
        self.count += 1;
    }

    pub fn merge(&mut self, other: &TouchStats) {
        let total = self.count + other.count;
        if total == 0 {
            return;
        }
        let weight = |stat: f64, count: u64| stat * count as f64;
        self.average_exec_micros = (weight(self.average_exec_micros, self.count)
            + weight(other.average_exec_micros, other.count))
            / total as f64;
        self.average_size = (weight(self.average_size, self.count)
            + weight(other.average_size, other.count))
            / total as f64;
        self.count = total;
    }
}

/// Compile metadata attached to every AST.
#[derive(Debug, Clone)]
pub struct AstInfo {
    /// Template names this AST inlines but has not yet spliced.
    pub required_asts: HashSet<String>,
    /// Raw file names this AST references.
    pub required_raws: HashSet<String>,
    /// Context variables the template reads.
    pub required_vars: HashSet<Variable>,
    /// Deepest scope nesting observed by the parser.
    pub max_depth: usize,
    /// Lower bound on the rendered output size in bytes.
    pub underestimated_size: usize,
    pub parsed_at: SystemTime,
    pub resolved: bool,
    pub cached: bool,
    pub touches: TouchStats,
    pub last_poll: Option<SystemTime>,
}

impl Default for AstInfo {
    fn default() -> Self {
        Self {
            required_asts: HashSet::new(),
            required_raws: HashSet::new(),
            required_vars: HashSet::new(),
            max_depth: 0,
            underestimated_size: 0,
            parsed_at: SystemTime::now(),
            resolved: false,
            cached: false,
            touches: TouchStats::default(),
            last_poll: None,
        }
    }
}

/// A compiled template document.
#[derive(Debug, Clone)]
pub struct Ast {
    pub key: AstKey,
    /// The scope-table arena; table 0 is the document body.
    pub scopes: Vec<Vec<Syntax>>,
    /// Raw buffers embedded at resolve time.
    pub raws: HashMap<String, Vec<u8>>,
    pub info: AstInfo,
}

impl Ast {
    pub fn new(key: AstKey, scopes: Vec<Vec<Syntax>>, info: AstInfo) -> Self {
        Self {
            key,
            scopes,
            raws: HashMap::new(),
            info,
        }
    }

    pub fn table(&self, index: usize) -> Option<&[Syntax]> {
        self.scopes.get(index).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_ref_offsets() {
        assert_eq!(ScopeRef::Table(2).offset(3), ScopeRef::Table(5));
        assert_eq!(ScopeRef::Atomic(0).offset(3), ScopeRef::Atomic(3));
        assert_eq!(ScopeRef::Unset.offset(3), ScopeRef::Unset);
    }

    #[test]
    fn test_syntax_offset_rewrites_blocks_and_jumps() {
        let mut jump = Syntax::Jump(ScopeRef::Table(1));
        jump.offset_scopes(4);
        assert!(matches!(jump, Syntax::Jump(ScopeRef::Table(5))));

        let mut raw = Syntax::Raw("text".into());
        raw.offset_scopes(4);
        assert!(matches!(raw, Syntax::Raw(_)));
    }

    #[test]
    fn test_touch_aggregation_running_average() {
        let mut stats = TouchStats::default();
        stats.aggregate(Touch {
            exec_time: Duration::from_micros(100),
            size: 10,
        });
        stats.aggregate(Touch {
            exec_time: Duration::from_micros(300),
            size: 30,
        });
        assert_eq!(stats.count, 2);
        assert!((stats.average_exec_micros - 200.0).abs() < f64::EPSILON);
        assert!((stats.average_size - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_touch_merge_weights_by_count() {
        let mut a = TouchStats {
            count: 1,
            average_exec_micros: 100.0,
            average_size: 10.0,
        };
        let b = TouchStats {
            count: 3,
            average_exec_micros: 200.0,
            average_size: 20.0,
        };
        a.merge(&b);
        assert_eq!(a.count, 4);
        assert!((a.average_exec_micros - 175.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(AstKey::new("memory", "index").to_string(), "memory:index");
        assert_eq!(AstKey::searched("index").source, "$default");
    }
}
