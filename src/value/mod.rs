//! The dynamic value model for template data
//!
//! `TemplateData` is the single value type threaded through the whole
//! pipeline: context variables, expression evaluation, function calls and
//! the serialized output all traffic in it. It is a tagged union over the
//! template-visible types plus a `void` sentinel, with a state mask that
//! classifies each value independently of its stored tag.
//!
//! Values are immutable once constructed; mutating methods produce a new
//! value. A value may also wrap a zero-argument producer (a lazy thunk),
//! in which case it is `variant` and resolves to a concrete value through
//! one `evaluate` call.

pub mod convert;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub use convert::Conversion;

/// Stored type tag of a `TemplateData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Bool,
    Int,
    Double,
    String,
    Data,
    Array,
    Dictionary,
    Void,
}

impl DataKind {
    pub fn short_name(&self) -> &'static str {
        match self {
            DataKind::Bool => "bool",
            DataKind::Int => "int",
            DataKind::Double => "double",
            DataKind::String => "string",
            DataKind::Data => "data",
            DataKind::Array => "array",
            DataKind::Dictionary => "dictionary",
            DataKind::Void => "void",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, DataKind::Int | DataKind::Double)
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, DataKind::Array | DataKind::Dictionary)
    }

    pub fn is_comparable(&self) -> bool {
        matches!(self, DataKind::Int | DataKind::Double | DataKind::String)
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Independent classification bits for a value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataState {
    pub numeric: bool,
    pub comparable: bool,
    pub collection: bool,
    pub nil: bool,
    pub variant: bool,
    pub errored: bool,
}

/// Zero-argument producer backing a lazy value.
pub type LazyProducer = Arc<dyn Fn() -> TemplateData + Send + Sync>;

#[derive(Clone)]
enum Storage {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Data(Vec<u8>),
    Array(Vec<TemplateData>),
    Dictionary(HashMap<String, TemplateData>),
    /// Lazy thunk; `returns` is the advertised stored type.
    Lazy {
        produce: LazyProducer,
        returns: DataKind,
    },
    /// Absent value that still carries its intended type.
    Nil(DataKind),
    Error(String),
}

/// The tagged value union used everywhere in the engine.
#[derive(Clone)]
pub struct TemplateData {
    storage: Storage,
}

impl TemplateData {
    /// The sentinel absent, void-typed value.
    pub fn true_nil() -> Self {
        Self {
            storage: Storage::Nil(DataKind::Void),
        }
    }

    /// An absent value carrying its intended type.
    pub fn nil(kind: DataKind) -> Self {
        Self {
            storage: Storage::Nil(kind),
        }
    }

    /// An errored value with an attached message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            storage: Storage::Error(message.into()),
        }
    }

    /// A lazy value produced on demand. Marked `variant` until evaluated.
    pub fn lazy<F>(returns: DataKind, produce: F) -> Self
    where
        F: Fn() -> TemplateData + Send + Sync + 'static,
    {
        Self {
            storage: Storage::Lazy {
                produce: Arc::new(produce),
                returns,
            },
        }
    }

    pub fn array(values: Vec<TemplateData>) -> Self {
        Self {
            storage: Storage::Array(values),
        }
    }

    pub fn dictionary(values: HashMap<String, TemplateData>) -> Self {
        Self {
            storage: Storage::Dictionary(values),
        }
    }

    /// The stored type tag. Lazy values report their advertised type, nil
    /// values their intended type, errored values `void`.
    pub fn kind(&self) -> DataKind {
        match &self.storage {
            Storage::Bool(_) => DataKind::Bool,
            Storage::Int(_) => DataKind::Int,
            Storage::Double(_) => DataKind::Double,
            Storage::String(_) => DataKind::String,
            Storage::Data(_) => DataKind::Data,
            Storage::Array(_) => DataKind::Array,
            Storage::Dictionary(_) => DataKind::Dictionary,
            Storage::Lazy { returns, .. } => *returns,
            Storage::Nil(kind) => *kind,
            Storage::Error(_) => DataKind::Void,
        }
    }

    /// The full state mask for this value.
    pub fn state(&self) -> DataState {
        let kind = self.kind();
        DataState {
            numeric: kind.is_numeric(),
            comparable: kind.is_comparable(),
            collection: kind.is_collection(),
            nil: matches!(self.storage, Storage::Nil(_)),
            variant: matches!(self.storage, Storage::Lazy { .. }),
            errored: matches!(self.storage, Storage::Error(_)),
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self.storage, Storage::Nil(_))
    }

    /// True only for the void-typed nil sentinel.
    pub fn is_true_nil(&self) -> bool {
        matches!(self.storage, Storage::Nil(DataKind::Void))
    }

    pub fn is_numeric(&self) -> bool {
        self.kind().is_numeric()
    }

    pub fn is_collection(&self) -> bool {
        self.kind().is_collection()
    }

    pub fn is_variant(&self) -> bool {
        matches!(self.storage, Storage::Lazy { .. })
    }

    pub fn errored(&self) -> bool {
        matches!(self.storage, Storage::Error(_))
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.storage {
            Storage::Error(message) => Some(message),
            _ => None,
        }
    }

    /// A value is invariant when it can never change between evaluations.
    pub fn invariant(&self) -> bool {
        match &self.storage {
            Storage::Lazy { .. } | Storage::Error(_) => false,
            Storage::Array(values) => values.iter().all(TemplateData::invariant),
            Storage::Dictionary(values) => values.values().all(TemplateData::invariant),
            _ => true,
        }
    }

    /// Resolve a lazy value into a concrete one. Non-lazy values pass
    /// through unchanged; a single evaluation suffices per the value model.
    pub fn evaluate(&self) -> TemplateData {
        match &self.storage {
            Storage::Lazy { produce, .. } => {
                let produced = produce();
                // A producer may hand back another thunk; flatten once more.
                if produced.is_variant() {
                    produced.evaluate()
                } else {
                    produced
                }
            }
            _ => self.clone(),
        }
    }

    // Accessors attempt coercion and return `None` where the lattice says
    // the conversion is ambiguous or the payload does not fit.

    pub fn as_bool(&self) -> Option<bool> {
        match &self.storage {
            Storage::Bool(b) => Some(*b),
            Storage::Int(i) => Some(*i != 0),
            Storage::Double(d) => Some(*d != 0.0),
            Storage::String(s) => convert::string_to_bool(s),
            Storage::Array(_) | Storage::Dictionary(_) => Some(true),
            Storage::Lazy { .. } => self.evaluate().as_bool(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match &self.storage {
            Storage::Bool(b) => Some(i64::from(*b)),
            Storage::Int(i) => Some(*i),
            Storage::Double(d) => convert::double_to_int(*d),
            Storage::String(s) => s.trim().parse().ok(),
            Storage::Lazy { .. } => self.evaluate().as_int(),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match &self.storage {
            Storage::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Storage::Int(i) => Some(*i as f64),
            Storage::Double(d) => Some(*d),
            Storage::String(s) => s.trim().parse().ok(),
            Storage::Lazy { .. } => self.evaluate().as_double(),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match &self.storage {
            Storage::Bool(b) => Some(b.to_string()),
            Storage::Int(i) => Some(i.to_string()),
            Storage::Double(d) => Some(convert::format_double(*d)),
            Storage::String(s) => Some(s.clone()),
            Storage::Data(bytes) => String::from_utf8(bytes.clone()).ok(),
            Storage::Lazy { .. } => self.evaluate().as_string(),
            _ => None,
        }
    }

    /// Canonical value-representable accessor: the raw byte form of the
    /// value, where one exists.
    pub fn as_data(&self) -> Option<Vec<u8>> {
        match &self.storage {
            Storage::Data(bytes) => Some(bytes.clone()),
            Storage::String(s) => Some(s.clone().into_bytes()),
            Storage::Lazy { .. } => self.evaluate().as_data(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<Vec<TemplateData>> {
        match &self.storage {
            Storage::Array(values) => Some(values.clone()),
            Storage::Lazy { .. } => self.evaluate().as_array(),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<HashMap<String, TemplateData>> {
        match &self.storage {
            Storage::Dictionary(values) => Some(values.clone()),
            Storage::Lazy { .. } => self.evaluate().as_dictionary(),
            _ => None,
        }
    }

    /// Member lookup on a dictionary value.
    pub fn member(&self, key: &str) -> Option<TemplateData> {
        match &self.storage {
            Storage::Dictionary(values) => values.get(key).cloned(),
            Storage::Lazy { .. } => self.evaluate().member(key),
            _ => None,
        }
    }

    /// Index lookup on an array value.
    pub fn element(&self, index: usize) -> Option<TemplateData> {
        match &self.storage {
            Storage::Array(values) => values.get(index).cloned(),
            Storage::Lazy { .. } => self.evaluate().element(index),
            _ => None,
        }
    }

    /// Element count of a collection or string value.
    pub fn count(&self) -> Option<usize> {
        match &self.storage {
            Storage::Array(values) => Some(values.len()),
            Storage::Dictionary(values) => Some(values.len()),
            Storage::String(s) => Some(s.chars().count()),
            Storage::Data(bytes) => Some(bytes.len()),
            Storage::Lazy { .. } => self.evaluate().count(),
            _ => None,
        }
    }

    /// Rating of a conversion from this value's stored type to `to`.
    pub fn conversion(&self, to: DataKind) -> Conversion {
        convert::rating(self.kind(), to)
    }

    /// Convert at `Castable` strength or better.
    pub fn cast(&self, to: DataKind) -> TemplateData {
        if self.conversion(to) >= Conversion::Castable {
            convert::perform(self, to)
        } else {
            TemplateData::error(format!(
                "cannot cast {} to {}",
                self.kind(),
                to
            ))
        }
    }

    /// Convert at `Coercible` strength or better.
    pub fn coerce(&self, to: DataKind) -> TemplateData {
        if self.conversion(to) >= Conversion::Coercible {
            convert::perform(self, to)
        } else {
            TemplateData::error(format!(
                "cannot coerce {} to {}",
                self.kind(),
                to
            ))
        }
    }

    /// Truthiness for control flow: errored and nil are false, numerics
    /// compare against zero, strings and collections against emptiness.
    pub fn truthy(&self) -> bool {
        match &self.storage {
            Storage::Bool(b) => *b,
            Storage::Int(i) => *i != 0,
            Storage::Double(d) => *d != 0.0,
            Storage::String(s) => convert::string_to_bool(s).unwrap_or(!s.is_empty()),
            Storage::Data(bytes) => !bytes.is_empty(),
            Storage::Array(values) => !values.is_empty(),
            Storage::Dictionary(values) => !values.is_empty(),
            Storage::Lazy { .. } => self.evaluate().truthy(),
            Storage::Nil(_) | Storage::Error(_) => false,
        }
    }
}

impl PartialEq for TemplateData {
    fn eq(&self, other: &Self) -> bool {
        match (&self.storage, &other.storage) {
            (Storage::Bool(l), Storage::Bool(r)) => l == r,
            (Storage::Int(l), Storage::Int(r)) => l == r,
            (Storage::Double(l), Storage::Double(r)) => l == r,
            (Storage::Int(l), Storage::Double(r)) | (Storage::Double(r), Storage::Int(l)) => {
                (*l as f64) == *r
            }
            (Storage::String(l), Storage::String(r)) => l == r,
            (Storage::Data(l), Storage::Data(r)) => l == r,
            (Storage::Array(l), Storage::Array(r)) => l == r,
            (Storage::Dictionary(l), Storage::Dictionary(r)) => l == r,
            (Storage::Nil(l), Storage::Nil(r)) => l == r,
            _ => {
                // Last resort: two invariant, non-nil values compare by
                // their serialized forms.
                if self.invariant()
                    && other.invariant()
                    && !self.is_nil()
                    && !other.is_nil()
                    && !self.errored()
                    && !other.errored()
                {
                    self.to_string() == other.to_string()
                } else {
                    false
                }
            }
        }
    }
}

impl fmt::Display for TemplateData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.storage {
            Storage::Bool(b) => write!(f, "{}", b),
            Storage::Int(i) => write!(f, "{}", i),
            Storage::Double(d) => write!(f, "{}", convert::format_double(*d)),
            Storage::String(s) => write!(f, "{}", s),
            Storage::Data(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
            Storage::Array(values) => {
                write!(f, "[")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", value)?;
                }
                write!(f, "]")
            }
            Storage::Dictionary(values) => {
                // Keys are sorted so repeated renders of the same value are
                // byte-identical even though storage order is unspecified.
                let mut keys: Vec<&String> = values.keys().collect();
                keys.sort();
                write!(f, "[")?;
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\": {}", key, values[*key])?;
                }
                write!(f, "]")
            }
            Storage::Lazy { .. } => write!(f, "{}", self.evaluate()),
            Storage::Nil(_) => Ok(()),
            Storage::Error(message) => write!(f, "<error: {}>", message),
        }
    }
}

impl fmt::Debug for TemplateData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.storage {
            Storage::Nil(kind) => write!(f, "nil({})", kind),
            Storage::Error(message) => write!(f, "error({:?})", message),
            Storage::Lazy { returns, .. } => write!(f, "lazy({})", returns),
            Storage::String(s) => write!(f, "{:?}", s),
            _ => write!(f, "{}({})", self.kind(), self),
        }
    }
}

impl From<bool> for TemplateData {
    fn from(v: bool) -> Self {
        Self {
            storage: Storage::Bool(v),
        }
    }
}

impl From<i64> for TemplateData {
    fn from(v: i64) -> Self {
        Self {
            storage: Storage::Int(v),
        }
    }
}

impl From<i32> for TemplateData {
    fn from(v: i32) -> Self {
        Self {
            storage: Storage::Int(v as i64),
        }
    }
}

impl From<usize> for TemplateData {
    fn from(v: usize) -> Self {
        Self {
            storage: Storage::Int(v as i64),
        }
    }
}

impl From<f64> for TemplateData {
    fn from(v: f64) -> Self {
        Self {
            storage: Storage::Double(v),
        }
    }
}

impl From<&str> for TemplateData {
    fn from(v: &str) -> Self {
        Self {
            storage: Storage::String(v.to_string()),
        }
    }
}

impl From<String> for TemplateData {
    fn from(v: String) -> Self {
        Self {
            storage: Storage::String(v),
        }
    }
}

impl From<Vec<u8>> for TemplateData {
    fn from(v: Vec<u8>) -> Self {
        Self {
            storage: Storage::Data(v),
        }
    }
}

impl From<Vec<TemplateData>> for TemplateData {
    fn from(v: Vec<TemplateData>) -> Self {
        TemplateData::array(v)
    }
}

impl From<HashMap<String, TemplateData>> for TemplateData {
    fn from(v: HashMap<String, TemplateData>) -> Self {
        TemplateData::dictionary(v)
    }
}

impl<T> From<Option<T>> for TemplateData
where
    T: Into<TemplateData>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(value) => value.into(),
            None => TemplateData::true_nil(),
        }
    }
}

impl From<serde_json::Value> for TemplateData {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => TemplateData::true_nil(),
            serde_json::Value::Bool(b) => b.into(),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    i.into()
                } else {
                    n.as_f64().unwrap_or(0.0).into()
                }
            }
            serde_json::Value::String(s) => s.into(),
            serde_json::Value::Array(values) => {
                TemplateData::array(values.into_iter().map(TemplateData::from).collect())
            }
            serde_json::Value::Object(map) => TemplateData::dictionary(
                map.into_iter().map(|(k, v)| (k, TemplateData::from(v))).collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_and_state() {
        let value = TemplateData::from(42i64);
        assert_eq!(value.kind(), DataKind::Int);
        let state = value.state();
        assert!(state.numeric && state.comparable);
        assert!(!state.nil && !state.variant && !state.errored);
    }

    #[test]
    fn test_true_nil_is_void_typed() {
        let value = TemplateData::true_nil();
        assert!(value.is_nil());
        assert!(value.is_true_nil());
        assert_eq!(value.kind(), DataKind::Void);
        assert_eq!(value.to_string(), "");
    }

    #[test]
    fn test_typed_nil_keeps_its_kind() {
        let value = TemplateData::nil(DataKind::String);
        assert!(value.is_nil());
        assert!(!value.is_true_nil());
        assert_eq!(value.kind(), DataKind::String);
    }

    #[test]
    fn test_errored_state_and_message() {
        let value = TemplateData::error("division by zero");
        assert!(value.errored());
        assert!(value.state().errored);
        assert_eq!(value.error_message(), Some("division by zero"));
    }

    #[test]
    fn test_lazy_resolves_once() {
        let value = TemplateData::lazy(DataKind::Int, || TemplateData::from(7i64));
        assert!(value.is_variant());
        let resolved = value.evaluate();
        assert!(!resolved.is_variant());
        assert_eq!(resolved.as_int(), Some(7));
    }

    #[test]
    fn test_accessor_coercions() {
        assert_eq!(TemplateData::from("yes").as_bool(), Some(true));
        assert_eq!(TemplateData::from("no").as_bool(), Some(false));
        assert_eq!(TemplateData::from(true).as_int(), Some(1));
        assert_eq!(TemplateData::from(3i64).as_double(), Some(3.0));
        assert_eq!(TemplateData::from(1.5).as_string().as_deref(), Some("1.5"));
        assert_eq!(TemplateData::true_nil().as_bool(), None);
    }

    #[test]
    fn test_identity_cast_round_trips() {
        let values = vec![
            TemplateData::from(true),
            TemplateData::from(-3i64),
            TemplateData::from(2.25),
            TemplateData::from("word"),
        ];
        for value in values {
            assert_eq!(value.cast(value.kind()), value);
        }
    }

    #[test]
    fn test_numeric_string_round_trip() {
        let value = TemplateData::from(12.5);
        let round = value.coerce(DataKind::String).coerce(DataKind::Double);
        assert!((round.as_double().unwrap() - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_from_json() {
        let value = TemplateData::from(json!({"todo": {"title": "Template!"}, "n": 3}));
        assert_eq!(
            value
                .member("todo")
                .and_then(|t| t.member("title"))
                .and_then(|t| t.as_string())
                .as_deref(),
            Some("Template!")
        );
        assert_eq!(value.member("n").and_then(|n| n.as_int()), Some(3));
    }

    #[test]
    fn test_equality_mixed_numeric() {
        assert_eq!(TemplateData::from(2i64), TemplateData::from(2.0));
        assert_ne!(TemplateData::from(2i64), TemplateData::from(3i64));
    }

    #[test]
    fn test_dictionary_display_is_stable() {
        let mut map = HashMap::new();
        map.insert("b".to_string(), TemplateData::from(2i64));
        map.insert("a".to_string(), TemplateData::from(1i64));
        let value = TemplateData::dictionary(map);
        assert_eq!(value.to_string(), "[\"a\": 1, \"b\": 2]");
    }
}
