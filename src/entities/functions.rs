//! Callable entities: functions and methods
//!
//! A function entity bundles a call signature with a native implementation.
//! Methods additionally carry an operand; a mutating method returns a
//! replacement operand next to its result, which the serializer writes back
//! through the assignment path.

use crate::syntax::parameter::{Parameter, Tuple};
use crate::value::{DataKind, TemplateData};
use std::collections::HashMap;
use std::sync::Arc;

/// One formal parameter of a call signature.
#[derive(Debug, Clone)]
pub struct CallParameter {
    pub label: Option<String>,
    /// Accepted stored types; empty means any.
    pub types: Vec<DataKind>,
    pub default: Option<TemplateData>,
}

impl CallParameter {
    pub fn any() -> Self {
        Self {
            label: None,
            types: Vec::new(),
            default: None,
        }
    }

    pub fn typed(types: &[DataKind]) -> Self {
        Self {
            label: None,
            types: types.to_vec(),
            default: None,
        }
    }

    pub fn labeled(label: impl Into<String>, types: &[DataKind]) -> Self {
        Self {
            label: Some(label.into()),
            types: types.to_vec(),
            default: None,
        }
    }

    pub fn with_default(mut self, default: TemplateData) -> Self {
        self.default = Some(default);
        self
    }

    fn accepts(&self, kind: Option<DataKind>) -> bool {
        match kind {
            // An untypable parameter is possibly any.
            None => true,
            Some(kind) => self.types.is_empty() || self.types.contains(&kind),
        }
    }

    fn types_intersect(&self, other: &CallParameter) -> bool {
        if self.types.is_empty() || other.types.is_empty() {
            return true;
        }
        self.types.iter().any(|t| other.types.contains(t))
    }
}

impl std::fmt::Display for CallParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(label) = &self.label {
            write!(f, "{}: ", label)?;
        }
        if self.types.is_empty() {
            write!(f, "any")?;
        } else {
            let names: Vec<&str> = self.types.iter().map(DataKind::short_name).collect();
            write!(f, "{}", names.join("|"))?;
        }
        if self.default.is_some() {
            write!(f, " = ...")?;
        }
        Ok(())
    }
}

/// An ordered list of formal parameters.
#[derive(Debug, Clone, Default)]
pub struct CallSignature {
    pub params: Vec<CallParameter>,
}

impl CallSignature {
    pub fn new(params: Vec<CallParameter>) -> Self {
        Self { params }
    }

    pub fn empty() -> Self {
        Self { params: Vec::new() }
    }

    /// Match a call tuple against this signature. Positional arguments must
    /// precede labeled ones, labels must form a contiguous suffix of the
    /// formal labels and a subset of them, and defaults back-fill whatever
    /// the call leaves out. Returns the normalized tuple on success.
    pub fn matches(&self, tuple: &Tuple) -> Option<Tuple> {
        let mut assigned: Vec<Option<Parameter>> = vec![None; self.params.len()];
        let mut seen_label = false;

        for (index, value) in tuple.values().iter().enumerate() {
            match tuple.label_of(index) {
                None => {
                    if seen_label {
                        // positional after labeled
                        return None;
                    }
                    let formal = self.params.get(index)?;
                    if !formal.accepts(value.base_type()) {
                        return None;
                    }
                    assigned[index] = Some(value.clone());
                }
                Some(label) => {
                    seen_label = true;
                    let position = self
                        .params
                        .iter()
                        .position(|p| p.label.as_deref() == Some(label))?;
                    if assigned[position].is_some() {
                        return None;
                    }
                    if !self.params[position].accepts(value.base_type()) {
                        return None;
                    }
                    assigned[position] = Some(value.clone());
                }
            }
        }

        let mut normalized = Tuple::new();
        for (formal, slot) in self.params.iter().zip(assigned) {
            let value = match slot {
                Some(value) => value,
                None => Parameter::Value(formal.default.clone()?),
            };
            normalized.push(formal.label.clone(), value);
        }
        Some(normalized)
    }

    /// Two signatures are confusable when a single call shape could match
    /// both: every shared position has intersecting type sets and equal
    /// labels, and the longer signature's tail is entirely defaulted.
    pub fn confusable_with(&self, other: &CallSignature) -> bool {
        let (short, long) = if self.params.len() <= other.params.len() {
            (self, other)
        } else {
            (other, self)
        };
        for (a, b) in short.params.iter().zip(long.params.iter()) {
            if a.label != b.label || !a.types_intersect(b) {
                return false;
            }
        }
        long.params[short.params.len()..]
            .iter()
            .all(|p| p.default.is_some())
    }
}

impl std::fmt::Display for CallSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param)?;
        }
        write!(f, ")")
    }
}

/// Host objects passed outside the value model to unsafe entities.
pub type UnsafeObjects = HashMap<String, Arc<dyn std::any::Any + Send + Sync>>;

/// Evaluated arguments handed to a native implementation.
#[derive(Clone, Default)]
pub struct CallValues {
    values: Vec<TemplateData>,
    labels: HashMap<String, usize>,
    unsafe_objects: Option<Arc<UnsafeObjects>>,
}

impl CallValues {
    pub fn new(values: Vec<TemplateData>, labels: HashMap<String, usize>) -> Self {
        Self {
            values,
            labels,
            unsafe_objects: None,
        }
    }

    pub fn positional(values: Vec<TemplateData>) -> Self {
        Self::new(values, HashMap::new())
    }

    /// Attach the context's unsafe-object map. Only done by the serializer,
    /// only for unsafe entities, only when the context grants access.
    pub fn grant_unsafe(&mut self, objects: Arc<UnsafeObjects>) {
        self.unsafe_objects = Some(objects);
    }

    pub fn get(&self, index: usize) -> TemplateData {
        self.values
            .get(index)
            .cloned()
            .unwrap_or_else(TemplateData::true_nil)
    }

    pub fn labeled(&self, label: &str) -> TemplateData {
        self.labels
            .get(label)
            .and_then(|i| self.values.get(*i))
            .cloned()
            .unwrap_or_else(TemplateData::true_nil)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn unsafe_object(&self, name: &str) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        self.unsafe_objects.as_ref()?.get(name).cloned()
    }
}

pub type NativeFunction = Arc<dyn Fn(&CallValues) -> TemplateData + Send + Sync>;

/// Mutating-method implementation: `(new operand, result)`.
pub type NativeMethod =
    Arc<dyn Fn(&TemplateData, &CallValues) -> (Option<TemplateData>, TemplateData) + Send + Sync>;

/// A registered free function.
#[derive(Clone)]
pub struct FunctionEntity {
    pub name: String,
    pub signature: CallSignature,
    pub returns: Option<DataKind>,
    pub invariant: bool,
    pub unsafe_entity: bool,
    implementation: NativeFunction,
}

impl std::fmt::Debug for FunctionEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionEntity")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("returns", &self.returns)
            .field("invariant", &self.invariant)
            .field("unsafe_entity", &self.unsafe_entity)
            .finish()
    }
}

impl FunctionEntity {
    pub fn new<F>(name: impl Into<String>, signature: CallSignature, implementation: F) -> Self
    where
        F: Fn(&CallValues) -> TemplateData + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            signature,
            returns: None,
            invariant: true,
            unsafe_entity: false,
            implementation: Arc::new(implementation),
        }
    }

    pub fn returning(mut self, kind: DataKind) -> Self {
        self.returns = Some(kind);
        self
    }

    pub fn variant(mut self) -> Self {
        self.invariant = false;
        self
    }

    pub fn unsafe_entity(mut self) -> Self {
        self.unsafe_entity = true;
        self
    }

    pub fn evaluate(&self, call: &CallValues) -> TemplateData {
        (self.implementation)(call)
    }
}

/// A registered method. Non-mutating methods receive the operand as the
/// first call value; mutating methods go through `mutate`.
#[derive(Clone)]
pub struct MethodEntity {
    pub function: FunctionEntity,
    /// Accepted operand types; empty means any.
    pub operand_types: Vec<DataKind>,
    pub mutating: bool,
    mutator: Option<NativeMethod>,
}

impl MethodEntity {
    pub fn non_mutating<F>(
        name: impl Into<String>,
        operand_types: &[DataKind],
        signature: CallSignature,
        implementation: F,
    ) -> Self
    where
        F: Fn(&CallValues) -> TemplateData + Send + Sync + 'static,
    {
        Self {
            function: FunctionEntity::new(name, signature, implementation),
            operand_types: operand_types.to_vec(),
            mutating: false,
            mutator: None,
        }
    }

    pub fn mutating<F>(
        name: impl Into<String>,
        operand_types: &[DataKind],
        signature: CallSignature,
        implementation: F,
    ) -> Self
    where
        F: Fn(&TemplateData, &CallValues) -> (Option<TemplateData>, TemplateData)
            + Send
            + Sync
            + 'static,
    {
        Self {
            function: FunctionEntity::new(name, signature, |_| TemplateData::true_nil()),
            operand_types: operand_types.to_vec(),
            mutating: true,
            mutator: Some(Arc::new(implementation)),
        }
    }

    pub fn returning(mut self, kind: DataKind) -> Self {
        self.function = self.function.returning(kind);
        self
    }

    pub fn accepts_operand(&self, kind: Option<DataKind>) -> bool {
        match kind {
            None => true,
            Some(kind) => self.operand_types.is_empty() || self.operand_types.contains(&kind),
        }
    }

    /// Evaluate against an operand: `(replacement operand, result)`.
    pub fn evaluate(
        &self,
        operand: &TemplateData,
        call: &CallValues,
    ) -> (Option<TemplateData>, TemplateData) {
        match &self.mutator {
            Some(mutator) => mutator(operand, call),
            None => {
                let mut values = vec![operand.clone()];
                values.extend((0..call.len()).map(|i| call.get(i)));
                (None, self.function.evaluate(&CallValues::positional(values)))
            }
        }
    }
}

/// The builtin function and method library registered by the core set.
pub(crate) mod builtins {
    use super::*;

    pub fn functions() -> Vec<FunctionEntity> {
        vec![
            FunctionEntity::new(
                "count",
                CallSignature::new(vec![CallParameter::typed(&[
                    DataKind::String,
                    DataKind::Data,
                    DataKind::Array,
                    DataKind::Dictionary,
                ])]),
                |call| match call.get(0).evaluate().count() {
                    Some(count) => count.into(),
                    None => TemplateData::error("count requires a countable value"),
                },
            )
            .returning(DataKind::Int),
            FunctionEntity::new(
                "lowercased",
                CallSignature::new(vec![CallParameter::typed(&[DataKind::String])]),
                |call| match call.get(0).as_string() {
                    Some(s) => s.to_lowercase().into(),
                    None => TemplateData::error("lowercased requires a string"),
                },
            )
            .returning(DataKind::String),
            FunctionEntity::new(
                "uppercased",
                CallSignature::new(vec![CallParameter::typed(&[DataKind::String])]),
                |call| match call.get(0).as_string() {
                    Some(s) => s.to_uppercase().into(),
                    None => TemplateData::error("uppercased requires a string"),
                },
            )
            .returning(DataKind::String),
            FunctionEntity::new(
                "contains",
                CallSignature::new(vec![
                    CallParameter::typed(&[
                        DataKind::String,
                        DataKind::Array,
                        DataKind::Dictionary,
                    ]),
                    CallParameter::any(),
                ]),
                |call| {
                    let haystack = call.get(0).evaluate();
                    let needle = call.get(1).evaluate();
                    if let Some(values) = haystack.as_array() {
                        values.iter().any(|v| *v == needle).into()
                    } else if let Some(map) = haystack.as_dictionary() {
                        match needle.as_string() {
                            Some(key) => map.contains_key(&key).into(),
                            None => false.into(),
                        }
                    } else if let Some(s) = haystack.as_string() {
                        match needle.as_string() {
                            Some(sub) => s.contains(&sub).into(),
                            None => false.into(),
                        }
                    } else {
                        TemplateData::error("contains requires a collection or string")
                    }
                },
            )
            .returning(DataKind::Bool),
            FunctionEntity::new(
                "abs",
                CallSignature::new(vec![CallParameter::typed(&[
                    DataKind::Int,
                    DataKind::Double,
                ])]),
                |call| {
                    let value = call.get(0).evaluate();
                    match value.kind() {
                        DataKind::Int => match value.as_int() {
                            Some(i64::MIN) => TemplateData::error("integer overflow in abs"),
                            Some(i) => i.abs().into(),
                            None => TemplateData::error("abs requires a number"),
                        },
                        _ => match value.as_double() {
                            Some(d) => d.abs().into(),
                            None => TemplateData::error("abs requires a number"),
                        },
                    }
                },
            ),
        ]
    }

    pub fn methods() -> Vec<MethodEntity> {
        vec![
            MethodEntity::non_mutating(
                "hasPrefix",
                &[DataKind::String],
                CallSignature::new(vec![CallParameter::typed(&[DataKind::String])]),
                |call| {
                    let operand = call.get(0).as_string().unwrap_or_default();
                    let prefix = call.get(1).as_string().unwrap_or_default();
                    operand.starts_with(&prefix).into()
                },
            )
            .returning(DataKind::Bool),
            MethodEntity::non_mutating(
                "hasSuffix",
                &[DataKind::String],
                CallSignature::new(vec![CallParameter::typed(&[DataKind::String])]),
                |call| {
                    let operand = call.get(0).as_string().unwrap_or_default();
                    let suffix = call.get(1).as_string().unwrap_or_default();
                    operand.ends_with(&suffix).into()
                },
            )
            .returning(DataKind::Bool),
            MethodEntity::mutating(
                "append",
                &[DataKind::Array],
                CallSignature::new(vec![CallParameter::any()]),
                |operand, call| match operand.as_array() {
                    Some(mut values) => {
                        values.push(call.get(0).evaluate());
                        (Some(TemplateData::array(values)), TemplateData::true_nil())
                    }
                    None => (None, TemplateData::error("append requires an array")),
                },
            ),
            MethodEntity::mutating(
                "popLast",
                &[DataKind::Array],
                CallSignature::empty(),
                |operand, _| match operand.as_array() {
                    Some(mut values) => {
                        let popped = values.pop().unwrap_or_else(TemplateData::true_nil);
                        (Some(TemplateData::array(values)), popped)
                    }
                    None => (None, TemplateData::error("popLast requires an array")),
                },
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_param() -> CallParameter {
        CallParameter::typed(&[DataKind::Int])
    }

    #[test]
    fn test_signature_positional_match() {
        let sig = CallSignature::new(vec![int_param(), int_param()]);
        let mut call = Tuple::new();
        call.push(None, Parameter::Value(1i64.into()));
        call.push(None, Parameter::Value(2i64.into()));
        assert!(sig.matches(&call).is_some());
    }

    #[test]
    fn test_signature_rejects_wrong_type() {
        let sig = CallSignature::new(vec![int_param()]);
        let mut call = Tuple::new();
        call.push(None, Parameter::Value("word".into()));
        assert!(sig.matches(&call).is_none());
    }

    #[test]
    fn test_untypable_argument_is_possibly_any() {
        let sig = CallSignature::new(vec![int_param()]);
        let mut call = Tuple::new();
        call.push(
            None,
            Parameter::Variable(crate::variable::Variable::atom("x").unwrap()),
        );
        assert!(sig.matches(&call).is_some());
    }

    #[test]
    fn test_labels_back_fill_defaults() {
        let sig = CallSignature::new(vec![
            CallParameter::any(),
            CallParameter::labeled("depth", &[DataKind::Int]).with_default(1i64.into()),
        ]);
        let mut call = Tuple::new();
        call.push(None, Parameter::Value("x".into()));
        let normalized = sig.matches(&call).unwrap();
        assert_eq!(normalized.len(), 2);
        assert!(matches!(
            normalized.labeled("depth"),
            Some(Parameter::Value(v)) if v.as_int() == Some(1)
        ));
    }

    #[test]
    fn test_positional_after_labeled_rejected() {
        let sig = CallSignature::new(vec![
            CallParameter::labeled("a", &[]),
            CallParameter::labeled("b", &[]),
        ]);
        let mut call = Tuple::new();
        call.push(Some("a".into()), Parameter::Value(1i64.into()));
        call.push(None, Parameter::Value(2i64.into()));
        assert!(sig.matches(&call).is_none());
    }

    #[test]
    fn test_confusable_signatures() {
        let a = CallSignature::new(vec![int_param()]);
        let b = CallSignature::new(vec![int_param(), int_param().with_default(0i64.into())]);
        assert!(a.confusable_with(&b));

        let c = CallSignature::new(vec![CallParameter::typed(&[DataKind::String])]);
        assert!(!a.confusable_with(&c));

        let d = CallSignature::new(vec![int_param(), int_param()]);
        assert!(!a.confusable_with(&d));
    }

    #[test]
    fn test_mutating_method_returns_new_operand() {
        let append = MethodEntity::mutating(
            "append",
            &[DataKind::Array],
            CallSignature::new(vec![CallParameter::any()]),
            |operand, call| {
                let mut values = operand.as_array().unwrap_or_default();
                values.push(call.get(0));
                (Some(TemplateData::array(values)), TemplateData::true_nil())
            },
        );
        let operand = TemplateData::array(vec![1i64.into()]);
        let call = CallValues::positional(vec![2i64.into()]);
        let (replacement, result) = append.evaluate(&operand, &call);
        assert_eq!(replacement.unwrap().count(), Some(2));
        assert!(result.is_true_nil());
    }

    #[test]
    fn test_non_mutating_method_gets_operand_first() {
        let has_prefix = MethodEntity::non_mutating(
            "hasPrefix",
            &[DataKind::String],
            CallSignature::new(vec![CallParameter::typed(&[DataKind::String])]),
            |call| {
                let operand = call.get(0).as_string().unwrap_or_default();
                let prefix = call.get(1).as_string().unwrap_or_default();
                operand.starts_with(&prefix).into()
            },
        );
        let (replacement, result) = has_prefix.evaluate(
            &TemplateData::from("stencil"),
            &CallValues::positional(vec!["sten".into()]),
        );
        assert!(replacement.is_none());
        assert_eq!(result.as_bool(), Some(true));
    }
}
