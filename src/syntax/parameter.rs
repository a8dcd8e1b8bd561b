//! Expression-tree leaves: parameters, expressions and tuples

use super::token::{Keyword, Operator, OperatorForm};
use crate::entities::{FunctionEntity, MethodEntity};
use crate::value::{DataKind, TemplateData};
use crate::variable::Variable;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A call frozen to a specific implementation at parse time. Calls left
/// unresolved here are dispatched dynamically at serialize time.
#[derive(Clone)]
pub enum ResolvedCall {
    Function(Arc<FunctionEntity>),
    Method(Arc<MethodEntity>),
}

/// A function or method call node.
#[derive(Clone)]
pub struct FunctionCall {
    pub name: String,
    pub resolved: Option<ResolvedCall>,
    pub params: Tuple,
    /// `None`: free function. `Some(None)`: non-mutating method (operand is
    /// the tuple's first value). `Some(Some(var))`: mutating method bound to
    /// a variable the result operand is written back to.
    pub operand: Option<Option<Variable>>,
}

impl std::fmt::Debug for FunctionCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionCall")
            .field("name", &self.name)
            .field("resolved", &self.resolved.is_some())
            .field("params", &self.params)
            .field("operand", &self.operand)
            .finish()
    }
}

/// Heterogeneous node at the leaves of expressions.
#[derive(Debug, Clone)]
pub enum Parameter {
    Value(TemplateData),
    Keyword(Keyword),
    Operator(Operator),
    Variable(Variable),
    Expression(Box<Expression>),
    Tuple(Box<Tuple>),
    Function(FunctionCall),
}

impl Parameter {
    /// Whether every call beneath this parameter is frozen to one
    /// implementation.
    pub fn resolved(&self) -> bool {
        match self {
            Parameter::Value(_) | Parameter::Keyword(_) | Parameter::Operator(_)
            | Parameter::Variable(_) => true,
            Parameter::Expression(e) => e.elements().iter().all(Parameter::resolved),
            Parameter::Tuple(t) => t.values().iter().all(Parameter::resolved),
            Parameter::Function(call) => {
                call.resolved.is_some() && call.params.values().iter().all(Parameter::resolved)
            }
        }
    }

    /// Whether evaluation can never produce different results.
    pub fn invariant(&self) -> bool {
        match self {
            Parameter::Value(v) => v.invariant(),
            Parameter::Keyword(k) => k.is_evaluable() && *k != Keyword::SelfRef,
            Parameter::Operator(_) => true,
            Parameter::Variable(_) => false,
            Parameter::Expression(e) => e.elements().iter().all(Parameter::invariant),
            Parameter::Tuple(t) => t.values().iter().all(Parameter::invariant),
            Parameter::Function(call) => {
                let entity_invariant = match &call.resolved {
                    Some(ResolvedCall::Function(f)) => f.invariant,
                    Some(ResolvedCall::Method(m)) => m.function.invariant && !m.mutating,
                    None => false,
                };
                entity_invariant && call.params.values().iter().all(Parameter::invariant)
            }
        }
    }

    /// A directly-stored, non-variant value.
    pub fn is_literal(&self) -> bool {
        matches!(self, Parameter::Value(v) if !v.is_variant())
    }

    /// The set of variable keys required to evaluate this parameter.
    pub fn symbols(&self) -> HashSet<Variable> {
        let mut set = HashSet::new();
        self.collect_symbols(&mut set);
        set
    }

    fn collect_symbols(&self, set: &mut HashSet<Variable>) {
        match self {
            Parameter::Variable(v) => {
                set.insert(v.clone());
            }
            Parameter::Expression(e) => {
                for element in e.elements() {
                    element.collect_symbols(set);
                }
            }
            Parameter::Tuple(t) => {
                for value in t.values() {
                    value.collect_symbols(set);
                }
            }
            Parameter::Function(call) => {
                if let Some(Some(var)) = &call.operand {
                    set.insert(var.clone());
                }
                for value in call.params.values() {
                    value.collect_symbols(set);
                }
            }
            _ => {}
        }
    }

    /// Best-effort stored type the parameter will evaluate to; `None` means
    /// "possibly any".
    pub fn base_type(&self) -> Option<DataKind> {
        match self {
            Parameter::Value(v) => Some(v.kind()),
            Parameter::Keyword(k) if k.is_boolean_valued() => Some(DataKind::Bool),
            Parameter::Keyword(Keyword::SelfRef) => Some(DataKind::Dictionary),
            Parameter::Keyword(_) | Parameter::Operator(_) | Parameter::Variable(_) => None,
            Parameter::Expression(e) => e.base_type(),
            Parameter::Tuple(t) => {
                if t.collection {
                    if t.labels().is_empty() {
                        Some(DataKind::Array)
                    } else {
                        Some(DataKind::Dictionary)
                    }
                } else {
                    None
                }
            }
            Parameter::Function(call) => match &call.resolved {
                Some(ResolvedCall::Function(f)) => f.returns,
                Some(ResolvedCall::Method(m)) => m.function.returns,
                None => None,
            },
        }
    }
}

impl std::fmt::Display for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Parameter::Value(v) => write!(f, "{:?}", v),
            Parameter::Keyword(k) => write!(f, "{}", k),
            Parameter::Operator(o) => write!(f, "{}", o),
            Parameter::Variable(v) => write!(f, "{}", v),
            Parameter::Expression(e) => write!(f, "{}", e),
            Parameter::Tuple(t) => write!(f, "{}", t),
            Parameter::Function(call) => write!(f, "{}{}", call.name, call.params),
        }
    }
}

/// Structural form of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionForm {
    Calculation,
    Assignment,
    Ternary,
    Custom,
}

/// A 2- or 3-element vector of parameters with a tagged form.
#[derive(Debug, Clone)]
pub struct Expression {
    form: ExpressionForm,
    operator_form: Option<OperatorForm>,
    elements: Vec<Parameter>,
}

impl Expression {
    pub fn infix(lhs: Parameter, op: Operator, rhs: Parameter) -> Self {
        Self {
            form: ExpressionForm::Calculation,
            operator_form: Some(OperatorForm::Infix),
            elements: vec![lhs, Parameter::Operator(op), rhs],
        }
    }

    pub fn prefix(op: Operator, operand: Parameter) -> Self {
        Self {
            form: ExpressionForm::Calculation,
            operator_form: Some(OperatorForm::UnaryPrefix),
            elements: vec![Parameter::Operator(op), operand],
        }
    }

    pub fn postfix(operand: Parameter, op: Operator) -> Self {
        Self {
            form: ExpressionForm::Calculation,
            operator_form: Some(OperatorForm::UnaryPostfix),
            elements: vec![operand, Parameter::Operator(op)],
        }
    }

    pub fn assignment(target: Variable, op: Operator, rhs: Parameter) -> Self {
        Self {
            form: ExpressionForm::Assignment,
            operator_form: Some(OperatorForm::Infix),
            elements: vec![
                Parameter::Variable(target),
                Parameter::Operator(op),
                rhs,
            ],
        }
    }

    pub fn ternary(condition: Parameter, when_true: Parameter, when_false: Parameter) -> Self {
        Self {
            form: ExpressionForm::Ternary,
            operator_form: None,
            elements: vec![condition, when_true, when_false],
        }
    }

    /// A declaration or other irregular shape the serializer recognizes by
    /// inspection.
    pub fn custom(elements: Vec<Parameter>) -> Self {
        Self {
            form: ExpressionForm::Custom,
            operator_form: None,
            elements,
        }
    }

    pub fn form(&self) -> ExpressionForm {
        self.form
    }

    pub fn operator_form(&self) -> Option<OperatorForm> {
        self.operator_form
    }

    pub fn elements(&self) -> &[Parameter] {
        &self.elements
    }

    /// The operator for calculation/assignment forms.
    pub fn operator(&self) -> Option<Operator> {
        self.elements.iter().find_map(|p| match p {
            Parameter::Operator(op) => Some(*op),
            _ => None,
        })
    }

    pub fn base_type(&self) -> Option<DataKind> {
        match self.form {
            ExpressionForm::Assignment => None,
            ExpressionForm::Ternary => {
                let t = self.elements.get(1)?.base_type()?;
                let f = self.elements.get(2)?.base_type()?;
                (t == f).then_some(t)
            }
            _ => match self.operator()? {
                Operator::And
                | Operator::Or
                | Operator::Xor
                | Operator::Not
                | Operator::Equal
                | Operator::NotEqual
                | Operator::Greater
                | Operator::GreaterOrEqual
                | Operator::Lesser
                | Operator::LesserOrEqual => Some(DataKind::Bool),
                Operator::Plus
                | Operator::Minus
                | Operator::Multiply
                | Operator::Divide
                | Operator::Modulo => {
                    // Numeric operators keep their operands' common kind.
                    let mut kinds = self.elements.iter().filter_map(Parameter::base_type);
                    let first = kinds.next()?;
                    kinds.all(|k| k == first).then_some(first)
                }
                _ => None,
            },
        }
    }
}

impl std::fmt::Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, element) in self.elements.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", element)?;
        }
        write!(f, ")")
    }
}

/// Ordered parameters with a label map. `collection` marks `[...]` / `[:]`
/// literal syntax.
#[derive(Debug, Clone, Default)]
pub struct Tuple {
    values: Vec<Parameter>,
    labels: HashMap<String, usize>,
    pub collection: bool,
}

impl Tuple {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: Option<String>, value: Parameter) {
        if let Some(label) = label {
            self.labels.insert(label, self.values.len());
        }
        self.values.push(value);
    }

    pub fn values(&self) -> &[Parameter] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&Parameter> {
        self.values.get(index)
    }

    pub fn labeled(&self, label: &str) -> Option<&Parameter> {
        self.labels.get(label).and_then(|i| self.values.get(*i))
    }

    pub fn label_of(&self, index: usize) -> Option<&str> {
        self.labels
            .iter()
            .find(|(_, i)| **i == index)
            .map(|(label, _)| label.as_str())
    }

    pub fn labels(&self) -> &HashMap<String, usize> {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// A tuple renders to a concrete value iff every element is valued and
    /// either all elements are labeled (dictionary) or none are (array).
    pub fn is_evaluable(&self) -> bool {
        let all_valued = self
            .values
            .iter()
            .all(|p| matches!(p, Parameter::Value(_)));
        all_valued && (self.labels.len() == self.values.len() || self.labels.is_empty())
    }

    /// Concrete value for an evaluable tuple.
    pub fn to_value(&self) -> Option<TemplateData> {
        if !self.is_evaluable() {
            return None;
        }
        if self.labels.is_empty() {
            let values = self
                .values
                .iter()
                .filter_map(|p| match p {
                    Parameter::Value(v) => Some(v.clone()),
                    _ => None,
                })
                .collect();
            Some(TemplateData::array(values))
        } else {
            let mut map = HashMap::new();
            for (label, index) in &self.labels {
                if let Some(Parameter::Value(v)) = self.values.get(*index) {
                    map.insert(label.clone(), v.clone());
                }
            }
            Some(TemplateData::dictionary(map))
        }
    }
}

impl std::fmt::Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if let Some(label) = self.label_of(i) {
                write!(f, "{}: ", label)?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_parameter() {
        let p = Parameter::Value(TemplateData::from(1i64));
        assert!(p.is_literal());
        assert!(p.invariant());
        assert!(p.resolved());
        assert_eq!(p.base_type(), Some(DataKind::Int));
    }

    #[test]
    fn test_variable_parameter_symbols() {
        let var = Variable::atom("user").unwrap().extended("name").unwrap();
        let p = Parameter::Variable(var.clone());
        assert!(!p.invariant());
        assert!(p.symbols().contains(&var));
        assert_eq!(p.base_type(), None);
    }

    #[test]
    fn test_expression_base_types() {
        let cmp = Expression::infix(
            Parameter::Value(1i64.into()),
            Operator::Lesser,
            Parameter::Value(2i64.into()),
        );
        assert_eq!(cmp.base_type(), Some(DataKind::Bool));

        let math = Expression::infix(
            Parameter::Value(1i64.into()),
            Operator::Plus,
            Parameter::Value(2i64.into()),
        );
        assert_eq!(math.base_type(), Some(DataKind::Int));
    }

    #[test]
    fn test_tuple_evaluability() {
        let mut array = Tuple::new();
        array.push(None, Parameter::Value(1i64.into()));
        array.push(None, Parameter::Value(2i64.into()));
        assert!(array.is_evaluable());
        assert_eq!(array.to_value().unwrap().kind(), DataKind::Array);

        let mut dict = Tuple::new();
        dict.push(Some("a".into()), Parameter::Value(1i64.into()));
        dict.push(Some("b".into()), Parameter::Value(2i64.into()));
        assert!(dict.is_evaluable());
        assert_eq!(dict.to_value().unwrap().kind(), DataKind::Dictionary);

        let mut mixed = Tuple::new();
        mixed.push(None, Parameter::Value(1i64.into()));
        mixed.push(Some("b".into()), Parameter::Value(2i64.into()));
        assert!(!mixed.is_evaluable());
    }

    #[test]
    fn test_tuple_labeled_access() {
        let mut tuple = Tuple::new();
        tuple.push(None, Parameter::Value("x".into()));
        tuple.push(Some("as".into()), Parameter::Keyword(Keyword::Template));
        assert!(matches!(
            tuple.labeled("as"),
            Some(Parameter::Keyword(Keyword::Template))
        ));
        assert_eq!(tuple.label_of(1), Some("as"));
        assert_eq!(tuple.label_of(0), None);
    }
}
