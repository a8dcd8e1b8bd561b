//! Serializer: resolved AST + context to output bytes
//!
//! A non-recursive interpreter over the AST's scope tables. All state lives
//! in an explicit stack of scope frames, so host-stack depth never grows
//! with template nesting. Each loop pass either evaluates a freshly-entered
//! block scope, dispatches the next syntax node of the current table, or
//! wraps/closes the table at its end. A wall-clock deadline is sampled
//! every 256 passes.

pub mod stack;

use crate::ast::{Ast, MetaBlock, Syntax};
use crate::context::{Context, Options};
use crate::entities::{self, CallValues, RawBlock, UnsafeObjects};
use crate::syntax::ResolvedCall;
use crate::error::{Error, Result};
use crate::syntax::parameter::{Expression, ExpressionForm, FunctionCall, Parameter, Tuple};
use crate::syntax::token::{Keyword, Operator, OperatorForm};
use crate::value::{convert, DataKind, TemplateData};
use crate::variable::Variable;
use stack::{DefineRecord, ScopeFrame, VariableStack, WriteOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Render a resolved AST against a context.
pub fn serialize(
    ast: &Ast,
    transient_raws: &HashMap<String, Vec<u8>>,
    context: &Context,
) -> Result<Vec<u8>> {
    if !ast.info.required_asts.is_empty() {
        return Err(Error::serialize(format!(
            "\"{}\" has unresolved dependencies",
            ast.key
        )));
    }
    let mut context = context.clone();
    context.freeze();
    Serializer::new(ast, transient_raws, &context)?.run()
}

struct Serializer<'a> {
    ast: &'a Ast,
    transient_raws: &'a HashMap<String, Vec<u8>>,
    options: Options,
    vars: VariableStack,
    frames: Vec<ScopeFrame>,
    buffers: Vec<Box<dyn RawBlock>>,
    deadline: Instant,
    tick: u16,
    unsafe_objects: Arc<UnsafeObjects>,
}

impl<'a> Serializer<'a> {
    fn new(
        ast: &'a Ast,
        transient_raws: &'a HashMap<String, Vec<u8>>,
        context: &Context,
    ) -> Result<Self> {
        let options = context.options.clone();
        let root_buffer = entities::with_registry(|e| e.validate_raw(entities::DEFAULT_RAW))??;
        Ok(Self {
            ast,
            transient_raws,
            vars: VariableStack::new(context),
            frames: vec![ScopeFrame::plain(0, 0)],
            buffers: vec![root_buffer.open()],
            deadline: Instant::now() + Duration::from_secs_f64(options.timeout.max(0.001)),
            tick: 0,
            unsafe_objects: context.unsafe_objects(),
            options,
        })
    }

    fn run(mut self) -> Result<Vec<u8>> {
        while !self.frames.is_empty() {
            self.tick = self.tick.wrapping_add(1);
            if self.tick % 256 == 0 && Instant::now() > self.deadline {
                return Err(Error::Timeout(self.options.timeout));
            }

            let frame_index = self.frames.len() - 1;
            if !self.frames[frame_index].evaluated && !self.evaluate_scope(frame_index)? {
                continue;
            }

            let (table, offset) = {
                let frame = &self.frames[frame_index];
                (frame.table, frame.offset)
            };
            let length = self.ast.table(table).map(<[Syntax]>::len).unwrap_or(0);
            if offset >= length {
                self.wrap_or_close(frame_index)?;
                continue;
            }
            self.frames[frame_index].offset += 1;
            let syntax = self.ast.scopes[table][offset].clone();
            self.dispatch(syntax)?;
        }

        let mut root = self
            .buffers
            .pop()
            .ok_or_else(|| Error::serialize("output buffer lost"))?;
        Ok(root.take())
    }

    // Scope lifecycle

    /// First entry into a block's scope for the current pass. Returns false
    /// when the scope was discarded.
    fn evaluate_scope(&mut self, frame_index: usize) -> Result<bool> {
        let call_tuple = self.frames[frame_index].call.clone().unwrap_or_default();
        let call = self.call_values(&call_tuple)?;

        let mut scope_vars = HashMap::new();
        let mut block = self.frames[frame_index].block.take();
        let count = match &mut block {
            Some(block) => block.evaluate_scope(&call, &mut scope_vars)?,
            None => Some(1),
        };
        let chains = block
            .as_ref()
            .map(|b| b.chains() || b.chain_head())
            .unwrap_or(false);
        self.frames[frame_index].block = block;
        self.frames[frame_index].evaluated = true;
        self.frames[frame_index].count = count;

        if chains && frame_index > 0 {
            self.frames[frame_index - 1].break_chain = count != Some(0);
        }

        if count == Some(0) {
            self.close_frame()?;
            return Ok(false);
        }

        self.bind_scope_vars(frame_index, scope_vars);
        Ok(true)
    }

    fn bind_scope_vars(
        &mut self,
        frame_index: usize,
        scope_vars: HashMap<String, TemplateData>,
    ) {
        if self.frames[frame_index].allocated {
            self.vars.rebind_top(scope_vars);
        } else if !scope_vars.is_empty() {
            self.vars.push_frame();
            self.vars.rebind_top(scope_vars);
            self.frames[frame_index].allocated = true;
        }
    }

    /// End of a table: loop the body, re-open an indefinite scope, or close.
    fn wrap_or_close(&mut self, frame_index: usize) -> Result<()> {
        match self.frames[frame_index].count {
            Some(remaining) if remaining > 1 => {
                self.frames[frame_index].count = Some(remaining - 1);
                self.frames[frame_index].offset = 0;
                self.frames[frame_index].break_chain = false;
                let mut scope_vars = HashMap::new();
                let mut block = self.frames[frame_index].block.take();
                if let Some(block) = &mut block {
                    block.re_evaluate_scope(&mut scope_vars)?;
                }
                self.frames[frame_index].block = block;
                self.bind_scope_vars(frame_index, scope_vars);
                Ok(())
            }
            None => {
                self.frames[frame_index].offset = 0;
                self.frames[frame_index].evaluated = false;
                self.frames[frame_index].break_chain = false;
                if self.frames[frame_index].allocated {
                    self.vars.rebind_top(HashMap::new());
                }
                Ok(())
            }
            _ => self.close_frame(),
        }
    }

    /// Release a frame's bindings and buffer.
    fn close_frame(&mut self) -> Result<()> {
        let Some(frame) = self.frames.pop() else {
            return Ok(());
        };
        if frame.allocated {
            self.vars.pop_frame();
        }
        if frame.owns_buffer {
            if let Some(mut buffer) = self.buffers.pop() {
                let bytes = buffer.take();
                self.append_bytes(&bytes);
            }
        }
        Ok(())
    }

    fn current_buffer(&self) -> usize {
        self.frames.last().map(|f| f.buffer_index).unwrap_or(0)
    }

    // Dispatch

    fn dispatch(&mut self, syntax: Syntax) -> Result<()> {
        match syntax {
            Syntax::Raw(text) => {
                self.append_text(&text)?;
                Ok(())
            }
            Syntax::Passthrough(param) => self.statement(&param),
            Syntax::Jump(scope) => {
                if let Some(table) = scope.table_index() {
                    let frame = ScopeFrame::plain(table, self.current_buffer());
                    self.frames.push(frame);
                }
                Ok(())
            }
            Syntax::Block {
                instance,
                call,
                scope,
                ..
            } => {
                let chains = instance.chains();
                let in_broken_chain = self.frames.last().map(|f| f.break_chain).unwrap_or(false);
                if chains && in_broken_chain {
                    return Ok(());
                }
                if !chains && !instance.chain_head() {
                    if let Some(frame) = self.frames.last_mut() {
                        frame.break_chain = false;
                    }
                }
                let Some(table) = scope.table_index() else {
                    return Ok(());
                };
                let frame =
                    ScopeFrame::for_block(table, self.current_buffer(), instance, call);
                self.frames.push(frame);
                Ok(())
            }
            Syntax::Meta(meta) => self.meta(meta),
        }
    }

    fn meta(&mut self, meta: MetaBlock) -> Result<()> {
        match meta {
            MetaBlock::Define { id, value, scope } => {
                let record = match value {
                    Some(param) => DefineRecord::Param(param),
                    None => DefineRecord::Scope(scope),
                };
                if let Some(frame) = self.frames.last_mut() {
                    frame.defines.insert(id, record);
                }
                Ok(())
            }
            MetaBlock::Evaluate { id, default } => {
                match self.find_define(&id) {
                    Some(DefineRecord::Scope(scope)) => {
                        if let Some(table) = scope.table_index() {
                            let frame = ScopeFrame::plain(table, self.current_buffer());
                            self.frames.push(frame);
                        }
                        Ok(())
                    }
                    Some(DefineRecord::Param(param)) => {
                        let value = self.eval_parameter(&param);
                        self.append_value(value)
                    }
                    None => match default {
                        Some(param) => {
                            let value = self.eval_parameter(&param);
                            self.append_value(value)
                        }
                        None if self.options.missing_variable_throws => Err(Error::serialize(
                            format!("evaluate of undefined \"{}\"", id),
                        )),
                        None => Ok(()),
                    },
                }
            }
            MetaBlock::InlineTemplate { name } => Err(Error::serialize(format!(
                "inline \"{}\" was not resolved",
                name
            ))),
            MetaBlock::InlineRaw { name, handler } => {
                let bytes = self
                    .ast
                    .raws
                    .get(&name)
                    .or_else(|| self.transient_raws.get(&name))
                    .cloned()
                    .ok_or(Error::MissingRaw(name))?;
                let factory = entities::with_registry(|e| e.validate_raw(&handler))??;
                let mut buffer = factory.open();
                buffer.append(&bytes);
                let bytes = buffer.take();
                self.append_bytes(&bytes);
                Ok(())
            }
            MetaBlock::RawSwitch { handler, scope } => {
                let Some(table) = scope.table_index() else {
                    return Ok(());
                };
                let factory = entities::with_registry(|e| e.validate_raw(&handler))??;
                self.buffers.push(factory.open());
                let mut frame = ScopeFrame::plain(table, self.buffers.len() - 1);
                frame.owns_buffer = true;
                self.frames.push(frame);
                Ok(())
            }
        }
    }

    fn find_define(&self, id: &str) -> Option<DefineRecord> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.defines.get(id).cloned())
    }

    // Statements

    fn statement(&mut self, param: &Parameter) -> Result<()> {
        if let Parameter::Expression(expression) = param {
            match expression.form() {
                ExpressionForm::Custom => {
                    if let Some(Parameter::Keyword(keyword)) = expression.elements().first() {
                        if keyword.is_variable_declaration() {
                            return self.declare(*keyword, expression);
                        }
                    }
                }
                ExpressionForm::Assignment => {
                    return self.perform_assignment(expression).map(|_| ())
                }
                _ => {}
            }
        }
        let value = self.eval_parameter(param);
        self.append_value(value)
    }

    fn declare(&mut self, keyword: Keyword, expression: &Expression) -> Result<()> {
        let Some(Parameter::Variable(target)) = expression.elements().get(1) else {
            return Err(Error::serialize("malformed declaration"));
        };
        let value = match expression.elements().get(2) {
            Some(param) => self.eval_parameter(param).evaluate(),
            None => TemplateData::true_nil(),
        };
        if value.errored() && self.options.missing_variable_throws {
            return Err(Error::serialize(
                value.error_message().unwrap_or("declaration failed").to_string(),
            ));
        }
        let frame_index = self.frames.len() - 1;
        if !self.frames[frame_index].allocated {
            self.vars.push_frame();
            self.frames[frame_index].allocated = true;
        }
        let name = target.ancestor();
        match self.vars.declare(name, value, keyword == Keyword::Let) {
            WriteOutcome::Constant => Err(Error::serialize(format!(
                "\"{}\" is a constant and cannot be redeclared",
                name
            ))),
            _ => Ok(()),
        }
    }

    fn perform_assignment(&mut self, expression: &Expression) -> Result<TemplateData> {
        let [Parameter::Variable(target), Parameter::Operator(operator), value] =
            expression.elements()
        else {
            return Err(Error::serialize("malformed assignment"));
        };
        let mut value = self.eval_parameter(value).evaluate();
        if let Some(base) = operator.compound_base() {
            let current = self
                .resolve_variable(target)
                .evaluate();
            value = self.compute_infix(base, current, value);
        }
        if value.errored() {
            if self.options.missing_variable_throws {
                return Err(Error::serialize(
                    value.error_message().unwrap_or("assignment failed").to_string(),
                ));
            }
            return Ok(TemplateData::true_nil());
        }
        self.write_variable(target, value)?;
        Ok(TemplateData::true_nil())
    }

    fn write_variable(&mut self, target: &Variable, value: TemplateData) -> Result<()> {
        match self.vars.assign(target, value) {
            WriteOutcome::Written => Ok(()),
            WriteOutcome::Undeclared => Err(Error::serialize(format!(
                "assignment to undeclared variable \"{}\"",
                target
            ))),
            WriteOutcome::Constant => Err(Error::serialize(format!(
                "\"{}\" is a constant",
                target
            ))),
        }
    }

    // Output

    fn append_text(&mut self, text: &str) -> Result<()> {
        let bytes = self.options.encoding.encode(text)?;
        self.append_bytes(&bytes);
        Ok(())
    }

    fn append_bytes(&mut self, bytes: &[u8]) {
        let index = self.current_buffer();
        if let Some(buffer) = self.buffers.get_mut(index) {
            buffer.append(bytes);
        }
    }

    fn append_value(&mut self, value: TemplateData) -> Result<()> {
        let value = value.evaluate();
        if value.errored() {
            if self.options.missing_variable_throws {
                return Err(Error::serialize(
                    value
                        .error_message()
                        .unwrap_or("errored value in output")
                        .to_string(),
                ));
            }
            return Ok(());
        }
        if value.is_nil() {
            return Ok(());
        }
        if value.kind() == DataKind::Data {
            if let Some(bytes) = value.as_data() {
                self.append_bytes(&bytes);
                return Ok(());
            }
        }
        self.append_text(&value.to_string())
    }

    // Evaluation

    fn call_values(&mut self, tuple: &Tuple) -> Result<CallValues> {
        let mut values = Vec::with_capacity(tuple.len());
        for param in tuple.values() {
            values.push(self.eval_parameter(param));
        }
        Ok(CallValues::new(values, tuple.labels().clone()))
    }

    fn eval_parameter(&mut self, param: &Parameter) -> TemplateData {
        match param {
            Parameter::Value(value) => value.clone(),
            Parameter::Keyword(Keyword::SelfRef) => self.vars.self_value(),
            Parameter::Keyword(keyword) => keyword
                .bool_value()
                .map(TemplateData::from)
                .unwrap_or_else(TemplateData::true_nil),
            Parameter::Operator(op) => {
                TemplateData::error(format!("stray operator {} in expression", op))
            }
            Parameter::Variable(variable) => self.resolve_variable(variable),
            Parameter::Expression(expression) => self.eval_expression(expression),
            Parameter::Tuple(tuple) => self.eval_tuple(tuple),
            Parameter::Function(call) => self.eval_call(call),
        }
    }

    fn resolve_variable(&mut self, variable: &Variable) -> TemplateData {
        if variable.is_define_scoped() {
            return match self.find_define(variable.ancestor()) {
                Some(DefineRecord::Param(param)) => self.eval_parameter(&param),
                Some(DefineRecord::Scope(_)) => TemplateData::error(format!(
                    "define \"{}\" holds a scope body, not a value",
                    variable.ancestor()
                )),
                None => self.missing(variable),
            };
        }
        match self.vars.match_key(variable) {
            Some(value) => value,
            None => self.missing(variable),
        }
    }

    fn missing(&self, variable: &Variable) -> TemplateData {
        if variable.is_coalesced() || !self.options.missing_variable_throws {
            TemplateData::true_nil()
        } else {
            TemplateData::error(format!("missing variable \"{}\"", variable))
        }
    }

    fn eval_expression(&mut self, expression: &Expression) -> TemplateData {
        match expression.form() {
            ExpressionForm::Custom => {
                TemplateData::error("declaration used as a value".to_string())
            }
            ExpressionForm::Assignment => match self.perform_assignment(expression) {
                Ok(value) => value,
                Err(error) => TemplateData::error(error.to_string()),
            },
            ExpressionForm::Ternary => {
                let condition = self.eval_parameter(&expression.elements()[0]).evaluate();
                if condition.errored() {
                    return condition;
                }
                if condition.truthy() {
                    self.eval_parameter(&expression.elements()[1])
                } else {
                    self.eval_parameter(&expression.elements()[2])
                }
            }
            ExpressionForm::Calculation => match expression.operator_form() {
                Some(OperatorForm::UnaryPrefix) => {
                    let operand = self.eval_parameter(&expression.elements()[1]).evaluate();
                    if operand.errored() {
                        return operand;
                    }
                    match expression.operator() {
                        Some(Operator::Not) => (!operand.truthy()).into(),
                        other => TemplateData::error(format!(
                            "unsupported prefix operator {:?}",
                            other
                        )),
                    }
                }
                Some(OperatorForm::Infix) => {
                    let operator = match expression.operator() {
                        Some(op) => op,
                        None => return TemplateData::error("expression lost its operator"),
                    };
                    self.eval_infix(operator, expression)
                }
                _ => TemplateData::error("unsupported expression form"),
            },
        }
    }

    fn eval_infix(&mut self, operator: Operator, expression: &Expression) -> TemplateData {
        let lhs_param = &expression.elements()[0];
        let rhs_param = &expression.elements()[2];

        // `??` keeps lazy semantics on the right side.
        if operator == Operator::NilCoalesce {
            let lhs = self.eval_parameter(lhs_param).evaluate();
            return if lhs.is_nil() || lhs.errored() {
                self.eval_parameter(rhs_param)
            } else {
                lhs
            };
        }

        // Logical operators short-circuit and tolerate an errored operand
        // on the side the spec allows.
        match operator {
            Operator::And => {
                let lhs = self.eval_parameter(lhs_param).evaluate();
                if lhs.errored() {
                    return lhs;
                }
                if !lhs.truthy() {
                    return false.into();
                }
                let rhs = self.eval_parameter(rhs_param).evaluate();
                if rhs.errored() {
                    return rhs;
                }
                return rhs.truthy().into();
            }
            Operator::Or => {
                let lhs = self.eval_parameter(lhs_param).evaluate();
                if !lhs.errored() && lhs.truthy() {
                    return true.into();
                }
                let rhs = self.eval_parameter(rhs_param).evaluate();
                if rhs.errored() {
                    return rhs;
                }
                return rhs.truthy().into();
            }
            Operator::Xor => {
                let lhs = self.eval_parameter(lhs_param).evaluate();
                let rhs = self.eval_parameter(rhs_param).evaluate();
                return match (lhs.errored(), rhs.errored()) {
                    (true, true) => lhs,
                    (true, false) => rhs.truthy().into(),
                    (false, true) => lhs.truthy().into(),
                    (false, false) => (lhs.truthy() ^ rhs.truthy()).into(),
                };
            }
            _ => {}
        }

        let lhs = self.eval_parameter(lhs_param).evaluate();
        let rhs = self.eval_parameter(rhs_param).evaluate();
        self.compute_infix(operator, lhs, rhs)
    }

    fn compute_infix(
        &mut self,
        operator: Operator,
        lhs: TemplateData,
        rhs: TemplateData,
    ) -> TemplateData {
        match operator {
            Operator::Subscript => {
                if lhs.errored() {
                    return lhs;
                }
                let result = if let Some(index) = rhs.as_int().filter(|_| {
                    lhs.kind() == DataKind::Array && rhs.kind() != DataKind::String
                }) {
                    usize::try_from(index).ok().and_then(|i| lhs.element(i))
                } else {
                    rhs.as_string().and_then(|key| lhs.member(&key))
                };
                match result {
                    Some(value) => value,
                    None if lhs.is_collection() => TemplateData::true_nil(),
                    None => TemplateData::error(format!(
                        "cannot subscript a {} value",
                        lhs.kind()
                    )),
                }
            }
            Operator::Equal => {
                if lhs.errored() {
                    return lhs;
                }
                if rhs.errored() {
                    return rhs;
                }
                (lhs == rhs).into()
            }
            Operator::NotEqual => match (lhs.errored(), rhs.errored()) {
                (true, true) => lhs,
                (true, false) | (false, true) => true.into(),
                (false, false) => (lhs != rhs).into(),
            },
            Operator::Greater | Operator::GreaterOrEqual | Operator::Lesser
            | Operator::LesserOrEqual => {
                if lhs.errored() {
                    return lhs;
                }
                if rhs.errored() {
                    return rhs;
                }
                self.compare(operator, &lhs, &rhs)
            }
            Operator::Plus
            | Operator::Minus
            | Operator::Multiply
            | Operator::Divide
            | Operator::Modulo => {
                if lhs.errored() {
                    return lhs;
                }
                if rhs.errored() {
                    return rhs;
                }
                self.arithmetic(operator, &lhs, &rhs)
            }
            other => TemplateData::error(format!("operator {} is not computable", other)),
        }
    }

    fn compare(&self, operator: Operator, lhs: &TemplateData, rhs: &TemplateData) -> TemplateData {
        use std::cmp::Ordering;
        let ordering = if lhs.is_numeric() && rhs.is_numeric() {
            match (lhs.as_double(), rhs.as_double()) {
                (Some(l), Some(r)) => l.partial_cmp(&r),
                _ => None,
            }
        } else if lhs.kind() == DataKind::String && rhs.kind() == DataKind::String {
            match (lhs.as_string(), rhs.as_string()) {
                (Some(l), Some(r)) => Some(l.cmp(&r)),
                _ => None,
            }
        } else {
            None
        };
        let Some(ordering) = ordering else {
            return TemplateData::error(format!(
                "cannot compare {} with {}",
                lhs.kind(),
                rhs.kind()
            ));
        };
        match operator {
            Operator::Greater => (ordering == Ordering::Greater).into(),
            Operator::GreaterOrEqual => (ordering != Ordering::Less).into(),
            Operator::Lesser => (ordering == Ordering::Less).into(),
            _ => (ordering != Ordering::Greater).into(),
        }
    }

    fn arithmetic(
        &self,
        operator: Operator,
        lhs: &TemplateData,
        rhs: &TemplateData,
    ) -> TemplateData {
        // String and array concatenation ride on `+`.
        if operator == Operator::Plus {
            if lhs.kind() == DataKind::String || rhs.kind() == DataKind::String {
                if let (Some(l), Some(r)) = (lhs.as_string(), rhs.as_string()) {
                    return format!("{}{}", l, r).into();
                }
            }
            if let (Some(mut l), Some(r)) = (lhs.as_array(), rhs.as_array()) {
                l.extend(r);
                return TemplateData::array(l);
            }
        }

        if lhs.kind() == DataKind::Int && rhs.kind() == DataKind::Int {
            let (Some(l), Some(r)) = (lhs.as_int(), rhs.as_int()) else {
                return TemplateData::error("integer operands unreadable");
            };
            return match operator {
                Operator::Plus => convert::int_add(l, r),
                Operator::Minus => convert::int_subtract(l, r),
                Operator::Multiply => convert::int_multiply(l, r),
                Operator::Divide => convert::int_divide(l, r),
                _ => convert::int_modulo(l, r),
            };
        }

        let (Some(l), Some(r)) = (lhs.as_double(), rhs.as_double()) else {
            return TemplateData::error(format!(
                "cannot apply {} to {} and {}",
                operator,
                lhs.kind(),
                rhs.kind()
            ));
        };
        match operator {
            Operator::Plus => (l + r).into(),
            Operator::Minus => (l - r).into(),
            Operator::Multiply => (l * r).into(),
            Operator::Divide => (l / r).into(),
            _ => (l % r).into(),
        }
    }

    fn eval_tuple(&mut self, tuple: &Tuple) -> TemplateData {
        if let Some(value) = tuple.to_value() {
            return value;
        }
        if tuple.labels().is_empty() {
            let mut values = Vec::with_capacity(tuple.len());
            for param in tuple.values() {
                let value = self.eval_parameter(param).evaluate();
                if value.errored() {
                    return value;
                }
                values.push(value);
            }
            TemplateData::array(values)
        } else if tuple.labels().len() == tuple.len() {
            let mut map = HashMap::new();
            for (index, param) in tuple.values().iter().enumerate() {
                let value = self.eval_parameter(param).evaluate();
                if value.errored() {
                    return value;
                }
                if let Some(label) = tuple.label_of(index) {
                    map.insert(label.to_string(), value);
                }
            }
            TemplateData::dictionary(map)
        } else {
            TemplateData::error("collection literal mixes labeled and unlabeled elements")
        }
    }

    fn eval_call(&mut self, call: &FunctionCall) -> TemplateData {
        let mut values = Vec::with_capacity(call.params.len());
        for param in call.params.values() {
            let value = self.eval_parameter(param).evaluate();
            if value.errored() && call.resolved.is_some() {
                // frozen entities receive concrete values only
                return value;
            }
            values.push(value);
        }
        let labels = call.params.labels().clone();

        match &call.resolved {
            Some(ResolvedCall::Function(entity)) => {
                let mut args = CallValues::new(values, labels);
                if entity.unsafe_entity {
                    if !self.options.grant_unsafe_entity_access {
                        return TemplateData::error(format!(
                            "\"{}\" requires unsafe entity access",
                            entity.name
                        ));
                    }
                    args.grant_unsafe(Arc::clone(&self.unsafe_objects));
                }
                entity.evaluate(&args)
            }
            Some(ResolvedCall::Method(entity)) => {
                let (operand, args) = match &call.operand {
                    Some(Some(variable)) => (
                        self.resolve_variable(variable).evaluate(),
                        CallValues::new(values, labels),
                    ),
                    _ => {
                        let operand = values.first().cloned().unwrap_or_else(TemplateData::true_nil);
                        let rest = values.get(1..).unwrap_or_default().to_vec();
                        (operand, CallValues::positional(rest))
                    }
                };
                if operand.errored() {
                    return operand;
                }
                let (replacement, result) = entity.evaluate(&operand, &args);
                if let (Some(replacement), Some(Some(variable))) = (replacement, &call.operand) {
                    if let Err(error) = self.write_variable(variable, replacement) {
                        return TemplateData::error(error.to_string());
                    }
                }
                result
            }
            None => self.eval_dynamic(call, values),
        }
    }

    /// Dispatch a call left unresolved at parse time, selecting an overload
    /// by the evaluated argument types.
    fn eval_dynamic(&mut self, call: &FunctionCall, values: Vec<TemplateData>) -> TemplateData {
        let build_tuple = |values: &[TemplateData]| {
            let mut tuple = Tuple::new();
            for (index, value) in values.iter().enumerate() {
                tuple.push(
                    call.params.label_of(index).map(str::to_string),
                    Parameter::Value(value.clone()),
                );
            }
            tuple
        };

        match &call.operand {
            None => {
                let tuple = build_tuple(&values);
                let matched =
                    entities::with_registry(|e| e.validate_function(&call.name, &tuple));
                match matched {
                    Ok(Ok(mut matches)) if !matches.is_empty() => {
                        let (entity, normalized) = matches.remove(0);
                        let mut args = self.tuple_to_values(&normalized);
                        if entity.unsafe_entity {
                            if !self.options.grant_unsafe_entity_access {
                                return TemplateData::error(format!(
                                    "\"{}\" requires unsafe entity access",
                                    entity.name
                                ));
                            }
                            args.grant_unsafe(Arc::clone(&self.unsafe_objects));
                        }
                        entity.evaluate(&args)
                    }
                    Ok(Err(error)) => TemplateData::error(error.to_string()),
                    Err(error) => TemplateData::error(error.to_string()),
                    _ => TemplateData::error(format!(
                        "no overload of \"{}\" accepts the call",
                        call.name
                    )),
                }
            }
            Some(slot) => {
                let (operand, args) = match slot {
                    Some(variable) => {
                        (self.resolve_variable(variable).evaluate(), values.as_slice())
                    }
                    None => (
                        values.first().cloned().unwrap_or_else(TemplateData::true_nil),
                        values.get(1..).unwrap_or_default(),
                    ),
                };
                if operand.errored() {
                    return operand;
                }
                let tuple = build_tuple(args);
                let matched = entities::with_registry(|e| {
                    e.validate_method(&call.name, Some(operand.kind()), &tuple)
                });
                match matched {
                    Ok(Ok(mut matches)) if !matches.is_empty() => {
                        let (entity, normalized) = matches.remove(0);
                        if entity.mutating && !matches!(slot, Some(_)) {
                            return TemplateData::error(format!(
                                "mutating method \"{}\" requires an assignable operand",
                                call.name
                            ));
                        }
                        let args = self.tuple_to_values(&normalized);
                        let (replacement, result) = entity.evaluate(&operand, &args);
                        if let (Some(replacement), Some(variable)) = (replacement, slot) {
                            if let Err(error) = self.write_variable(variable, replacement) {
                                return TemplateData::error(error.to_string());
                            }
                        }
                        result
                    }
                    Ok(Err(error)) => TemplateData::error(error.to_string()),
                    Err(error) => TemplateData::error(error.to_string()),
                    _ => TemplateData::error(format!(
                        "no overload of method \"{}\" accepts the call",
                        call.name
                    )),
                }
            }
        }
    }

    /// Evaluate a normalized all-value tuple into call values.
    fn tuple_to_values(&mut self, tuple: &Tuple) -> CallValues {
        let values = tuple
            .values()
            .iter()
            .map(|param| self.eval_parameter(param).evaluate())
            .collect();
        CallValues::new(values, tuple.labels().clone())
    }
}
